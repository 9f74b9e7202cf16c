//! Persisted-property touchpoints.
//!
//! The core reads and writes a handful of properties (local name and
//! address, per-device volume, the remembered LE-Audio peer) through an
//! opaque key-value interface. [`HeedStore`] keeps them in LMDB via heed;
//! [`MemoryStore`] is the volatile variant.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use heed::{
   Database, Env, EnvOpenOptions,
   types::{Bytes, Str},
};
use log::{info, warn};
use parking_lot::Mutex;
use smol_str::{SmolStr, format_smolstr};

use crate::{
   error::{CoreError, Result},
   types::BdAddr,
};

/// Keys used by the core.
pub mod keys {
   use super::*;

   pub const LOCAL_NAME: &str = "bt.local_name";
   pub const LOCAL_ADDR: &str = "bt.local_addr";
   pub const LEA_PEER: &str = "lea.peer";
   pub const VOLUME_PREFIX: &str = "vol.";

   pub fn volume(addr: BdAddr) -> SmolStr {
      format_smolstr!("{VOLUME_PREFIX}{}", addr.to_hex())
   }
}

/// Opaque key-value property store.
pub trait PropertyStore: Send + Sync {
   fn get(&self, key: &str) -> Option<Vec<u8>>;
   fn set(&self, key: &str, value: &[u8]) -> Result<()>;
   fn remove(&self, key: &str) -> Result<()>;
   fn keys_with_prefix(&self, prefix: &str) -> Vec<SmolStr>;
}

pub type StoreHandle = Arc<dyn PropertyStore>;

/// Reads a stored address, ignoring malformed values.
pub fn load_addr(store: &dyn PropertyStore, key: &str) -> Option<BdAddr> {
   let bytes = store.get(key)?;
   let Ok(raw) = <[u8; 6]>::try_from(bytes.as_slice()) else {
      warn!("Ignoring malformed address under {key}");
      return None;
   };
   Some(BdAddr(raw)).filter(|addr| !addr.is_empty())
}

/// In-memory store; contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
   props: Mutex<BTreeMap<SmolStr, Vec<u8>>>,
}

impl MemoryStore {
   pub fn new() -> Self {
      Self::default()
   }
}

impl PropertyStore for MemoryStore {
   fn get(&self, key: &str) -> Option<Vec<u8>> {
      self.props.lock().get(key).cloned()
   }

   fn set(&self, key: &str, value: &[u8]) -> Result<()> {
      self.props.lock().insert(key.into(), value.to_vec());
      Ok(())
   }

   fn remove(&self, key: &str) -> Result<()> {
      self.props.lock().remove(key);
      Ok(())
   }

   fn keys_with_prefix(&self, prefix: &str) -> Vec<SmolStr> {
      self
         .props
         .lock()
         .keys()
         .filter(|k| k.starts_with(prefix))
         .cloned()
         .collect()
   }
}

/// LMDB-backed store.
#[derive(Debug)]
pub struct HeedStore {
   env: Env,
   props: Database<Str, Bytes>,
}

impl HeedStore {
   /// Open or create the property database at `path`.
   pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
      let path = path.into();
      std::fs::create_dir_all(&path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(1024 * 1024)
            .max_dbs(1)
            .open(&path)?
      };

      let mut wtxn = env.write_txn()?;
      let props = env.create_database(&mut wtxn, Some("props"))?;
      wtxn.commit()?;

      info!("Opened property store at {}", path.display());
      Ok(Self { env, props })
   }

   /// `$BUDLINK_STORE_PATH`, else `~/.local/share/budlink/props`.
   pub fn default_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("BUDLINK_STORE_PATH") {
         return Ok(PathBuf::from(path));
      }
      let base = dirs::data_local_dir().ok_or(CoreError::DataDirNotFound)?;
      Ok(base.join("budlink").join("props"))
   }

   fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
      let rtxn = self.env.read_txn()?;
      Ok(self.props.get(&rtxn, key)?.map(<[u8]>::to_vec))
   }
}

impl PropertyStore for HeedStore {
   fn get(&self, key: &str) -> Option<Vec<u8>> {
      self.read(key).unwrap_or_else(|e| {
         warn!("Property read {key} failed: {e}");
         None
      })
   }

   fn set(&self, key: &str, value: &[u8]) -> Result<()> {
      let mut wtxn = self.env.write_txn()?;
      self.props.put(&mut wtxn, key, value)?;
      wtxn.commit()?;
      Ok(())
   }

   fn remove(&self, key: &str) -> Result<()> {
      let mut wtxn = self.env.write_txn()?;
      self.props.delete(&mut wtxn, key)?;
      wtxn.commit()?;
      Ok(())
   }

   fn keys_with_prefix(&self, prefix: &str) -> Vec<SmolStr> {
      let scan = || -> Result<Vec<SmolStr>> {
         let rtxn = self.env.read_txn()?;
         let mut keys = Vec::new();
         for entry in self.props.iter(&rtxn)? {
            let (key, _) = entry?;
            if key.starts_with(prefix) {
               keys.push(SmolStr::new(key));
            }
         }
         Ok(keys)
      };
      scan().unwrap_or_else(|e| {
         warn!("Property scan {prefix}* failed: {e}");
         Vec::new()
      })
   }
}
