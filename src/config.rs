//! Configuration management for the session core.
//!
//! This module handles loading and saving configuration from disk,
//! including the TWS recognition rules, notification policy and the
//! delays of every timer-driven behaviour.

use std::{env, fs, path::PathBuf, time::Duration};

use log::warn;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
   error::{CoreError, Result},
   link::registry::REGISTRY_CAPACITY,
};

/// Main configuration structure for the core.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   /// Local device name, used when the property store holds none.
   #[serde(default = "default_device_name")]
   pub device_name: String,

   #[serde(default = "default_max_phones")]
   pub max_phones: u8,

   /// Hex MAC prefix the TWS peer must carry, e.g. `"a1b2c3"`.
   #[serde(default)]
   pub tws_mac_prefix: Option<String>,

   /// How many leading characters of the local name the peer must share.
   #[serde(default = "default_tws_name_match")]
   pub tws_name_match: usize,

   /// Hex OUIs of platforms announced on A2DP signaling instead of A2DP.
   #[serde(default)]
   pub signaling_notify_ouis: Vec<String>,

   /// Swallow the disconnect tone when a link is lost to a timeout.
   #[serde(default)]
   pub shield_timeout_tone: bool,

   /// Discoverable window after start or a disconnect; 0 keeps it open.
   #[serde(default = "default_wait_connect_secs")]
   pub wait_connect_secs: u64,

   #[serde(default = "default_pairing_duration_secs")]
   pub pairing_duration_secs: u64,

   #[serde(default = "default_lea_multipoint_limit")]
   pub lea_multipoint_limit: u8,

   #[serde(default)]
   pub lea_single_point: bool,

   #[serde(default = "default_reconnect_attempts")]
   pub reconnect_attempts: u32,

   #[serde(default = "default_reconnect_base_delay_ms")]
   pub reconnect_base_delay_ms: u64,

   #[serde(default = "default_reconnect_max_delay_ms")]
   pub reconnect_max_delay_ms: u64,

   #[serde(default = "default_resume_play_delay_ms")]
   pub resume_play_delay_ms: u64,

   #[serde(default = "default_sco_disconnect_delay_ms")]
   pub sco_disconnect_delay_ms: u64,

   /// HID keep-alive period; 0 disables it.
   #[serde(default = "default_hid_keepalive_secs")]
   pub hid_keepalive_secs: u64,

   /// Grace period before an ACL without audio profiles is dropped; 0 disables it.
   #[serde(default = "default_profile_grace_secs")]
   pub profile_grace_secs: u64,

   #[serde(default = "default_tws_teardown_timeout_ms")]
   pub tws_teardown_timeout_ms: u64,

   /// Property store location; defaults to the local data directory.
   #[serde(default)]
   pub store_path: Option<PathBuf>,
}

fn default_device_name() -> String {
   "budlink".to_string()
}

const fn default_max_phones() -> u8 {
   2
}

const fn default_tws_name_match() -> usize {
   8
}

const fn default_wait_connect_secs() -> u64 {
   180
}

const fn default_pairing_duration_secs() -> u64 {
   120
}

const fn default_lea_multipoint_limit() -> u8 {
   2
}

const fn default_reconnect_attempts() -> u32 {
   3
}

const fn default_reconnect_base_delay_ms() -> u64 {
   2000
}

const fn default_reconnect_max_delay_ms() -> u64 {
   30_000
}

const fn default_resume_play_delay_ms() -> u64 {
   1500
}

const fn default_sco_disconnect_delay_ms() -> u64 {
   1000
}

const fn default_hid_keepalive_secs() -> u64 {
   30
}

const fn default_profile_grace_secs() -> u64 {
   10
}

const fn default_tws_teardown_timeout_ms() -> u64 {
   2000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         device_name: default_device_name(),
         max_phones: default_max_phones(),
         tws_mac_prefix: None,
         tws_name_match: default_tws_name_match(),
         signaling_notify_ouis: vec![],
         shield_timeout_tone: false,
         wait_connect_secs: default_wait_connect_secs(),
         pairing_duration_secs: default_pairing_duration_secs(),
         lea_multipoint_limit: default_lea_multipoint_limit(),
         lea_single_point: false,
         reconnect_attempts: default_reconnect_attempts(),
         reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
         reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
         resume_play_delay_ms: default_resume_play_delay_ms(),
         sco_disconnect_delay_ms: default_sco_disconnect_delay_ms(),
         hid_keepalive_secs: default_hid_keepalive_secs(),
         profile_grace_secs: default_profile_grace_secs(),
         tws_teardown_timeout_ms: default_tws_teardown_timeout_ms(),
         store_path: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BUDLINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(CoreError::ConfigDirNotFound);
      };

      Ok(config_dir.join("budlink").join("config.toml"))
   }

   /// Simultaneous phone links, bounded so one registry slot stays free
   /// for the TWS peer.
   pub fn phone_limit(&self) -> u8 {
      self.max_phones.clamp(1, REGISTRY_CAPACITY as u8 - 1)
   }

   pub fn tws_mac_prefix_bytes(&self) -> Result<SmallVec<[u8; 6]>> {
      let Some(prefix) = &self.tws_mac_prefix else {
         return Ok(SmallVec::new());
      };
      let mut bytes: SmallVec<[u8; 6]> = hex::decode(prefix.replace(':', ""))?.into();
      bytes.truncate(6);
      Ok(bytes)
   }

   /// Parsed `signaling_notify_ouis`; malformed entries are skipped.
   pub fn signaling_ouis(&self) -> SmallVec<[[u8; 3]; 4]> {
      self
         .signaling_notify_ouis
         .iter()
         .filter_map(|entry| {
            let parsed = hex::decode(entry.replace(':', ""))
               .ok()
               .and_then(|bytes| <[u8; 3]>::try_from(bytes.as_slice()).ok());
            if parsed.is_none() {
               warn!("Ignoring malformed OUI in signaling_notify_ouis: {entry}");
            }
            parsed
         })
         .collect()
   }

   pub fn wait_connect_window(&self) -> Option<Duration> {
      (self.wait_connect_secs > 0).then(|| Duration::from_secs(self.wait_connect_secs))
   }

   pub const fn pairing_duration(&self) -> Duration {
      Duration::from_secs(self.pairing_duration_secs)
   }

   pub const fn resume_play_delay(&self) -> Duration {
      Duration::from_millis(self.resume_play_delay_ms)
   }

   pub const fn sco_disconnect_delay(&self) -> Duration {
      Duration::from_millis(self.sco_disconnect_delay_ms)
   }

   pub fn hid_keepalive(&self) -> Option<Duration> {
      (self.hid_keepalive_secs > 0).then(|| Duration::from_secs(self.hid_keepalive_secs))
   }

   pub fn profile_grace(&self) -> Option<Duration> {
      (self.profile_grace_secs > 0).then(|| Duration::from_secs(self.profile_grace_secs))
   }

   pub const fn tws_teardown_timeout(&self) -> Duration {
      Duration::from_millis(self.tws_teardown_timeout_ms)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_empty_toml_uses_defaults() {
      let config: Config = toml::from_str("").unwrap();
      assert_eq!(config.max_phones, 2);
      assert_eq!(config.wait_connect_secs, 180);
      assert_eq!(config.reconnect_attempts, 3);
      assert!(!config.shield_timeout_tone);
      assert!(config.tws_mac_prefix.is_none());
   }

   #[test]
   fn test_partial_toml_overrides() {
      let config: Config = toml::from_str(
         r#"
         device_name = "Pods"
         max_phones = 9
         shield_timeout_tone = true
         tws_mac_prefix = "a1:b2:c3"
         signaling_notify_ouis = ["001122", "zz", "aabbcc"]
         hid_keepalive_secs = 0
         "#,
      )
      .unwrap();
      assert_eq!(config.device_name, "Pods");
      assert_eq!(config.phone_limit(), REGISTRY_CAPACITY as u8 - 1);
      assert!(config.shield_timeout_tone);
      assert_eq!(config.tws_mac_prefix_bytes().unwrap().as_slice(), &[0xA1, 0xB2, 0xC3]);
      assert_eq!(config.signaling_ouis().as_slice(), &[[0x00, 0x11, 0x22], [0xAA, 0xBB, 0xCC]]);
      assert!(config.hid_keepalive().is_none());
      assert_eq!(config.profile_grace(), Some(Duration::from_secs(10)));
   }

   #[test]
   fn test_round_trip_through_toml() {
      let config = Config {
         wait_connect_secs: 0,
         ..Config::default()
      };
      let text = toml::to_string_pretty(&config).unwrap();
      let back: Config = toml::from_str(&text).unwrap();
      assert!(back.wait_connect_window().is_none());
   }
}
