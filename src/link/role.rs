//! TWS peer recognition.
//!
//! A candidate is taken for the other earpiece when its MAC carries the
//! expected prefix and its advertised name starts like ours.

use log::debug;
use serde::Deserialize;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::types::BdAddr;

/// A device seen during a TWS search.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Candidate {
   pub addr: BdAddr,
   #[serde(default)]
   pub name: SmolStr,
}

/// Recognition rules, resolved once at start from config and the store.
#[derive(Debug, Clone, Default)]
pub struct RoleCheck {
   /// Leading MAC bytes the peer must carry; empty matches any address.
   pub mac_prefix: SmallVec<[u8; 6]>,
   pub local_name: SmolStr,
   /// Leading characters of `local_name` that must match.
   pub name_match: usize,
}

impl RoleCheck {
   /// Prefix from config, else the OUI of our own stored address.
   pub fn new(
      configured_prefix: SmallVec<[u8; 6]>,
      local_addr: Option<BdAddr>,
      local_name: SmolStr,
      name_match: usize,
   ) -> Self {
      let mac_prefix = if configured_prefix.is_empty() {
         local_addr
            .map(|addr| SmallVec::from_slice(&addr.oui()))
            .unwrap_or_default()
      } else {
         configured_prefix
      };
      Self {
         mac_prefix,
         local_name,
         name_match,
      }
   }
}

fn name_matches(candidate: &str, local: &str, chars: usize) -> bool {
   let mut expected = local.chars().take(chars).flat_map(char::to_lowercase);
   let mut actual = candidate.chars().flat_map(char::to_lowercase);
   loop {
      match (expected.next(), actual.next()) {
         (None, _) => return true,
         (Some(_), None) => return false,
         (Some(e), Some(a)) if e != a => return false,
         _ => {},
      }
   }
}

pub fn is_tws_candidate(candidate: &Candidate, check: &RoleCheck) -> bool {
   if candidate.addr.is_empty() {
      return false;
   }
   if !candidate.addr.starts_with(&check.mac_prefix) {
      debug!("{}: MAC prefix mismatch", candidate.addr);
      return false;
   }
   if check.local_name.is_empty() || candidate.name.is_empty() {
      debug!("{}: no name to compare", candidate.addr);
      return false;
   }
   let matched = name_matches(&candidate.name, &check.local_name, check.name_match);
   if !matched {
      debug!("{}: name {:?} does not match", candidate.addr, candidate.name);
   }
   matched
}
