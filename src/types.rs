//! Identity and code types shared by the link-layer components.
//!
//! Addresses, connection handles, HCI disconnect reasons and the small
//! role/profile enumerations that flow between the stack callbacks and the
//! session core.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smol_str::{SmolStr, ToSmolStr};

use crate::error::CoreError;

/// A Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
   pub const EMPTY: Self = Self([0; 6]);

   pub const fn new(bytes: [u8; 6]) -> Self {
      Self(bytes)
   }

   /// The all-zero address, used by stacks to mean "no peer".
   pub fn is_empty(&self) -> bool {
      self.0 == [0; 6]
   }

   /// Vendor OUI (upper three bytes).
   pub const fn oui(&self) -> [u8; 3] {
      [self.0[0], self.0[1], self.0[2]]
   }

   pub fn starts_with(&self, prefix: &[u8]) -> bool {
      self.0.starts_with(prefix)
   }

   /// Lowercase hex without separators, used for property-store keys.
   pub fn to_hex(&self) -> SmolStr {
      hex::encode(self.0).to_smolstr()
   }
}

impl fmt::Display for BdAddr {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for BdAddr {
   type Err = CoreError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let mut bytes = [0u8; 6];
      let mut parts = s.split(':');
      for byte in &mut bytes {
         let part = parts
            .next()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| CoreError::InvalidAddress(s.to_smolstr()))?;
         *byte =
            u8::from_str_radix(part, 16).map_err(|_| CoreError::InvalidAddress(s.to_smolstr()))?;
      }
      if parts.next().is_some() {
         return Err(CoreError::InvalidAddress(s.to_smolstr()));
      }
      Ok(Self(bytes))
   }
}

impl Serialize for BdAddr {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for BdAddr {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = SmolStr::deserialize(deserializer)?;
      s.parse().map_err(serde::de::Error::custom)
   }
}

/// Stack-assigned ACL connection handle. Zero is never a live link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnHandle(pub u16);

impl ConnHandle {
   pub const fn is_valid(self) -> bool {
      self.0 != 0
   }
}

impl fmt::Display for ConnHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:#06x}", self.0)
   }
}

/// HCI disconnect reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HciReason(pub u8);

impl HciReason {
   pub const PAGE_TIMEOUT: Self = Self(0x04);
   pub const CONNECTION_TIMEOUT: Self = Self(0x08);
   pub const CONNECTION_ACCEPT_TIMEOUT: Self = Self(0x10);
   pub const REMOTE_USER_TERMINATED: Self = Self(0x13);
   pub const REMOTE_LOW_RESOURCES: Self = Self(0x14);
   pub const LOCAL_HOST_TERMINATED: Self = Self(0x16);
   pub const LL_RESPONSE_TIMEOUT: Self = Self(0x22);

   /// Link loss rather than a deliberate unlink.
   pub const fn is_timeout_class(self) -> bool {
      matches!(self.0, 0x04 | 0x08 | 0x10 | 0x14 | 0x22)
   }

   /// The host stack drops the link locally (0x16) when the bonded link key
   /// is missing; that case is recovered by re-pairing, not announced.
   pub const fn is_key_missing(self) -> bool {
      self.0 == Self::LOCAL_HOST_TERMINATED.0
   }

   /// Either side hung up on purpose.
   pub const fn is_clean_unlink(self) -> bool {
      matches!(self.0, 0x13 | 0x16)
   }
}

impl fmt::Display for HciReason {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:#04x}", self.0)
   }
}

/// Classic profiles tracked per link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
   Hfp,
   A2dp,
   Avrcp,
   Spp,
   Hid,
   A2dpSignaling,
}

/// What the remote told us it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum RemoteRole {
   #[default]
   Phone,
   TwsPeer,
}

/// Baseband role of one ACL link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
   Master,
   Slave,
}

/// Local role within the earpiece pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum TwsRole {
   #[default]
   Standalone,
   /// Relay master: owns the phone links and forwards over the snoop link.
   Master,
   /// Subordinate earpiece: never visible to phones.
   Slave,
}
