//! Error types for the session core.
//!
//! Steady-state anomalies never surface as errors (they are logged and
//! absorbed); these variants cover start-up, persistence, trace parsing and
//! the few registry contracts a caller can violate.

use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the session core.
#[derive(Error, Debug)]
pub enum CoreError {
   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Property store error: {0}")]
   Store(#[from] heed::Error),

   #[error("Invalid hex string: {0}")]
   Hex(#[from] hex::FromHexError),

   #[error("Invalid Bluetooth address: {0}")]
   InvalidAddress(SmolStr),

   #[error("Invalid connection handle")]
   InvalidHandle,

   #[error("Device registry is full")]
   RegistryFull,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("Could not determine data directory")]
   DataDirNotFound,

   #[error("Session core has been shut down")]
   CoreShutdown,

   #[error("Invalid trace entry on line {line}: {reason}")]
   InvalidTrace { line: usize, reason: String },
}

/// Convenience type alias for Results with `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;
