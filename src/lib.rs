//! Connection-session core for a true-wireless earbud.
//!
//! The crate decides how the earpiece reacts to link events coming up from
//! the Bluetooth stack: which phones are admitted, which earpiece plays the
//! TWS role, what the user hears, when the device is discoverable, how
//! LE-Audio advertises and how a power-off is sequenced.

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod link;
pub mod policy;
pub mod runtime;
pub mod sim;
pub mod stack;
pub mod store;
pub mod timer;
pub mod types;
