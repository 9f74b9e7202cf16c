//! Device-wide policies layered over the link state.

pub mod lea;
pub mod power_off;
pub mod reconnect;
