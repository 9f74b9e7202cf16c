//! Outbound command seam toward the vendor Bluetooth stack.
//!
//! Commands are fire-and-forget: their completion comes back later as an
//! ordinary link event on the dispatch context, never inline.

use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::{
   link::status::ScanMode,
   policy::lea::AdvParams,
   types::{BdAddr, ConnHandle, HciReason},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum StackCommand {
   SetScanMode { mode: ScanMode },
   /// Page a remembered phone.
   Connect { addr: BdAddr },
   /// Abort outstanding pages, except toward `keep`.
   CancelPage { keep: Option<BdAddr> },
   Disconnect { handle: ConnHandle, reason: HciReason },
   DisconnectAllPhones,
   DisconnectSco { handle: ConnHandle },
   ResumePlay { handle: ConnHandle },
   HidKeepAlive { handle: ConnHandle },
   StartTwsSearch,
   StopTwsSearch,
   ClearPairedList,
   BeginTwsTeardown,
   SyncPeerInfo,
   LeAdvertise { params: AdvParams },
}

/// Sink for stack commands.
pub trait LinkStack: Send + Sync {
   fn submit(&self, cmd: StackCommand);
}

pub type StackSender = Arc<dyn LinkStack>;

/// Stack stand-in that only logs what it is asked to do.
#[derive(Debug, Default)]
pub struct LoggingStack;

impl LinkStack for LoggingStack {
   fn submit(&self, cmd: StackCommand) {
      info!("stack <- {cmd:?}");
   }
}
