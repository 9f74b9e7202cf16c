//! Outbound notifications for the UI/application layer.
//!
//! The core never plays tones or drives UI itself; it emits these events
//! and lets the application decide how to present them.

use std::sync::Arc;

use serde::Serialize;

use crate::{
   link::status::{ScanMode, Status},
   policy::lea::AdvParams,
   types::{BdAddr, TwsRole},
};

/// Prompt tones requested by the status aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "tone", content = "role", rename_all = "snake_case")]
pub enum ToneKind {
   FirstConnected,
   SecondConnected,
   /// Same device came back within its session.
   Reconnected,
   Disconnected,
   TwsConnected(TwsRole),
   TwsDisconnected(TwsRole),
}

/// Outcome of one power-off cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum PowerOffResult {
   Ok,
   Timeout,
   SyncOk,
   SyncTimeout,
}

/// Events that can be emitted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AppEvent {
   BtReady,
   StatusChanged { status: Status, tone: bool },
   Tone { kind: ToneKind },
   /// The last phone link went away.
   Unlinked,
   TwsConnected { addr: BdAddr },
   TwsDisconnected { addr: BdAddr },
   PowerOff { result: PowerOffResult },
   ScanModeChanged { mode: ScanMode },
   LeAdvertising { params: AdvParams },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: AppEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
