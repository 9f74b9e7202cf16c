//! Virtual-time driver.
//!
//! Runs a [`ConnectionCore`] against a [`ManualClock`], a recording stack
//! and an in-memory event log. Used by the unit tests and by `budlinkd
//! --virtual` to replay traces without waiting for real timers.

use std::{sync::Arc, time::Duration};

use log::debug;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::{
   config::Config,
   connection::{ConnectionCore, CoreInput},
   error::{CoreError, Result},
   event::{AppEvent, EventBus, ToneKind},
   link::{
      dispatcher::{LinkEvent, Verdict},
      registry::DeviceRecord,
   },
   stack::{LinkStack, StackCommand},
   store::{MemoryStore, StoreHandle},
   timer::ManualClock,
   types::{BdAddr, ConnHandle, HciReason, Profile},
};

/// Stack that keeps every submitted command.
#[derive(Debug, Default)]
pub struct RecordingStack {
   commands: Mutex<Vec<StackCommand>>,
}

impl RecordingStack {
   /// Drains the commands recorded so far.
   pub fn take(&self) -> Vec<StackCommand> {
      std::mem::take(&mut *self.commands.lock())
   }
}

impl LinkStack for RecordingStack {
   fn submit(&self, cmd: StackCommand) {
      debug!("stack <- {cmd:?}");
      self.commands.lock().push(cmd);
   }
}

/// Event bus that keeps every emitted event.
#[derive(Debug, Default)]
pub struct EventLog {
   events: Mutex<Vec<AppEvent>>,
}

impl EventLog {
   pub fn take(&self) -> Vec<AppEvent> {
      std::mem::take(&mut *self.events.lock())
   }

   /// Drains the log, keeping only the requested tones.
   pub fn tones(&self) -> Vec<ToneKind> {
      self
         .take()
         .into_iter()
         .filter_map(|event| match event {
            AppEvent::Tone { kind } => Some(kind),
            _ => None,
         })
         .collect()
   }
}

impl EventBus for EventLog {
   fn emit(&self, event: AppEvent) {
      self.events.lock().push(event);
   }
}

/// One line of a replay trace.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceEntry {
   /// Offset from the start of the trace.
   pub at_ms: u64,
   pub input: CoreInput,
}

/// Parses a JSON-lines trace; blank lines and `#` comments are skipped.
pub fn parse_trace(text: &str) -> Result<Vec<TraceEntry>> {
   let mut entries: Vec<TraceEntry> = Vec::new();
   for (index, line) in text.lines().enumerate() {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
         continue;
      }
      let entry: TraceEntry = serde_json::from_str(line).map_err(|e| CoreError::InvalidTrace {
         line: index + 1,
         reason: e.to_string(),
      })?;
      if let Some(last) = entries.last()
         && entry.at_ms < last.at_ms
      {
         return Err(CoreError::InvalidTrace {
            line: index + 1,
            reason: format!("at_ms {} goes back in time", entry.at_ms),
         });
      }
      entries.push(entry);
   }
   Ok(entries)
}

pub struct Simulation {
   pub core: ConnectionCore,
   pub clock: ManualClock,
   pub stack: Arc<RecordingStack>,
   pub events: Arc<EventLog>,
   pub store: StoreHandle,
}

impl Simulation {
   /// Started core over a fresh in-memory store.
   pub fn new(config: Config) -> Result<Self> {
      Self::with_store(config, Arc::new(MemoryStore::new()))
   }

   pub fn with_store(config: Config, store: StoreHandle) -> Result<Self> {
      let clock = ManualClock::new();
      let stack = Arc::new(RecordingStack::default());
      let events = Arc::new(EventLog::default());
      let mut core = ConnectionCore::new(
         config,
         stack.clone(),
         events.clone(),
         store.clone(),
         Arc::new(clock.clone()),
      )?;
      core.start();
      Ok(Self {
         core,
         clock,
         stack,
         events,
         store,
      })
   }

   pub fn now(&self) -> Duration {
      self.clock.now()
   }

   pub fn feed(&mut self, input: CoreInput) -> Verdict {
      self.core.handle(input)
   }

   pub fn link(&mut self, event: LinkEvent) -> Verdict {
      self.feed(CoreInput::Link(event))
   }

   /// Fires every timer due within `by`, in deadline order.
   pub fn advance(&mut self, by: Duration) {
      self.advance_to(self.clock.now() + by);
   }

   pub fn advance_to(&mut self, at: Duration) {
      while let Some(expiry) = self.clock.pop_due(at) {
         self.core.handle(CoreInput::Timer(expiry));
      }
      self.clock.set_now(at);
   }

   /// Feeds a trace, advancing virtual time to each entry's offset.
   pub fn replay(&mut self, entries: &[TraceEntry]) -> Vec<Verdict> {
      let origin = self.clock.now();
      entries
         .iter()
         .map(|entry| {
            self.advance_to(origin + Duration::from_millis(entry.at_ms));
            self.feed(entry.input.clone())
         })
         .collect()
   }

   pub fn record(&self, addr: BdAddr) -> Option<&DeviceRecord> {
      let key = self.core.registry.find_by_address(addr)?;
      self.core.registry.get(key)
   }

   /// ACL up from the phone followed by A2DP.
   pub fn connect_phone(&mut self, addr: BdAddr, handle: ConnHandle) {
      self.link(LinkEvent::AclConnected {
         addr,
         handle,
         phone_initiated: true,
         is_tws: Some(false),
      });
      self.link(LinkEvent::ProfileConnected {
         handle,
         profile: Profile::A2dp,
      });
   }

   pub fn drop_link(&mut self, addr: BdAddr, handle: ConnHandle, reason: HciReason) {
      self.link(LinkEvent::AclDisconnected {
         addr,
         handle,
         reason,
         remote_forced: false,
      });
   }
}
