//! Auto-reconnect toward phones lost to a link timeout.

use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;

use crate::{
   config::Config,
   link::registry::REGISTRY_CAPACITY,
   stack::{LinkStack, StackCommand},
   timer::{DelayedAction, Expiry, TimerKind, Timers, take_if_live},
   types::BdAddr,
};

#[derive(Debug)]
pub struct ReconnectEntry {
   pub addr: BdAddr,
   /// Pages already issued.
   pub attempt: u32,
   pub need_resume_play: bool,
   timer: Option<DelayedAction>,
}

#[derive(Debug)]
pub struct ReconnectQueue {
   entries: heapless::Vec<ReconnectEntry, REGISTRY_CAPACITY>,
   attempts: u32,
   base_delay: Duration,
   max_delay: Duration,
}

impl ReconnectQueue {
   pub fn new(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
      Self {
         entries: heapless::Vec::new(),
         attempts,
         base_delay,
         max_delay: max_delay.max(base_delay),
      }
   }

   pub fn from_config(config: &Config) -> Self {
      Self::new(
         config.reconnect_attempts,
         Duration::from_millis(config.reconnect_base_delay_ms),
         Duration::from_millis(config.reconnect_max_delay_ms),
      )
   }

   /// Queues `addr`, replacing any earlier entry for it.
   pub fn schedule(&mut self, addr: BdAddr, need_resume_play: bool, timers: &mut Timers) -> bool {
      if self.attempts == 0 {
         return false;
      }
      self.take(addr);
      let delay = calc_retry_delay(0, self.base_delay, self.max_delay);
      let entry = ReconnectEntry {
         addr,
         attempt: 0,
         need_resume_play,
         timer: Some(timers.start(delay, TimerKind::Reconnect(addr))),
      };
      if self.entries.push(entry).is_err() {
         warn!("Reconnect queue full, not reconnecting {addr}");
         return false;
      }
      info!("Reconnecting {addr} in {delay:?}");
      true
   }

   /// Pages the device whose timer fired; re-arms until attempts run out.
   pub fn on_timer(&mut self, expiry: &Expiry, timers: &mut Timers, stack: &dyn LinkStack) -> bool {
      let TimerKind::Reconnect(addr) = expiry.kind else {
         return false;
      };
      let Some(pos) = self.entries.iter().position(|e| e.addr == addr) else {
         debug!("Reconnect timer for {addr} with no entry");
         return false;
      };
      let (attempts, base, max) = (self.attempts, self.base_delay, self.max_delay);
      let entry = &mut self.entries[pos];
      if !take_if_live(&mut entry.timer, expiry) {
         return false;
      }

      entry.attempt += 1;
      info!("Reconnect attempt {}/{attempts} to {addr}", entry.attempt);
      stack.submit(StackCommand::Connect { addr });

      if entry.attempt < attempts {
         let delay = calc_retry_delay(entry.attempt, base, max);
         entry.timer = Some(timers.start(delay, TimerKind::Reconnect(addr)));
      } else {
         info!("Giving up on {addr} after {attempts} attempts");
         self.entries.swap_remove(pos);
      }
      true
   }

   /// Consumes the entry for `addr`: the device is back.
   pub fn take(&mut self, addr: BdAddr) -> Option<ReconnectEntry> {
      let pos = self.entries.iter().position(|e| e.addr == addr)?;
      let mut entry = self.entries.swap_remove(pos);
      entry.timer = None;
      Some(entry)
   }

   pub fn cancel_except(&mut self, keep: BdAddr) -> usize {
      let before = self.entries.len();
      self.entries.retain(|e| e.addr == keep);
      before - self.entries.len()
   }

   pub fn clear(&mut self) {
      if !self.entries.is_empty() {
         debug!("Dropping {} pending reconnect(s)", self.entries.len());
      }
      self.entries.clear();
   }

   pub fn contains(&self, addr: BdAddr) -> bool {
      self.entries.iter().any(|e| e.addr == addr)
   }

   pub fn len(&self) -> usize {
      self.entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }
}

fn calc_retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
   let exponential = base * (1 << attempt.min(4));
   let delay = exponential.min(max);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
