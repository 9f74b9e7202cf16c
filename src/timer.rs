//! Owned, cancel-on-drop delayed actions.
//!
//! Every timer in the core is a [`DelayedAction`] stored in the state that
//! owns it. Dropping the action cancels it, and every expiry carries the
//! sequence number of the action that armed it, so an expiry that races a
//! cancellation (or a re-arm) is recognised as stale and ignored.

use std::{
   collections::BTreeMap,
   fmt,
   sync::{Arc, Weak},
   time::Duration,
};

use parking_lot::Mutex;

use crate::{link::registry::DeviceKey, types::BdAddr};

/// Per-device delayed actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceTimer {
   ResumePlay,
   ScoDisconnect,
   HidKeepAlive,
   ProfileGrace,
}

/// Identifies the owner an expiry is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
   Device(DeviceKey, DeviceTimer),
   PowerOff,
   Lea,
   WaitConnect,
   PairMode,
   Reconnect(BdAddr),
}

/// A fired timer, as delivered back to the dispatch context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Expiry {
   pub kind: TimerKind,
   pub seq: u64,
}

pub type Cancel = Box<dyn FnOnce() + Send>;

/// Backend that delivers expiries later; the returned closure cancels.
pub trait Scheduler: Send + Sync {
   fn arm(&self, delay: Duration, expiry: Expiry) -> Cancel;
}

/// A pending timer owned by exactly one piece of state.
pub struct DelayedAction {
   expiry: Expiry,
   cancel: Option<Cancel>,
}

impl DelayedAction {
   pub const fn kind(&self) -> TimerKind {
      self.expiry.kind
   }

   pub const fn seq(&self) -> u64 {
      self.expiry.seq
   }

   pub fn matches(&self, expiry: &Expiry) -> bool {
      self.expiry == *expiry
   }
}

impl fmt::Debug for DelayedAction {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("DelayedAction")
         .field("kind", &self.expiry.kind)
         .field("seq", &self.expiry.seq)
         .finish()
   }
}

impl Drop for DelayedAction {
   fn drop(&mut self) {
      if let Some(cancel) = self.cancel.take() {
         cancel();
      }
   }
}

/// Consumes the action in `slot` if `expiry` is the one it armed.
pub fn take_if_live(slot: &mut Option<DelayedAction>, expiry: &Expiry) -> bool {
   if slot.as_ref().is_some_and(|action| action.matches(expiry)) {
      *slot = None;
      true
   } else {
      false
   }
}

/// Arms delayed actions with unique sequence numbers.
pub struct Timers {
   scheduler: Arc<dyn Scheduler>,
   next_seq: u64,
}

impl Timers {
   pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
      Self {
         scheduler,
         next_seq: 1,
      }
   }

   pub fn start(&mut self, delay: Duration, kind: TimerKind) -> DelayedAction {
      let expiry = Expiry {
         kind,
         seq: self.next_seq,
      };
      self.next_seq += 1;
      DelayedAction {
         expiry,
         cancel: Some(self.scheduler.arm(delay, expiry)),
      }
   }
}

#[derive(Default)]
struct ClockInner {
   now: Duration,
   pending: BTreeMap<(Duration, u64), Expiry>,
}

/// Virtual clock: expiries only fire when the driver pops them.
#[derive(Clone, Default)]
pub struct ManualClock {
   inner: Arc<Mutex<ClockInner>>,
}

impl ManualClock {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn now(&self) -> Duration {
      self.inner.lock().now
   }

   /// Number of armed, uncancelled timers.
   pub fn pending(&self) -> usize {
      self.inner.lock().pending.len()
   }

   /// Deadline of the earliest armed timer.
   pub fn next_deadline(&self) -> Option<Duration> {
      self.inner.lock().pending.keys().next().map(|(at, _)| *at)
   }

   /// Pops the earliest expiry due at or before `deadline`, moving the clock
   /// to that expiry's deadline.
   pub fn pop_due(&self, deadline: Duration) -> Option<Expiry> {
      let mut inner = self.inner.lock();
      let key = *inner.pending.keys().next()?;
      if key.0 > deadline {
         return None;
      }
      inner.now = inner.now.max(key.0);
      inner.pending.remove(&key)
   }

   /// Moves the clock forward; never backwards.
   pub fn set_now(&self, at: Duration) {
      let mut inner = self.inner.lock();
      inner.now = inner.now.max(at);
   }
}

impl Scheduler for ManualClock {
   fn arm(&self, delay: Duration, expiry: Expiry) -> Cancel {
      let key = {
         let mut inner = self.inner.lock();
         let key = (inner.now + delay, expiry.seq);
         inner.pending.insert(key, expiry);
         key
      };
      let weak: Weak<Mutex<ClockInner>> = Arc::downgrade(&self.inner);
      Box::new(move || {
         if let Some(inner) = weak.upgrade() {
            inner.lock().pending.remove(&key);
         }
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn timers() -> (Timers, ManualClock) {
      let clock = ManualClock::new();
      (Timers::new(Arc::new(clock.clone())), clock)
   }

   #[test]
   fn test_drop_cancels() {
      let (mut timers, clock) = timers();
      let action = timers.start(Duration::from_secs(1), TimerKind::Lea);
      assert_eq!(clock.pending(), 1);
      drop(action);
      assert_eq!(clock.pending(), 0);
      assert!(clock.pop_due(Duration::from_secs(5)).is_none());
   }

   #[test]
   fn test_pop_due_in_deadline_order() {
      let (mut timers, clock) = timers();
      let _late = timers.start(Duration::from_secs(3), TimerKind::WaitConnect);
      let _early = timers.start(Duration::from_secs(1), TimerKind::Lea);

      assert!(clock.pop_due(Duration::from_millis(500)).is_none());
      let first = clock.pop_due(Duration::from_secs(10)).unwrap();
      assert_eq!(first.kind, TimerKind::Lea);
      assert_eq!(clock.now(), Duration::from_secs(1));
      let second = clock.pop_due(Duration::from_secs(10)).unwrap();
      assert_eq!(second.kind, TimerKind::WaitConnect);
      assert_eq!(clock.now(), Duration::from_secs(3));
   }

   #[test]
   fn test_rearm_makes_old_expiry_stale() {
      let (mut timers, clock) = timers();
      let mut slot = Some(timers.start(Duration::from_secs(1), TimerKind::PowerOff));
      let stale = Expiry {
         kind: TimerKind::PowerOff,
         seq: slot.as_ref().unwrap().seq(),
      };
      slot = Some(timers.start(Duration::from_secs(2), TimerKind::PowerOff));
      assert_eq!(clock.pending(), 1);
      assert!(!take_if_live(&mut slot, &stale));
      assert!(slot.is_some());

      let live = clock.pop_due(Duration::from_secs(2)).unwrap();
      assert!(take_if_live(&mut slot, &live));
      assert!(slot.is_none());
   }

   #[test]
   fn test_cancel_after_clock_dropped_is_harmless() {
      let clock = ManualClock::new();
      let mut timers = Timers::new(Arc::new(clock.clone()));
      let action = timers.start(Duration::from_secs(1), TimerKind::Lea);
      drop(timers);
      drop(clock);
      drop(action);
   }
}
