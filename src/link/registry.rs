//! Fixed-capacity table of per-remote-device records.
//!
//! The registry owns storage and lookup only; policy lives in the
//! dispatcher and the status aggregator. Records are addressed by a
//! generation-checked [`DeviceKey`], so a key (or a timer carrying one) that
//! outlives its record can never reach the record that later reuses the
//! slot.

use log::debug;
use serde::Serialize;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::{
   error::{CoreError, Result},
   timer::{DelayedAction, DeviceTimer},
   types::{BdAddr, ConnHandle, LinkRole},
};

/// Maximum simultaneously known remote devices.
pub const REGISTRY_CAPACITY: usize = 4;

/// Generation-checked handle to a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
   index: u8,
   generation: u32,
}

/// Per-profile connection state of one link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProfileFlags {
   pub hf: bool,
   pub a2dp: bool,
   pub avrcp: bool,
   pub spp: u8,
   pub hid: bool,
   pub a2dp_signaling: bool,
}

impl ProfileFlags {
   /// HF or A2DP up.
   pub const fn audio_connected(&self) -> bool {
      self.hf || self.a2dp
   }

   pub const fn any(&self) -> bool {
      self.hf || self.a2dp || self.avrcp || self.spp > 0 || self.hid || self.a2dp_signaling
   }
}

/// One remote peer currently known to the stack.
#[derive(Debug)]
pub struct DeviceRecord {
   pub addr: BdAddr,
   pub handle: ConnHandle,
   pub name: SmolStr,
   pub profiles: ProfileFlags,
   pub is_tws: bool,
   pub link_role: Option<LinkRole>,
   pub encrypted: bool,
   /// Announced to the user as connected in this session.
   pub notify_connected: bool,
   /// The "reconnected" tone already played for this session.
   pub notified_tts: bool,
   /// Disconnected locally to make room for another phone.
   pub halted_for_transfer: bool,
   pub timeout_disconnected: bool,
   pub auto_reconnect: bool,
   pub need_resume_play: bool,
   pub connect_requested_by_peer: bool,
   pub streaming: bool,
   pub sco_active: bool,
   pub volume: Option<u8>,
   /// Monotonic ACL-connect order.
   pub connected_order: u64,
   pub resume_play: Option<DelayedAction>,
   pub sco_disconnect: Option<DelayedAction>,
   pub hid_keepalive: Option<DelayedAction>,
   pub profile_grace: Option<DelayedAction>,
}

impl DeviceRecord {
   fn new(addr: BdAddr, handle: ConnHandle, connected_order: u64) -> Self {
      Self {
         addr,
         handle,
         name: SmolStr::default(),
         profiles: ProfileFlags::default(),
         is_tws: false,
         link_role: None,
         encrypted: false,
         notify_connected: false,
         notified_tts: false,
         halted_for_transfer: false,
         timeout_disconnected: false,
         auto_reconnect: false,
         need_resume_play: false,
         connect_requested_by_peer: false,
         streaming: false,
         sco_active: false,
         volume: None,
         connected_order,
         resume_play: None,
         sco_disconnect: None,
         hid_keepalive: None,
         profile_grace: None,
      }
   }

   pub fn timer_slot(&mut self, timer: DeviceTimer) -> &mut Option<DelayedAction> {
      match timer {
         DeviceTimer::ResumePlay => &mut self.resume_play,
         DeviceTimer::ScoDisconnect => &mut self.sco_disconnect,
         DeviceTimer::HidKeepAlive => &mut self.hid_keepalive,
         DeviceTimer::ProfileGrace => &mut self.profile_grace,
      }
   }

   pub fn pending_actions(&self) -> usize {
      [
         &self.resume_play,
         &self.sco_disconnect,
         &self.hid_keepalive,
         &self.profile_grace,
      ]
      .into_iter()
      .filter(|slot| slot.is_some())
      .count()
   }

   /// A notified, non-TWS record: the unit the phone counter counts.
   pub const fn counts_as_phone(&self) -> bool {
      self.notify_connected && !self.is_tws
   }

   fn cancel_actions(&mut self) {
      self.resume_play = None;
      self.sco_disconnect = None;
      self.hid_keepalive = None;
      self.profile_grace = None;
   }
}

#[derive(Debug, Default)]
struct Slot {
   generation: u32,
   record: Option<DeviceRecord>,
}

/// Bounded registry of remote device records.
#[derive(Debug)]
pub struct DeviceRegistry {
   slots: heapless::Vec<Slot, REGISTRY_CAPACITY>,
   next_order: u64,
}

impl Default for DeviceRegistry {
   fn default() -> Self {
      Self::new()
   }
}

impl DeviceRegistry {
   pub fn new() -> Self {
      let mut slots = heapless::Vec::new();
      while !slots.is_full() {
         let _ = slots.push(Slot::default());
      }
      Self {
         slots,
         next_order: 0,
      }
   }

   /// Returns the record for `addr`, allocating one if none exists.
   pub fn add(&mut self, addr: BdAddr, handle: ConnHandle) -> Result<DeviceKey> {
      if !handle.is_valid() {
         return Err(CoreError::InvalidHandle);
      }

      if let Some(key) = self.find_by_address(addr) {
         if let Some(record) = self.get_mut(key)
            && record.handle != handle
         {
            debug!("{addr}: handle reassigned {} -> {handle}", record.handle);
            record.handle = handle;
         }
         return Ok(key);
      }

      self.next_order += 1;
      let order = self.next_order;
      let (index, slot) = self
         .slots
         .iter_mut()
         .enumerate()
         .find(|(_, slot)| slot.record.is_none())
         .ok_or(CoreError::RegistryFull)?;
      slot.record = Some(DeviceRecord::new(addr, handle, order));
      Ok(DeviceKey {
         index: index as u8,
         generation: slot.generation,
      })
   }

   /// Cancels the record's delayed actions and releases its slot.
   ///
   /// A stale key (already freed, or slot reused) is a no-op.
   pub fn free(&mut self, key: DeviceKey) -> Option<DeviceRecord> {
      let slot = self.slots.get_mut(key.index as usize)?;
      if slot.generation != key.generation {
         return None;
      }
      let mut record = slot.record.take()?;
      record.cancel_actions();
      slot.generation = slot.generation.wrapping_add(1);
      Some(record)
   }

   pub fn get(&self, key: DeviceKey) -> Option<&DeviceRecord> {
      self
         .slots
         .get(key.index as usize)
         .filter(|slot| slot.generation == key.generation)?
         .record
         .as_ref()
   }

   pub fn get_mut(&mut self, key: DeviceKey) -> Option<&mut DeviceRecord> {
      self
         .slots
         .get_mut(key.index as usize)
         .filter(|slot| slot.generation == key.generation)?
         .record
         .as_mut()
   }

   pub fn find_by_handle(&self, handle: ConnHandle) -> Option<DeviceKey> {
      self.iter().find(|(_, r)| r.handle == handle).map(|(k, _)| k)
   }

   pub fn find_by_address(&self, addr: BdAddr) -> Option<DeviceKey> {
      self.iter().find(|(_, r)| r.addr == addr).map(|(k, _)| k)
   }

   pub fn iter(&self) -> impl Iterator<Item = (DeviceKey, &DeviceRecord)> + '_ {
      self.slots.iter().enumerate().filter_map(|(index, slot)| {
         slot.record.as_ref().map(|record| {
            (
               DeviceKey {
                  index: index as u8,
                  generation: slot.generation,
               },
               record,
            )
         })
      })
   }

   /// Keys of live records, detached from the registry borrow.
   pub fn keys(&self) -> SmallVec<[DeviceKey; REGISTRY_CAPACITY]> {
      self.iter().map(|(key, _)| key).collect()
   }

   pub fn len(&self) -> usize {
      self.iter().count()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   pub fn is_full(&self) -> bool {
      self.len() == REGISTRY_CAPACITY
   }

   /// Frees every record.
   pub fn clear(&mut self) {
      for key in self.keys() {
         self.free(key);
      }
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::Arc, time::Duration};

   use super::*;
   use crate::timer::{ManualClock, TimerKind, Timers};

   fn addr(n: u8) -> BdAddr {
      BdAddr::new([0x10, 0x20, 0x30, 0x40, 0x50, n])
   }

   #[test]
   fn test_add_is_idempotent() {
      let mut registry = DeviceRegistry::new();
      let key = registry.add(addr(1), ConnHandle(0x10)).unwrap();
      registry.get_mut(key).unwrap().notify_connected = true;

      let again = registry.add(addr(1), ConnHandle(0x10)).unwrap();
      assert_eq!(key, again);
      assert_eq!(registry.len(), 1);
      assert!(registry.get(again).unwrap().notify_connected);
   }

   #[test]
   fn test_add_refreshes_reassigned_handle() {
      let mut registry = DeviceRegistry::new();
      let key = registry.add(addr(1), ConnHandle(0x10)).unwrap();
      registry.add(addr(1), ConnHandle(0x11)).unwrap();
      assert_eq!(registry.find_by_handle(ConnHandle(0x11)), Some(key));
      assert!(registry.find_by_handle(ConnHandle(0x10)).is_none());
   }

   #[test]
   fn test_rejects_zero_handle_and_overflow() {
      let mut registry = DeviceRegistry::new();
      assert!(matches!(
         registry.add(addr(0), ConnHandle(0)),
         Err(CoreError::InvalidHandle)
      ));
      for n in 0..REGISTRY_CAPACITY as u8 {
         registry.add(addr(n), ConnHandle(0x100 + u16::from(n))).unwrap();
      }
      assert!(registry.is_full());
      assert!(matches!(
         registry.add(addr(0xEE), ConnHandle(0x1EE)),
         Err(CoreError::RegistryFull)
      ));
      // Known addresses still resolve when full.
      assert!(registry.add(addr(0), ConnHandle(0x100)).is_ok());
   }

   #[test]
   fn test_double_free_and_stale_key() {
      let mut registry = DeviceRegistry::new();
      let key = registry.add(addr(1), ConnHandle(0x10)).unwrap();
      assert!(registry.free(key).is_some());
      assert!(registry.free(key).is_none());

      // The same slot is reused for the next device with a new generation.
      let reused = registry.add(addr(2), ConnHandle(0x20)).unwrap();
      assert_ne!(key, reused);
      assert!(registry.get(key).is_none());
      assert!(registry.free(key).is_none());
      assert_eq!(registry.get(reused).unwrap().addr, addr(2));
   }

   #[test]
   fn test_free_cancels_pending_actions() {
      let clock = ManualClock::new();
      let mut timers = Timers::new(Arc::new(clock.clone()));
      let mut registry = DeviceRegistry::new();
      let key = registry.add(addr(1), ConnHandle(0x10)).unwrap();
      {
         let record = registry.get_mut(key).unwrap();
         record.resume_play = Some(timers.start(
            Duration::from_secs(1),
            TimerKind::Device(key, DeviceTimer::ResumePlay),
         ));
         record.hid_keepalive = Some(timers.start(
            Duration::from_secs(30),
            TimerKind::Device(key, DeviceTimer::HidKeepAlive),
         ));
         assert_eq!(record.pending_actions(), 2);
      }
      assert_eq!(clock.pending(), 2);

      let freed = registry.free(key).unwrap();
      assert_eq!(freed.pending_actions(), 0);
      assert_eq!(clock.pending(), 0);
   }

   #[test]
   fn test_lookup_absence_is_none() {
      let mut registry = DeviceRegistry::new();
      assert!(registry.find_by_handle(ConnHandle(0x99)).is_none());
      assert!(registry.find_by_address(addr(9)).is_none());
      let key = registry.add(addr(9), ConnHandle(0x99)).unwrap();
      registry.clear();
      assert!(registry.is_empty());
      assert!(registry.get(key).is_none());
   }
}
