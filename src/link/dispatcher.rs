//! Link event dispatch.
//!
//! Translates raw stack callbacks into registry mutations, status changes,
//! per-device delayed actions and power-off progress. Every callback
//! answers with a [`Verdict`]; only connect requests can be refused.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   connection::ConnectionCore,
   event::AppEvent,
   link::{
      registry::{DeviceKey, DeviceRecord},
      status::{DisconnectSummary, Status},
   },
   stack::StackCommand,
   store::keys,
   timer::{DeviceTimer, Expiry, TimerKind, take_if_live},
   types::{BdAddr, ConnHandle, HciReason, LinkRole, Profile, RemoteRole, TwsRole},
};

const AUDIT: &str = "budlink::audit";

/// Callbacks delivered by the vendor stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkEvent {
   AclConnectRequest {
      addr: BdAddr,
      /// The remote paged us.
      #[serde(default)]
      inbound: bool,
   },
   AclConnected {
      addr: BdAddr,
      handle: ConnHandle,
      #[serde(default)]
      phone_initiated: bool,
      #[serde(default)]
      is_tws: Option<bool>,
   },
   AclDisconnected {
      addr: BdAddr,
      handle: ConnHandle,
      reason: HciReason,
      #[serde(default)]
      remote_forced: bool,
   },
   GetName {
      handle: ConnHandle,
      name: SmolStr,
      #[serde(default)]
      role: RemoteRole,
   },
   ProfileConnected {
      handle: ConnHandle,
      profile: Profile,
   },
   ProfileDisconnected {
      handle: ConnHandle,
      profile: Profile,
   },
   RoleChange {
      handle: ConnHandle,
      role: LinkRole,
   },
   SecurityChanged {
      handle: ConnHandle,
      encrypted: bool,
   },
   SnoopRoleChange {
      relay_master: bool,
   },
   StreamStateChanged {
      handle: ConnHandle,
      streaming: bool,
   },
   ScoConnected {
      handle: ConnHandle,
   },
   ScoDisconnected {
      handle: ConnHandle,
   },
   VolumeChanged {
      handle: ConnHandle,
      volume: u8,
   },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
   Accept,
   Reject,
}

impl Verdict {
   /// Integer answer expected by the stack callback.
   pub const fn code(self) -> i32 {
      match self {
         Self::Accept => 0,
         Self::Reject => 1,
      }
   }
}

impl ConnectionCore {
   pub fn handle_link_event(&mut self, event: LinkEvent) -> Verdict {
      match event {
         LinkEvent::AclConnectRequest { addr, inbound } => {
            return self.on_connect_request(addr, inbound);
         },
         LinkEvent::AclConnected {
            addr,
            handle,
            phone_initiated,
            is_tws,
         } => self.on_acl_connected(addr, handle, phone_initiated, is_tws),
         LinkEvent::AclDisconnected {
            addr,
            handle,
            reason,
            remote_forced,
         } => self.on_acl_disconnected(addr, handle, reason, remote_forced),
         LinkEvent::GetName { handle, name, role } => self.on_get_name(handle, name, role),
         LinkEvent::ProfileConnected { handle, profile } => self.on_profile(handle, profile, true),
         LinkEvent::ProfileDisconnected { handle, profile } => self.on_profile(handle, profile, false),
         LinkEvent::RoleChange { handle, role } => {
            if let Some(record) = self.record_for(handle, "role change") {
               info!(target: AUDIT, "{} link role -> {role}", record.addr);
               record.link_role = Some(role);
            }
         },
         LinkEvent::SecurityChanged { handle, encrypted } => {
            if let Some(record) = self.record_for(handle, "security change") {
               info!(target: AUDIT, "{} encryption {}", record.addr, if encrypted { "on" } else { "off" });
               record.encrypted = encrypted;
            }
         },
         LinkEvent::SnoopRoleChange { relay_master } => self.on_snoop_role(relay_master),
         LinkEvent::StreamStateChanged { handle, streaming } => {
            if let Some(record) = self.record_for(handle, "stream state") {
               record.streaming = streaming;
            }
         },
         LinkEvent::ScoConnected { handle } => {
            if let Some(record) = self.record_for(handle, "SCO connect") {
               record.sco_active = true;
               record.sco_disconnect = None;
            }
         },
         LinkEvent::ScoDisconnected { handle } => {
            if let Some(record) = self.record_for(handle, "SCO disconnect") {
               record.sco_active = false;
               record.sco_disconnect = None;
            }
         },
         LinkEvent::VolumeChanged { handle, volume } => {
            if let Some(record) = self.record_for(handle, "volume") {
               record.volume = Some(volume);
            }
         },
      }
      Verdict::Accept
   }

   fn key_for(&self, handle: ConnHandle, what: &str) -> Option<DeviceKey> {
      let key = self.registry.find_by_handle(handle);
      if key.is_none() {
         debug!("Dropping {what} for unknown handle {handle}");
      }
      key
   }

   fn record_for(&mut self, handle: ConnHandle, what: &str) -> Option<&mut DeviceRecord> {
      let key = self.key_for(handle, what)?;
      self.registry.get_mut(key)
   }

   fn on_connect_request(&mut self, addr: BdAddr, inbound: bool) -> Verdict {
      info!("ACL connect request {} {addr}", if inbound { "from" } else { "to" });
      if inbound {
         let cancelled = self.reconnect.cancel_except(addr);
         if cancelled > 0 {
            debug!("Cancelled {cancelled} reconnect(s) in favour of {addr}");
         }
         self.stack.submit(StackCommand::CancelPage { keep: Some(addr) });
      }

      if self.powering_off() {
         info!("Rejecting {addr}: powering off");
         return Verdict::Reject;
      }
      if self.registry.is_full() && self.registry.find_by_address(addr).is_none() {
         warn!("Rejecting {addr}: device registry full");
         return Verdict::Reject;
      }
      Verdict::Accept
   }

   fn on_acl_connected(
      &mut self,
      addr: BdAddr,
      handle: ConnHandle,
      phone_initiated: bool,
      is_tws: Option<bool>,
   ) {
      let key = match self.registry.add(addr, handle) {
         Ok(key) => key,
         Err(e) => {
            warn!("Cannot track {addr}: {e}");
            return;
         },
      };
      let resumed = self.reconnect.take(addr);
      let volume = self
         .store
         .get(&keys::volume(addr))
         .and_then(|bytes| bytes.first().copied());
      let tws = is_tws == Some(true);

      let Some(record) = self.registry.get_mut(key) else {
         return;
      };
      record.connect_requested_by_peer |= phone_initiated;
      let requested = record.connect_requested_by_peer;
      if let Some(entry) = resumed {
         info!("{addr} is back after {} reconnect attempt(s)", entry.attempt);
         record.need_resume_play |= entry.need_resume_play;
      }
      if volume.is_some() {
         record.volume = volume;
      }
      info!("ACL up: {addr} handle {handle}{}", if tws { " (TWS peer)" } else { "" });
      self.manager.halted.retain(|halted| *halted != addr);

      if tws {
         self.mark_tws_peer(addr, key);
         return;
      }
      if requested && self.manager.phone_count >= self.max_phones {
         self.take_over(key);
      }
   }

   /// Promotes a record to the TWS peer; a record already counted as a
   /// phone is un-counted first.
   fn mark_tws_peer(&mut self, addr: BdAddr, key: DeviceKey) {
      if let Some(record) = self.registry.get_mut(key) {
         record.is_tws = true;
         if record.notify_connected {
            record.notify_connected = false;
            record.notified_tts = false;
            info!("{addr} turned out to be the TWS peer, no longer counted as a phone");
            self.manager.phone_count = self.manager.phone_count.saturating_sub(1);
            self.power_off_phone_count(self.manager.phone_count);
         }
      }
      self.manager.tws_peer = Some(addr);
      self.events.emit(AppEvent::TwsConnected { addr });
      self.set_status(Status::TwsPaired, false, Some(key));
   }

   /// Hands the oldest announced phone's slot to the newcomer.
   fn take_over(&mut self, newcomer: DeviceKey) {
      let victim = self
         .registry
         .iter()
         .filter(|(key, record)| *key != newcomer && record.counts_as_phone())
         .min_by_key(|(_, record)| record.connected_order)
         .map(|(key, _)| key);
      let Some(record) = victim.and_then(|key| self.registry.get_mut(key)) else {
         return;
      };
      info!("Phone limit reached, disconnecting {} for the new phone", record.addr);
      record.halted_for_transfer = true;
      let (addr, handle) = (record.addr, record.handle);
      if !self.manager.halted.contains(&addr) {
         self.manager.halted.push(addr);
      }
      self.stack.submit(StackCommand::Disconnect {
         handle,
         reason: HciReason::REMOTE_USER_TERMINATED,
      });
   }

   fn on_acl_disconnected(
      &mut self,
      addr: BdAddr,
      handle: ConnHandle,
      reason: HciReason,
      remote_forced: bool,
   ) {
      let Some(key) = self
         .registry
         .find_by_handle(handle)
         .or_else(|| self.registry.find_by_address(addr))
      else {
         debug!("Dropping disconnect for unknown link {handle} ({addr})");
         return;
      };
      let reason = if remote_forced {
         HciReason::REMOTE_USER_TERMINATED
      } else {
         reason
      };
      self.manager.last_reason = Some(reason);

      let Some(record) = self.registry.get_mut(key) else {
         return;
      };
      let addr = record.addr;
      record.timeout_disconnected = reason.is_timeout_class();
      if record.timeout_disconnected && record.streaming && record.profiles.a2dp {
         record.need_resume_play = true;
      }
      let timeout = record.timeout_disconnected;
      let halted = record.halted_for_transfer || self.manager.halted.contains(&addr);
      let is_tws = record.is_tws;
      let counted = record.counts_as_phone();
      let eligible = record.auto_reconnect;
      let need_resume_play = record.need_resume_play;
      let volume = record.volume;
      let tone_suppressed = halted || (timeout && self.config.shield_timeout_tone);
      info!("ACL down: {addr} handle {handle} reason {reason}");

      if is_tws {
         self.events.emit(AppEvent::TwsDisconnected { addr });
         self.set_status(Status::TwsUnpaired, false, Some(key));
      } else if counted {
         self.set_status(Status::Disconnected, tone_suppressed, Some(key));
      }

      if let Some(volume) = volume
         && let Err(e) = self.store.set(&keys::volume(addr), &[volume])
      {
         warn!("Failed to persist volume for {addr}: {e}");
      }

      if timeout && eligible && !halted && !is_tws && !self.powering_off() {
         self.reconnect.schedule(addr, need_resume_play, &mut self.timers);
      }

      self.registry.free(key);
      self.manager.halted.retain(|h| *h != addr);
      self.manager.last_disconnect = Some(DisconnectSummary {
         addr,
         reason,
         timeout,
         need_resume_play,
         tone_suppressed,
      });
      self.power_off_phone_count(self.manager.phone_count);
   }

   fn on_get_name(&mut self, handle: ConnHandle, name: SmolStr, role: RemoteRole) {
      let Some(key) = self.key_for(handle, "name") else {
         return;
      };
      let Some(record) = self.registry.get_mut(key) else {
         return;
      };
      debug!("{} is {name:?} ({role})", record.addr);
      record.name = name;
      if role != RemoteRole::TwsPeer || record.is_tws {
         return;
      }

      let addr = record.addr;
      self.mark_tws_peer(addr, key);
   }

   fn on_profile(&mut self, handle: ConnHandle, profile: Profile, connected: bool) {
      let Some(key) = self.key_for(handle, "profile change") else {
         return;
      };
      let timers = &mut self.timers;
      let config = &self.config;
      let Some(record) = self.registry.get_mut(key) else {
         return;
      };
      let signaling_platform = self.signaling_ouis.contains(&record.addr.oui());
      debug!(
         "{} {profile} {}",
         record.addr,
         if connected { "connected" } else { "disconnected" }
      );

      let flags = &mut record.profiles;
      match profile {
         Profile::Hfp => flags.hf = connected,
         Profile::A2dp => flags.a2dp = connected,
         Profile::Avrcp => flags.avrcp = connected,
         Profile::Spp => {
            flags.spp = if connected {
               flags.spp.saturating_add(1)
            } else {
               flags.spp.saturating_sub(1)
            };
         },
         Profile::Hid => flags.hid = connected,
         Profile::A2dpSignaling => flags.a2dp_signaling = connected,
      }

      if connected {
         record.profile_grace = None;
         match profile {
            Profile::Hfp | Profile::A2dp => record.auto_reconnect = true,
            _ => {},
         }
         match profile {
            Profile::Hid => {
               record.hid_keepalive = config
                  .hid_keepalive()
                  .map(|period| timers.start(period, TimerKind::Device(key, DeviceTimer::HidKeepAlive)));
            },
            Profile::A2dp if record.need_resume_play => {
               record.resume_play = Some(timers.start(
                  config.resume_play_delay(),
                  TimerKind::Device(key, DeviceTimer::ResumePlay),
               ));
            },
            _ => {},
         }
      } else {
         match profile {
            Profile::Hid => record.hid_keepalive = None,
            Profile::A2dp => {
               record.resume_play = None;
               record.streaming = false;
            },
            Profile::Hfp if record.sco_active => {
               record.sco_disconnect = Some(timers.start(
                  config.sco_disconnect_delay(),
                  TimerKind::Device(key, DeviceTimer::ScoDisconnect),
               ));
            },
            _ => {},
         }
         if !record.profiles.audio_connected()
            && !record.is_tws
            && record.profile_grace.is_none()
            && let Some(grace) = config.profile_grace()
         {
            record.profile_grace =
               Some(timers.start(grace, TimerKind::Device(key, DeviceTimer::ProfileGrace)));
         }
      }

      let announce = connected
         && !record.is_tws
         && match profile {
            Profile::A2dp => !signaling_platform,
            Profile::A2dpSignaling => signaling_platform,
            _ => false,
         };
      if announce {
         self.set_status(Status::Connected, false, Some(key));
      }
   }

   fn on_snoop_role(&mut self, relay_master: bool) {
      let role = if relay_master {
         TwsRole::Master
      } else {
         TwsRole::Slave
      };
      info!(target: AUDIT, "Snoop role -> {role}");
      if self.manager.tws_role == role {
         return;
      }
      self.manager.tws_role = role;
      if relay_master {
         self.stack.submit(StackCommand::SyncPeerInfo);
      }
      self.refresh_scan_mode();
   }

   pub(crate) fn on_device_timer(&mut self, key: DeviceKey, timer: DeviceTimer, expiry: &Expiry) {
      let Some(record) = self.registry.get_mut(key) else {
         debug!("{timer:?} fired for a freed device");
         return;
      };
      if !take_if_live(record.timer_slot(timer), expiry) {
         return;
      }
      let handle = record.handle;
      match timer {
         DeviceTimer::ResumePlay => {
            info!("Resuming playback on {}", record.addr);
            record.need_resume_play = false;
            self.stack.submit(StackCommand::ResumePlay { handle });
         },
         DeviceTimer::ScoDisconnect => {
            if record.sco_active {
               info!("Dropping SCO left behind on {}", record.addr);
               self.stack.submit(StackCommand::DisconnectSco { handle });
            }
         },
         DeviceTimer::HidKeepAlive => {
            if record.profiles.hid {
               self.stack.submit(StackCommand::HidKeepAlive { handle });
               record.hid_keepalive = self.config.hid_keepalive().map(|period| {
                  self
                     .timers
                     .start(period, TimerKind::Device(key, DeviceTimer::HidKeepAlive))
               });
            }
         },
         DeviceTimer::ProfileGrace => {
            if !record.profiles.audio_connected() {
               info!("{} has no audio profile left, disconnecting", record.addr);
               self.stack.submit(StackCommand::Disconnect {
                  handle,
                  reason: HciReason::REMOTE_USER_TERMINATED,
               });
            }
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use super::*;
   use crate::{
      config::Config,
      event::ToneKind,
      policy::power_off::PowerOffRequest,
      sim::Simulation,
      store::keys,
   };

   const PHONE_A: BdAddr = BdAddr([0x40, 0, 0, 0, 0, 1]);
   const PHONE_B: BdAddr = BdAddr([0x40, 0, 0, 0, 0, 2]);
   const PHONE_C: BdAddr = BdAddr([0x40, 0, 0, 0, 0, 3]);
   const PEER: BdAddr = BdAddr([0x50, 0, 0, 0, 0, 9]);
   const SUPERVISION_TIMEOUT: HciReason = HciReason::CONNECTION_TIMEOUT;

   fn sim(config: Config) -> Simulation {
      let mut sim = Simulation::new(config).unwrap();
      sim.events.take();
      sim.stack.take();
      sim
   }

   fn connected(tones: &[ToneKind]) -> usize {
      tones
         .iter()
         .filter(|t| matches!(t, ToneKind::FirstConnected | ToneKind::SecondConnected))
         .count()
   }

   #[test]
   fn test_acl_then_a2dp_announces_once() {
      let mut sim = sim(Config::default());
      sim.link(LinkEvent::AclConnected {
         addr: PHONE_A,
         handle: ConnHandle(0x10),
         phone_initiated: true,
         is_tws: None,
      });
      assert_eq!(sim.core.manager.phone_count, 0);
      sim.link(LinkEvent::ProfileConnected {
         handle: ConnHandle(0x10),
         profile: Profile::A2dp,
      });

      let record = sim.record(PHONE_A).unwrap();
      assert!(record.notify_connected);
      assert!(record.connect_requested_by_peer);
      assert_eq!(sim.core.manager.phone_count, 1);
      let tones = sim.events.tones();
      assert_eq!(connected(&tones), 1);
      assert_eq!(tones, vec![ToneKind::FirstConnected]);
   }

   #[test]
   fn test_streaming_timeout_is_shielded() {
      let mut sim = sim(Config {
         shield_timeout_tone: true,
         ..Config::default()
      });
      sim.connect_phone(PHONE_A, ConnHandle(0x10));
      sim.link(LinkEvent::StreamStateChanged {
         handle: ConnHandle(0x10),
         streaming: true,
      });
      sim.events.take();

      sim.drop_link(PHONE_A, ConnHandle(0x10), SUPERVISION_TIMEOUT);
      let summary = sim.core.manager.last_disconnect.unwrap();
      assert!(summary.timeout);
      assert!(summary.need_resume_play);
      assert!(summary.tone_suppressed);
      assert!(sim.events.tones().is_empty());
      assert_eq!(sim.core.manager.phone_count, 0);
   }

   #[test]
   fn test_timeout_without_shield_plays_tone() {
      let mut sim = sim(Config::default());
      sim.connect_phone(PHONE_A, ConnHandle(0x10));
      sim.events.take();
      sim.drop_link(PHONE_A, ConnHandle(0x10), SUPERVISION_TIMEOUT);
      assert_eq!(sim.events.tones(), vec![ToneKind::Disconnected]);
   }

   #[test]
   fn test_connect_request_verdicts() {
      let mut sim = sim(Config {
         max_phones: 3,
         ..Config::default()
      });
      for n in 0..4u8 {
         sim.link(LinkEvent::AclConnected {
            addr: BdAddr([0x60, 0, 0, 0, 0, n]),
            handle: ConnHandle(0x20 + u16::from(n)),
            phone_initiated: false,
            is_tws: None,
         });
      }
      assert!(sim.core.registry.is_full());
      let unknown = LinkEvent::AclConnectRequest {
         addr: PHONE_C,
         inbound: false,
      };
      assert_eq!(sim.link(unknown).code(), 1);
      let known = LinkEvent::AclConnectRequest {
         addr: BdAddr([0x60, 0, 0, 0, 0, 2]),
         inbound: false,
      };
      assert_eq!(sim.link(known.clone()), Verdict::Accept);

      sim.core.request_power_off(PowerOffRequest::local());
      assert_eq!(sim.link(known), Verdict::Reject);
   }

   #[test]
   fn test_timeout_schedules_reconnect_and_resume() {
      let mut sim = sim(Config {
         reconnect_base_delay_ms: 1000,
         resume_play_delay_ms: 500,
         ..Config::default()
      });
      sim.connect_phone(PHONE_A, ConnHandle(0x10));
      sim.link(LinkEvent::StreamStateChanged {
         handle: ConnHandle(0x10),
         streaming: true,
      });
      sim.drop_link(PHONE_A, ConnHandle(0x10), SUPERVISION_TIMEOUT);
      assert!(sim.core.reconnect.contains(PHONE_A));

      sim.stack.take();
      sim.advance(Duration::from_secs(2));
      assert!(sim.stack.take().contains(&StackCommand::Connect { addr: PHONE_A }));

      sim.connect_phone(PHONE_A, ConnHandle(0x11));
      assert!(!sim.core.reconnect.contains(PHONE_A));
      assert!(sim.record(PHONE_A).unwrap().need_resume_play);
      sim.advance(Duration::from_millis(500));
      assert!(
         sim.stack
            .take()
            .contains(&StackCommand::ResumePlay {
               handle: ConnHandle(0x11),
            })
      );
      assert!(!sim.record(PHONE_A).unwrap().need_resume_play);
   }

   #[test]
   fn test_clean_or_forced_unlink_never_reconnects() {
      let mut sim = sim(Config::default());
      sim.connect_phone(PHONE_A, ConnHandle(0x10));
      sim.link(LinkEvent::AclDisconnected {
         addr: PHONE_A,
         handle: ConnHandle(0x10),
         reason: SUPERVISION_TIMEOUT,
         remote_forced: true,
      });
      assert!(sim.core.reconnect.is_empty());
      assert_eq!(
         sim.core.manager.last_reason,
         Some(HciReason::REMOTE_USER_TERMINATED)
      );
   }

   #[test]
   fn test_inbound_request_cancels_other_reconnects() {
      let mut sim = sim(Config::default());
      sim.connect_phone(PHONE_A, ConnHandle(0x10));
      sim.drop_link(PHONE_A, ConnHandle(0x10), SUPERVISION_TIMEOUT);
      assert!(sim.core.reconnect.contains(PHONE_A));
      sim.stack.take();

      sim.link(LinkEvent::AclConnectRequest {
         addr: PHONE_B,
         inbound: true,
      });
      assert!(sim.core.reconnect.is_empty());
      assert_eq!(sim.stack.take(), vec![StackCommand::CancelPage {
         keep: Some(PHONE_B),
      }]);
   }

   #[test]
   fn test_third_phone_takes_over_oldest() {
      let mut sim = sim(Config::default());
      sim.connect_phone(PHONE_A, ConnHandle(0x10));
      sim.connect_phone(PHONE_B, ConnHandle(0x11));
      sim.stack.take();

      sim.link(LinkEvent::AclConnected {
         addr: PHONE_C,
         handle: ConnHandle(0x12),
         phone_initiated: true,
         is_tws: Some(false),
      });
      assert_eq!(sim.stack.take(), vec![StackCommand::Disconnect {
         handle: ConnHandle(0x10),
         reason: HciReason::REMOTE_USER_TERMINATED,
      }]);
      assert_eq!(sim.core.manager.halted.as_slice(), &[PHONE_A]);

      sim.events.take();
      sim.drop_link(PHONE_A, ConnHandle(0x10), HciReason::LOCAL_HOST_TERMINATED);
      assert!(sim.events.tones().is_empty());
      assert!(sim.core.manager.halted.is_empty());
      assert!(sim.core.reconnect.is_empty());
      assert_eq!(sim.core.manager.phone_count, 1);
   }

   #[test]
   fn test_tws_peer_is_never_counted() {
      let mut sim = sim(Config::default());
      sim.connect_phone(PEER, ConnHandle(0x30));
      assert_eq!(sim.core.manager.phone_count, 1);

      sim.link(LinkEvent::GetName {
         handle: ConnHandle(0x30),
         name: SmolStr::new("budlink R"),
         role: RemoteRole::TwsPeer,
      });
      assert_eq!(sim.core.manager.phone_count, 0);
      assert!(sim.core.manager.tws_paired);
      let events = sim.events.take();
      assert!(events.contains(&AppEvent::TwsConnected { addr: PEER }));

      sim.link(LinkEvent::ProfileConnected {
         handle: ConnHandle(0x30),
         profile: Profile::A2dp,
      });
      assert_eq!(sim.core.manager.phone_count, 0);

      sim.drop_link(PEER, ConnHandle(0x30), SUPERVISION_TIMEOUT);
      assert!(!sim.core.manager.tws_paired);
      assert!(sim.core.reconnect.is_empty());
      assert!(sim.events.take().contains(&AppEvent::TwsDisconnected { addr: PEER }));
   }

   #[test]
   fn test_tws_flag_on_reconnect_uncounts_phone() {
      let mut sim = sim(Config::default());
      sim.connect_phone(PEER, ConnHandle(0x30));
      assert_eq!(sim.core.manager.phone_count, 1);

      sim.link(LinkEvent::AclConnected {
         addr: PEER,
         handle: ConnHandle(0x30),
         phone_initiated: false,
         is_tws: Some(true),
      });
      let record = sim.record(PEER).unwrap();
      assert!(record.is_tws);
      assert!(!record.notify_connected);
      assert_eq!(sim.core.manager.phone_count, 0);
      assert!(sim.core.manager.tws_paired);
      assert_eq!(sim.core.manager.tws_peer, Some(PEER));
   }

   #[test]
   fn test_self_paged_link_connects_without_tone() {
      let mut sim = sim(Config::default());
      sim.link(LinkEvent::AclConnected {
         addr: PHONE_A,
         handle: ConnHandle(0x10),
         phone_initiated: false,
         is_tws: Some(false),
      });
      sim.link(LinkEvent::ProfileConnected {
         handle: ConnHandle(0x10),
         profile: Profile::A2dp,
      });
      assert_eq!(sim.core.manager.phone_count, 1);
      let events = sim.events.take();
      assert!(events.contains(&AppEvent::StatusChanged {
         status: Status::Connected,
         tone: false,
      }));
      assert!(!events.iter().any(|e| matches!(e, AppEvent::Tone { .. })));

      sim.connect_phone(PHONE_B, ConnHandle(0x11));
      assert_eq!(sim.events.tones(), vec![ToneKind::SecondConnected]);
   }

   #[test]
   fn test_signaling_platforms_announce_on_signaling() {
      let mut sim = sim(Config {
         signaling_notify_ouis: vec!["400000".into()],
         ..Config::default()
      });
      sim.link(LinkEvent::AclConnected {
         addr: PHONE_A,
         handle: ConnHandle(0x10),
         phone_initiated: true,
         is_tws: None,
      });
      sim.link(LinkEvent::ProfileConnected {
         handle: ConnHandle(0x10),
         profile: Profile::A2dp,
      });
      assert_eq!(sim.core.manager.phone_count, 0);
      sim.link(LinkEvent::ProfileConnected {
         handle: ConnHandle(0x10),
         profile: Profile::A2dpSignaling,
      });
      assert_eq!(sim.core.manager.phone_count, 1);
   }

   #[test]
   fn test_hid_keepalive_repeats_until_hid_drops() {
      let mut sim = sim(Config {
         hid_keepalive_secs: 10,
         ..Config::default()
      });
      sim.connect_phone(PHONE_A, ConnHandle(0x10));
      sim.link(LinkEvent::ProfileConnected {
         handle: ConnHandle(0x10),
         profile: Profile::Hid,
      });
      sim.stack.take();
      sim.advance(Duration::from_secs(25));
      let keepalives = sim
         .stack
         .take()
         .into_iter()
         .filter(|cmd| matches!(cmd, StackCommand::HidKeepAlive { .. }))
         .count();
      assert_eq!(keepalives, 2);

      sim.link(LinkEvent::ProfileDisconnected {
         handle: ConnHandle(0x10),
         profile: Profile::Hid,
      });
      sim.advance(Duration::from_secs(30));
      assert!(!sim.stack.take().iter().any(|cmd| matches!(cmd, StackCommand::HidKeepAlive { .. })));
   }

   #[test]
   fn test_profile_grace_drops_idle_acl() {
      let mut sim = sim(Config {
         profile_grace_secs: 5,
         ..Config::default()
      });
      sim.connect_phone(PHONE_A, ConnHandle(0x10));
      sim.link(LinkEvent::ProfileDisconnected {
         handle: ConnHandle(0x10),
         profile: Profile::A2dp,
      });
      sim.advance(Duration::from_secs(3));
      // Coming back in time cancels the grace period.
      sim.link(LinkEvent::ProfileConnected {
         handle: ConnHandle(0x10),
         profile: Profile::Hfp,
      });
      sim.advance(Duration::from_secs(10));
      assert!(!sim.stack.take().iter().any(|cmd| matches!(cmd, StackCommand::Disconnect { .. })));

      sim.link(LinkEvent::ProfileDisconnected {
         handle: ConnHandle(0x10),
         profile: Profile::Hfp,
      });
      sim.advance(Duration::from_secs(5));
      assert!(sim.stack.take().contains(&StackCommand::Disconnect {
         handle: ConnHandle(0x10),
         reason: HciReason::REMOTE_USER_TERMINATED,
      }));
   }

   #[test]
   fn test_hf_drop_with_sco_up_cleans_sco() {
      let mut sim = sim(Config::default());
      sim.connect_phone(PHONE_A, ConnHandle(0x10));
      sim.link(LinkEvent::ProfileConnected {
         handle: ConnHandle(0x10),
         profile: Profile::Hfp,
      });
      sim.link(LinkEvent::ScoConnected {
         handle: ConnHandle(0x10),
      });
      sim.link(LinkEvent::ProfileDisconnected {
         handle: ConnHandle(0x10),
         profile: Profile::Hfp,
      });
      sim.stack.take();
      sim.advance(Duration::from_millis(1000));
      assert!(sim.stack.take().contains(&StackCommand::DisconnectSco {
         handle: ConnHandle(0x10),
      }));
   }

   #[test]
   fn test_volume_persisted_and_restored() {
      let mut sim = sim(Config::default());
      sim.connect_phone(PHONE_A, ConnHandle(0x10));
      sim.link(LinkEvent::VolumeChanged {
         handle: ConnHandle(0x10),
         volume: 11,
      });
      sim.drop_link(PHONE_A, ConnHandle(0x10), HciReason::REMOTE_USER_TERMINATED);
      assert_eq!(sim.store.get(&keys::volume(PHONE_A)), Some(vec![11]));

      sim.connect_phone(PHONE_A, ConnHandle(0x12));
      assert_eq!(sim.record(PHONE_A).unwrap().volume, Some(11));
   }

   #[test]
   fn test_unknown_handles_are_dropped() {
      let mut sim = sim(Config::default());
      let verdict = sim.link(LinkEvent::ProfileConnected {
         handle: ConnHandle(0x77),
         profile: Profile::A2dp,
      });
      assert_eq!(verdict, Verdict::Accept);
      sim.link(LinkEvent::AclDisconnected {
         addr: PHONE_A,
         handle: ConnHandle(0x77),
         reason: SUPERVISION_TIMEOUT,
         remote_forced: false,
      });
      assert!(sim.events.take().is_empty());
      assert!(sim.stack.take().is_empty());
   }

   #[test]
   fn test_snoop_master_syncs_and_slave_goes_dark() {
      let mut sim = sim(Config::default());
      sim.link(LinkEvent::SnoopRoleChange { relay_master: true });
      assert!(sim.stack.take().contains(&StackCommand::SyncPeerInfo));
      sim.link(LinkEvent::SnoopRoleChange { relay_master: false });
      assert_eq!(
         sim.core.manager.scan_mode,
         Some(crate::link::status::ScanMode::OFF)
      );
   }

   #[test]
   fn test_link_event_json_shape() {
      let event: LinkEvent = serde_json::from_str(
         r#"{"type":"acl_disconnected","addr":"40:00:00:00:00:01","handle":16,"reason":8}"#,
      )
      .unwrap();
      assert_eq!(event, LinkEvent::AclDisconnected {
         addr: PHONE_A,
         handle: ConnHandle(0x10),
         reason: SUPERVISION_TIMEOUT,
         remote_forced: false,
      });
   }
}
