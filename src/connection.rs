//! The session core.
//!
//! [`ConnectionCore`] owns every piece of connection state: the device
//! registry, the manager context, the power-off context, the LE-Audio
//! policy and the reconnect queue. It is a plain synchronous object; one
//! owner feeds it [`CoreInput`]s in arrival order (the tokio actor in
//! [`crate::runtime`], or the virtual-time driver in [`crate::sim`]), and
//! dropping it tears everything down, timers included.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::{
   config::Config,
   error::Result,
   event::{AppEvent, EventSender},
   link::{
      dispatcher::{LinkEvent, Verdict},
      registry::{DeviceRegistry, ProfileFlags},
      role::{Candidate, RoleCheck, is_tws_candidate},
      status::{DisconnectSummary, ManagerContext, ScanMode, Status},
   },
   policy::{
      lea::{LeaEffect, LeaEvent, LeaPolicy, LeaSnapshot},
      power_off::{PowerOffContext, PowerOffRequest, PowerOffState, SharedPowerOff},
      reconnect::ReconnectQueue,
   },
   stack::{StackCommand, StackSender},
   store::{StoreHandle, keys, load_addr},
   timer::{Expiry, Scheduler, TimerKind, Timers},
   types::{BdAddr, ConnHandle, TwsRole},
};

/// Everything the core can be fed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreInput {
   Link(LinkEvent),
   Lea(LeaEvent),
   PowerOff(PowerOffRequest),
   TwsTeardownComplete,
   EnterPairing,
   TwsPairSearch,
   ClearPairedList,
   /// Is this inquiry result our other earpiece? Answered by the verdict.
   TwsCandidate(Candidate),
   #[serde(skip_deserializing)]
   Timer(Expiry),
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
   pub addr: BdAddr,
   pub handle: ConnHandle,
   pub name: SmolStr,
   pub is_tws: bool,
   pub notify_connected: bool,
   pub profiles: ProfileFlags,
   pub pending_actions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreSnapshot {
   pub started: bool,
   pub status: Status,
   pub phone_count: u8,
   pub tws_paired: bool,
   pub tws_role: TwsRole,
   pub scan_mode: Option<ScanMode>,
   pub power_off: PowerOffState,
   pub lea: LeaSnapshot,
   pub devices: Vec<DeviceSnapshot>,
   pub pending_reconnects: usize,
   pub last_disconnect: Option<DisconnectSummary>,
}

pub struct ConnectionCore {
   pub(crate) config: Config,
   pub(crate) stack: StackSender,
   pub(crate) events: EventSender,
   pub(crate) store: StoreHandle,
   pub(crate) timers: Timers,
   pub(crate) registry: DeviceRegistry,
   pub(crate) manager: ManagerContext,
   pub(crate) power_off: SharedPowerOff,
   pub(crate) lea: LeaPolicy,
   pub(crate) reconnect: ReconnectQueue,
   pub(crate) role_check: RoleCheck,
   pub(crate) signaling_ouis: SmallVec<[[u8; 3]; 4]>,
   pub(crate) max_phones: u8,
}

impl ConnectionCore {
   pub fn new(
      config: Config,
      stack: StackSender,
      events: EventSender,
      store: StoreHandle,
      scheduler: Arc<dyn Scheduler>,
   ) -> Result<Self> {
      let local_name = store
         .get(keys::LOCAL_NAME)
         .and_then(|bytes| String::from_utf8(bytes).ok())
         .map_or_else(|| SmolStr::new(&config.device_name), SmolStr::from);
      let role_check = RoleCheck::new(
         config.tws_mac_prefix_bytes()?,
         load_addr(&*store, keys::LOCAL_ADDR),
         local_name,
         config.tws_name_match,
      );
      let lea = LeaPolicy::new(
         config.lea_single_point,
         config.lea_multipoint_limit,
         config.pairing_duration(),
         load_addr(&*store, keys::LEA_PEER),
      );

      Ok(Self {
         stack,
         events,
         store,
         timers: Timers::new(scheduler),
         registry: DeviceRegistry::new(),
         manager: ManagerContext::default(),
         power_off: Arc::new(Mutex::new(PowerOffContext::default())),
         lea,
         reconnect: ReconnectQueue::from_config(&config),
         role_check,
         signaling_ouis: config.signaling_ouis(),
         max_phones: config.phone_limit(),
         config,
      })
   }

   /// Brings the Bluetooth side up: ready event, wait window, scan mode
   /// and LE-Audio.
   pub fn start(&mut self) {
      if self.manager.started {
         return;
      }
      info!("Session core starting ({} phone(s) max)", self.max_phones);
      self.manager.reset();
      self.manager.started = true;
      self.recount_links();
      self.events.emit(AppEvent::BtReady);
      self.restart_wait_window();
      self.set_status(Status::WaitConnect, false, None);
      self.lea.post(LeaEvent::BtOn);
      self.drain_lea();
   }

   /// Rebuilds the link counters from records that outlived a power-down.
   fn recount_links(&mut self) {
      let phones = self
         .registry
         .iter()
         .filter(|(_, record)| record.counts_as_phone())
         .count();
      self.manager.phone_count = u8::try_from(phones).unwrap_or(u8::MAX);
      self.manager.tws_peer = self
         .registry
         .iter()
         .find(|(_, record)| record.is_tws)
         .map(|(_, record)| record.addr);
      self.manager.tws_paired = self.manager.tws_peer.is_some();
      if phones > 0 || self.manager.tws_paired {
         info!(
            "Resuming with {phones} phone(s){} still linked",
            if self.manager.tws_paired { " and the TWS peer" } else { "" }
         );
      }
   }

   /// Drops every link record and timer and returns to the initial state.
   pub fn stop(&mut self) {
      info!("Session core stopping");
      self.registry.clear();
      self.reconnect.clear();
      self.manager.reset();
      *self.power_off.lock() = PowerOffContext::default();
      self.lea.post(LeaEvent::BtOff);
      self.drain_lea();
   }

   pub fn handle(&mut self, input: CoreInput) -> Verdict {
      let verdict = match input {
         CoreInput::Link(event) => self.handle_link_event(event),
         CoreInput::Lea(event) => {
            self.lea.post(event);
            Verdict::Accept
         },
         CoreInput::PowerOff(request) => {
            self.request_power_off(request);
            Verdict::Accept
         },
         CoreInput::TwsTeardownComplete => {
            self.tws_teardown_complete();
            Verdict::Accept
         },
         CoreInput::EnterPairing => {
            self.enter_pairing();
            Verdict::Accept
         },
         CoreInput::TwsPairSearch => {
            self.tws_pair_search();
            Verdict::Accept
         },
         CoreInput::ClearPairedList => {
            self.clear_paired_list();
            Verdict::Accept
         },
         CoreInput::TwsCandidate(candidate) => {
            if self.check_tws_candidate(&candidate) {
               Verdict::Accept
            } else {
               Verdict::Reject
            }
         },
         CoreInput::Timer(expiry) => {
            self.on_timer(&expiry);
            Verdict::Accept
         },
      };
      self.drain_lea();
      verdict
   }

   fn on_timer(&mut self, expiry: &Expiry) {
      match expiry.kind {
         TimerKind::Device(key, timer) => self.on_device_timer(key, timer, expiry),
         TimerKind::PowerOff => self.on_power_off_timer(expiry),
         TimerKind::Lea => {
            self.lea.on_timer(expiry);
         },
         TimerKind::WaitConnect => self.on_wait_window_expired(expiry),
         TimerKind::PairMode => self.on_pair_mode_expired(expiry),
         TimerKind::Reconnect(_) => {
            self.reconnect.on_timer(expiry, &mut self.timers, &*self.stack);
         },
      }
   }

   fn drain_lea(&mut self) {
      for effect in self.lea.drain(&mut self.timers) {
         match effect {
            LeaEffect::Advertise(params) => {
               self.stack.submit(StackCommand::LeAdvertise { params });
               self.events.emit(AppEvent::LeAdvertising { params });
            },
            LeaEffect::RememberPeer(peer) => {
               if let Err(e) = self.store.set(keys::LEA_PEER, &peer.0) {
                  warn!("Failed to persist LE peer {peer}: {e}");
               }
            },
         }
      }
   }

   pub fn check_tws_candidate(&self, candidate: &Candidate) -> bool {
      is_tws_candidate(candidate, &self.role_check)
   }

   pub const fn config(&self) -> &Config {
      &self.config
   }

   pub const fn status(&self) -> Status {
      self.manager.status
   }

   pub const fn phone_count(&self) -> u8 {
      self.manager.phone_count
   }

   pub fn power_off_context(&self) -> SharedPowerOff {
      self.power_off.clone()
   }

   pub fn lea_snapshot_cell(&self) -> Arc<AtomicCell<LeaSnapshot>> {
      self.lea.snapshot_cell()
   }

   pub fn snapshot(&self) -> CoreSnapshot {
      let devices = self
         .registry
         .iter()
         .map(|(_, record)| DeviceSnapshot {
            addr: record.addr,
            handle: record.handle,
            name: record.name.clone(),
            is_tws: record.is_tws,
            notify_connected: record.notify_connected,
            profiles: record.profiles,
            pending_actions: record.pending_actions(),
         })
         .collect();
      CoreSnapshot {
         started: self.manager.started,
         status: self.manager.status,
         phone_count: self.manager.phone_count,
         tws_paired: self.manager.tws_paired,
         tws_role: self.manager.tws_role,
         scan_mode: self.manager.scan_mode,
         power_off: self.power_off.lock().state,
         lea: self.lea.snapshot(),
         devices,
         pending_reconnects: self.reconnect.len(),
         last_disconnect: self.manager.last_disconnect,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      policy::lea::{AdvMode, AdvParams},
      sim::Simulation,
      store::{MemoryStore, PropertyStore},
      types::HciReason,
   };

   const LE_PEER: BdAddr = BdAddr([0x70, 1, 2, 3, 4, 5]);

   #[test]
   fn test_start_announces_ready_and_opens_scan() {
      let sim = Simulation::new(Config::default()).unwrap();
      let events = sim.events.take();
      assert_eq!(events.first(), Some(&AppEvent::BtReady));
      assert!(events.contains(&AppEvent::ScanModeChanged { mode: ScanMode::OPEN }));
      assert!(events.contains(&AppEvent::LeAdvertising {
         params: AdvParams::general(),
      }));
      assert_eq!(sim.core.status(), Status::WaitConnect);
   }

   #[test]
   fn test_bad_mac_prefix_fails_construction() {
      let config = Config {
         tws_mac_prefix: Some("zz".into()),
         ..Config::default()
      };
      assert!(Simulation::new(config).is_err());
   }

   #[test]
   fn test_lea_peer_is_persisted_and_restored() {
      let store: StoreHandle = Arc::new(MemoryStore::new());
      {
         let mut sim = Simulation::with_store(Config::default(), store.clone()).unwrap();
         sim.feed(CoreInput::Lea(LeaEvent::Connect { peer: LE_PEER }));
         sim.feed(CoreInput::Lea(LeaEvent::Disconnect {
            reason: HciReason::CONNECTION_TIMEOUT,
            peer: LE_PEER,
         }));
         assert_eq!(sim.core.lea.snapshot().adv, AdvParams::directed(LE_PEER));
      }
      assert_eq!(load_addr(&*store, keys::LEA_PEER), Some(LE_PEER));

      let mut sim = Simulation::with_store(Config::default(), store).unwrap();
      assert_eq!(sim.core.lea.remembered(), Some(LE_PEER));
      sim.feed(CoreInput::Lea(LeaEvent::Disconnect {
         reason: HciReason::LL_RESPONSE_TIMEOUT,
         peer: BdAddr::EMPTY,
      }));
      assert_eq!(sim.core.lea.snapshot().adv.mode, AdvMode::Directed);
   }

   #[test]
   fn test_tws_candidate_verdict() {
      let store = MemoryStore::new();
      store.set(keys::LOCAL_NAME, b"Budlink Pro").unwrap();
      let mut sim = Simulation::with_store(
         Config {
            tws_mac_prefix: Some("a1b2c3".into()),
            ..Config::default()
         },
         Arc::new(store),
      )
      .unwrap();
      let input = |addr: [u8; 6], name: &str| {
         CoreInput::TwsCandidate(Candidate {
            addr: BdAddr(addr),
            name: name.into(),
         })
      };
      assert_eq!(sim.feed(input([0xA1, 0xB2, 0xC3, 1, 2, 3], "Budlink Pro L")), Verdict::Accept);
      assert_eq!(sim.feed(input([0xA1, 0xB2, 0xC4, 1, 2, 3], "Budlink Pro L")), Verdict::Reject);
   }

   #[test]
   fn test_stop_releases_everything() {
      let mut sim = Simulation::new(Config::default()).unwrap();
      sim.connect_phone(BdAddr([0x40, 0, 0, 0, 0, 1]), ConnHandle(0x10));
      sim.core.stop();
      let snapshot = sim.core.snapshot();
      assert!(!snapshot.started);
      assert!(snapshot.devices.is_empty());
      assert_eq!(snapshot.phone_count, 0);
      assert!(!snapshot.lea.enabled);
      assert_eq!(sim.clock.pending(), 0);
   }

   #[test]
   fn test_core_input_json_shape() {
      let input: CoreInput = serde_json::from_str(
         r#"{"kind":"link","type":"profile_connected","handle":16,"profile":"a2dp"}"#,
      )
      .unwrap();
      assert!(matches!(input, CoreInput::Link(LinkEvent::ProfileConnected { .. })));
      let input: CoreInput =
         serde_json::from_str(r#"{"kind":"power_off","origin":"remote","single":true}"#).unwrap();
      assert_eq!(
         input,
         CoreInput::PowerOff(PowerOffRequest {
            origin: crate::policy::power_off::PowerOffOrigin::Remote,
            single: true,
         })
      );
      assert!(serde_json::from_str::<CoreInput>(r#"{"kind":"timer"}"#).is_err());
   }
}
