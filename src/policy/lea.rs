//! LE-Audio access policy.
//!
//! An explicit state machine over {Waiting, Pairing, Reconnecting,
//! Connected} that decides how the device advertises on LE: open general
//! advertising while below capacity, pairing advertising from a
//! host-resolved private address, or a short directed burst toward the
//! remembered peer after an abnormal link loss.
//!
//! Events are queued and drained by one consumer, so handlers never
//! re-enter. After every handled event the committed advertising
//! parameters are published to a lock-free cell that other subsystems read.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
   timer::{DelayedAction, Expiry, TimerKind, Timers, take_if_live},
   types::{BdAddr, HciReason},
};

/// Fixed directed-advertising window after an abnormal disconnect.
pub const RECONNECT_WINDOW: Duration = Duration::from_secs(3);
/// Upper bound on simultaneously connected LE-Audio peers.
pub const MAX_LEA_PEERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum LeaState {
   #[default]
   Waiting,
   Pairing,
   Reconnecting,
   Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvMode {
   #[default]
   Off,
   General,
   Pairing,
   Directed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnAddress {
   #[default]
   Identity,
   /// Host-resolved private address, used while pairing.
   ResolvablePrivate,
}

/// LE advertising parameters as committed by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AdvParams {
   pub mode: AdvMode,
   pub own_address: OwnAddress,
   pub peer: Option<BdAddr>,
}

impl AdvParams {
   pub const OFF: Self = Self {
      mode: AdvMode::Off,
      own_address: OwnAddress::Identity,
      peer: None,
   };

   pub const fn general() -> Self {
      Self {
         mode: AdvMode::General,
         own_address: OwnAddress::Identity,
         peer: None,
      }
   }

   pub const fn pairing() -> Self {
      Self {
         mode: AdvMode::Pairing,
         own_address: OwnAddress::ResolvablePrivate,
         peer: None,
      }
   }

   pub const fn directed(peer: BdAddr) -> Self {
      Self {
         mode: AdvMode::Directed,
         own_address: OwnAddress::Identity,
         peer: Some(peer),
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaEvent {
   Connect { peer: BdAddr },
   Disconnect { reason: HciReason, peer: BdAddr },
   Pairing,
   ExitPairing,
   SwitchSinglePoint,
   SwitchMultiPoint,
   BtOn,
   BtOff,
}

/// State published after every handled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LeaSnapshot {
   pub state: LeaState,
   pub enabled: bool,
   pub adv: AdvParams,
   pub connected: u8,
   pub limit: u8,
}

/// Side effects the owner applies after a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaEffect {
   Advertise(AdvParams),
   RememberPeer(BdAddr),
}

pub type LeaEffects = SmallVec<[LeaEffect; 4]>;

#[derive(Debug)]
enum LeaInput {
   Event(LeaEvent),
   Timeout,
}

pub struct LeaPolicy {
   state: LeaState,
   enabled: bool,
   limit: u8,
   multipoint_limit: u8,
   peers: heapless::Vec<BdAddr, MAX_LEA_PEERS>,
   remembered: Option<BdAddr>,
   timer: Option<DelayedAction>,
   adv: AdvParams,
   pairing_duration: Duration,
   queue: VecDeque<LeaInput>,
   published: Arc<AtomicCell<LeaSnapshot>>,
}

impl LeaPolicy {
   /// Creates a disabled policy; `BtOn` brings it up.
   pub fn new(
      single_point: bool,
      multipoint_limit: u8,
      pairing_duration: Duration,
      remembered: Option<BdAddr>,
   ) -> Self {
      let multipoint_limit = multipoint_limit.clamp(1, MAX_LEA_PEERS as u8);
      let policy = Self {
         state: LeaState::Waiting,
         enabled: false,
         limit: if single_point { 1 } else { multipoint_limit },
         multipoint_limit,
         peers: heapless::Vec::new(),
         remembered: remembered.filter(|addr| !addr.is_empty()),
         timer: None,
         adv: AdvParams::OFF,
         pairing_duration,
         queue: VecDeque::new(),
         published: Arc::new(AtomicCell::new(LeaSnapshot::default())),
      };
      policy.publish();
      policy
   }

   pub const fn state(&self) -> LeaState {
      self.state
   }

   pub const fn remembered(&self) -> Option<BdAddr> {
      self.remembered
   }

   /// Last committed snapshot.
   pub fn snapshot(&self) -> LeaSnapshot {
      self.published.load()
   }

   pub fn snapshot_cell(&self) -> Arc<AtomicCell<LeaSnapshot>> {
      self.published.clone()
   }

   pub fn post(&mut self, event: LeaEvent) {
      self.queue.push_back(LeaInput::Event(event));
   }

   /// Queues a timeout if `expiry` belongs to the live timer.
   pub fn on_timer(&mut self, expiry: &Expiry) -> bool {
      if take_if_live(&mut self.timer, expiry) {
         self.queue.push_back(LeaInput::Timeout);
         true
      } else {
         false
      }
   }

   /// Handles every queued input in arrival order.
   pub fn drain(&mut self, timers: &mut Timers) -> LeaEffects {
      let mut effects = LeaEffects::new();
      while let Some(input) = self.queue.pop_front() {
         self.handle(input, timers, &mut effects);
         self.publish();
      }
      effects
   }

   fn publish(&self) {
      self.published.store(LeaSnapshot {
         state: self.state,
         enabled: self.enabled,
         adv: self.adv,
         connected: self.peers.len() as u8,
         limit: self.limit,
      });
   }

   fn handle(&mut self, input: LeaInput, timers: &mut Timers, effects: &mut LeaEffects) {
      let event = match input {
         LeaInput::Timeout => {
            self.on_timeout(effects);
            return;
         },
         LeaInput::Event(event) => event,
      };

      match event {
         LeaEvent::BtOff => {
            info!("LE audio policy disabled");
            self.enabled = false;
            self.timer = None;
            self.peers.clear();
            self.state = LeaState::Waiting;
            self.set_adv(AdvParams::OFF, effects);
            return;
         },
         LeaEvent::BtOn => {
            info!("LE audio policy enabled");
            self.enabled = true;
            self.settle(effects);
            return;
         },
         _ if !self.enabled => {
            debug!("LE audio policy disabled, dropping {event:?}");
            return;
         },
         _ => {},
      }

      match event {
         LeaEvent::Connect { peer } => self.on_connect(peer, effects),
         LeaEvent::Disconnect { reason, peer } => self.on_disconnect(reason, peer, timers, effects),
         LeaEvent::Pairing => {
            if self.state == LeaState::Pairing {
               debug!("LE pairing window re-armed");
               self.timer = Some(timers.start(self.pairing_duration, TimerKind::Lea));
            } else {
               self.enter_pairing(timers, effects);
            }
         },
         LeaEvent::ExitPairing => {
            if self.state == LeaState::Pairing {
               self.settle(effects);
            }
         },
         LeaEvent::SwitchSinglePoint => {
            self.limit = 1;
            self.reevaluate(effects);
         },
         LeaEvent::SwitchMultiPoint => {
            self.limit = self.multipoint_limit;
            self.reevaluate(effects);
         },
         LeaEvent::BtOn | LeaEvent::BtOff => {},
      }
   }

   fn on_connect(&mut self, peer: BdAddr, effects: &mut LeaEffects) {
      if peer.is_empty() {
         warn!("LE connect without a peer address");
         return;
      }
      if !self.peers.contains(&peer) && self.peers.push(peer).is_err() {
         warn!("LE peer table full, not tracking {peer}");
      }

      let target = match self.state {
         LeaState::Reconnecting => self.adv.peer,
         _ => None,
      };
      if target.is_none_or(|t| t == peer) {
         self.remember(peer, effects);
      }

      match self.state {
         LeaState::Waiting => self.settle(effects),
         LeaState::Reconnecting => {
            if target == Some(peer) || self.at_capacity() {
               self.settle(effects);
            }
         },
         LeaState::Pairing => {
            if self.at_capacity() {
               self.enter_connected(effects);
            }
         },
         LeaState::Connected => debug!("LE connect from {peer} beyond capacity"),
      }
   }

   fn on_disconnect(
      &mut self,
      reason: HciReason,
      peer: BdAddr,
      timers: &mut Timers,
      effects: &mut LeaEffects,
   ) {
      if let Some(pos) = self.peers.iter().position(|p| *p == peer) {
         self.peers.swap_remove(pos);
      }
      let abnormal = !reason.is_clean_unlink();
      if abnormal && !peer.is_empty() {
         self.remember(peer, effects);
      }

      match self.state {
         LeaState::Waiting | LeaState::Connected => {
            if abnormal {
               self.enter_reconnecting(timers, effects);
            } else {
               self.settle(effects);
            }
         },
         LeaState::Pairing | LeaState::Reconnecting => {
            debug!("LE disconnect ({reason}) while {}", self.state);
         },
      }
   }

   fn on_timeout(&mut self, effects: &mut LeaEffects) {
      match self.state {
         LeaState::Pairing | LeaState::Reconnecting => {
            debug!("LE {} window elapsed", self.state);
            self.settle(effects);
         },
         state => debug!("Stray LE timeout in {state}"),
      }
   }

   fn reevaluate(&mut self, effects: &mut LeaEffects) {
      match self.state {
         LeaState::Waiting | LeaState::Connected => self.settle(effects),
         LeaState::Pairing | LeaState::Reconnecting => {
            if self.at_capacity() {
               self.enter_connected(effects);
            }
         },
      }
   }

   fn at_capacity(&self) -> bool {
      self.peers.len() >= usize::from(self.limit)
   }

   fn settle(&mut self, effects: &mut LeaEffects) {
      if self.at_capacity() {
         self.enter_connected(effects);
      } else {
         self.state = LeaState::Waiting;
         self.timer = None;
         self.set_adv(AdvParams::general(), effects);
      }
   }

   fn enter_connected(&mut self, effects: &mut LeaEffects) {
      self.state = LeaState::Connected;
      self.timer = None;
      self.set_adv(AdvParams::OFF, effects);
   }

   fn enter_pairing(&mut self, timers: &mut Timers, effects: &mut LeaEffects) {
      self.state = LeaState::Pairing;
      self.timer = Some(timers.start(self.pairing_duration, TimerKind::Lea));
      self.set_adv(AdvParams::pairing(), effects);
   }

   fn enter_reconnecting(&mut self, timers: &mut Timers, effects: &mut LeaEffects) {
      let Some(peer) = self.remembered.filter(|p| !p.is_empty()) else {
         debug!("No remembered LE peer, staying open");
         self.settle(effects);
         return;
      };
      self.state = LeaState::Reconnecting;
      self.timer = Some(timers.start(RECONNECT_WINDOW, TimerKind::Lea));
      self.set_adv(AdvParams::directed(peer), effects);
   }

   fn remember(&mut self, peer: BdAddr, effects: &mut LeaEffects) {
      if self.remembered != Some(peer) {
         self.remembered = Some(peer);
         effects.push(LeaEffect::RememberPeer(peer));
      }
   }

   fn set_adv(&mut self, params: AdvParams, effects: &mut LeaEffects) {
      if self.adv != params {
         debug!("LE advertising -> {params:?}");
         self.adv = params;
         effects.push(LeaEffect::Advertise(params));
      }
   }
}
