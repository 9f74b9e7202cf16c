//! Power-off orchestration.
//!
//! A cycle walks `Start → TwsProc → DisconnectPhone → WaitDisconnectPhone →
//! PhoneDisconnected → Finish`. Entering a state is the pure [`enter`]
//! function and a timer firing in a state is the pure [`expire`] function;
//! the core applies the returned actions and keeps exactly one
//! [`DelayedAction`] armed per waiting state.

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
   connection::ConnectionCore,
   event::{AppEvent, PowerOffResult},
   link::status::PairingState,
   policy::lea::LeaEvent,
   stack::StackCommand,
   timer::{DelayedAction, Expiry, TimerKind, take_if_live},
};

/// Delay between the immediate steps of a cycle.
pub const TICK: Duration = Duration::from_millis(1);
/// How long phones get to drop their links once asked to.
pub const PHONE_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum PowerOffState {
   #[default]
   None,
   Start,
   TwsProc,
   DisconnectPhone,
   WaitDisconnectPhone,
   PhoneDisconnected,
   Finish,
}

impl PowerOffState {
   pub const fn is_active(self) -> bool {
      !matches!(self, Self::None)
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PowerOffFlags {
   pub local: bool,
   pub remote: bool,
   /// Only this earpiece goes down; the peer keeps running.
   pub single: bool,
   pub wait_timed_out: bool,
   /// A local request arrived while this cycle was running.
   pub later_request: bool,
}

impl PowerOffFlags {
   pub const fn local() -> Self {
      Self {
         local: true,
         remote: false,
         single: false,
         wait_timed_out: false,
         later_request: false,
      }
   }

   /// Local, or a remote request that takes the whole pair down.
   pub const fn genuine(&self) -> bool {
      self.local || (self.remote && !self.single)
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerOffOrigin {
   Local,
   /// Forwarded by the TWS peer.
   Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerOffRequest {
   pub origin: PowerOffOrigin,
   #[serde(default)]
   pub single: bool,
}

impl PowerOffRequest {
   pub const fn local() -> Self {
      Self {
         origin: PowerOffOrigin::Local,
         single: false,
      }
   }

   const fn flags(self) -> PowerOffFlags {
      PowerOffFlags {
         local: matches!(self.origin, PowerOffOrigin::Local),
         remote: matches!(self.origin, PowerOffOrigin::Remote),
         single: self.single,
         wait_timed_out: false,
         later_request: false,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerOffFacts {
   pub phone_count: u8,
   pub tws_connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOffAction {
   DisableScan,
   StopPairingSearch,
   StopReconnect,
   NotifyLeaBtOff,
   BeginTwsTeardown,
   DisconnectAllPhones,
   Report(PowerOffResult),
   /// The Bluetooth side is down for good.
   PowerDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
   Idle,
   Now(PowerOffState),
   Wait(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
   pub flags: PowerOffFlags,
   pub actions: SmallVec<[PowerOffAction; 4]>,
   pub next: Next,
}

/// Work done on entering `state`.
pub fn enter(
   state: PowerOffState,
   flags: PowerOffFlags,
   facts: PowerOffFacts,
   tws_guard: Duration,
) -> Transition {
   let mut actions = SmallVec::new();
   let mut flags = flags;
   let next = match state {
      PowerOffState::None => Next::Idle,
      PowerOffState::Start => {
         if flags.genuine() {
            actions.extend([
               PowerOffAction::DisableScan,
               PowerOffAction::StopPairingSearch,
               PowerOffAction::StopReconnect,
               PowerOffAction::NotifyLeaBtOff,
            ]);
         }
         Next::Wait(TICK)
      },
      PowerOffState::TwsProc => {
         if facts.tws_connected {
            actions.push(PowerOffAction::BeginTwsTeardown);
            Next::Wait(tws_guard)
         } else {
            Next::Wait(TICK)
         }
      },
      PowerOffState::DisconnectPhone => {
         if flags.genuine() && facts.phone_count > 0 {
            actions.push(PowerOffAction::DisconnectAllPhones);
            Next::Now(PowerOffState::WaitDisconnectPhone)
         } else {
            Next::Now(PowerOffState::Finish)
         }
      },
      PowerOffState::WaitDisconnectPhone => Next::Wait(PHONE_DISCONNECT_TIMEOUT),
      PowerOffState::PhoneDisconnected => Next::Now(PowerOffState::Finish),
      PowerOffState::Finish => {
         let result = match (flags.local, flags.remote && !flags.single, flags.wait_timed_out) {
            (true, _, false) => Some(PowerOffResult::Ok),
            (true, _, true) => Some(PowerOffResult::Timeout),
            (false, true, false) => Some(PowerOffResult::SyncOk),
            (false, true, true) => Some(PowerOffResult::SyncTimeout),
            (false, false, _) => None,
         };
         match result {
            Some(result) => actions.push(PowerOffAction::Report(result)),
            None => info!("Single-device power-off finished"),
         }
         if flags.later_request {
            flags = PowerOffFlags::local();
            Next::Now(PowerOffState::Start)
         } else {
            if flags.genuine() {
               actions.push(PowerOffAction::PowerDown);
            }
            Next::Idle
         }
      },
   };
   Transition {
      flags,
      actions,
      next,
   }
}

/// Where a cycle goes when the timer armed in `state` fires.
pub fn expire(
   state: PowerOffState,
   flags: PowerOffFlags,
) -> Option<(PowerOffState, PowerOffFlags)> {
   match state {
      PowerOffState::Start => Some((PowerOffState::TwsProc, flags)),
      PowerOffState::TwsProc => Some((PowerOffState::DisconnectPhone, flags)),
      PowerOffState::DisconnectPhone => Some((PowerOffState::Finish, flags)),
      PowerOffState::WaitDisconnectPhone => Some((
         PowerOffState::Finish,
         PowerOffFlags {
            wait_timed_out: true,
            ..flags
         },
      )),
      PowerOffState::None | PowerOffState::PhoneDisconnected | PowerOffState::Finish => None,
   }
}

/// Shared power-off state; also read by [`crate::runtime::CoreHandle`].
#[derive(Debug, Default)]
pub struct PowerOffContext {
   pub state: PowerOffState,
   pub flags: PowerOffFlags,
   timer: Option<DelayedAction>,
   /// States entered by the current (or last) cycle.
   pub history: SmallVec<[PowerOffState; 8]>,
   pub cycles: u32,
   pub last_result: Option<PowerOffResult>,
}

impl PowerOffContext {
   /// A cycle that takes the Bluetooth side down is running.
   pub const fn is_shutting_down(&self) -> bool {
      self.state.is_active() && self.flags.genuine()
   }

   /// Records a local request arriving mid-cycle. Returns false when idle.
   pub fn queue_local(&mut self) -> bool {
      if !self.state.is_active() {
         return false;
      }
      if !self.flags.later_request {
         info!("Power-off in progress ({}), queuing local request", self.state);
      }
      self.flags.later_request = true;
      true
   }
}

pub type SharedPowerOff = Arc<Mutex<PowerOffContext>>;

impl ConnectionCore {
   pub fn request_power_off(&mut self, request: PowerOffRequest) {
      {
         let mut ctx = self.power_off.lock();
         if ctx.state.is_active() {
            match request.origin {
               PowerOffOrigin::Local => {
                  ctx.queue_local();
               },
               PowerOffOrigin::Remote => {
                  info!("Power-off in progress ({}), dropping remote request", ctx.state);
               },
            }
            return;
         }
         info!("Power-off requested: {request:?}");
         ctx.flags = request.flags();
      }
      self.drive_power_off(PowerOffState::Start);
   }

   /// The TWS peer finished its part of the teardown.
   pub fn tws_teardown_complete(&mut self) {
      {
         let mut ctx = self.power_off.lock();
         if ctx.state != PowerOffState::TwsProc {
            debug!("TWS teardown completion outside TwsProc ({})", ctx.state);
            return;
         }
         ctx.timer = None;
      }
      self.drive_power_off(PowerOffState::DisconnectPhone);
   }

   pub(crate) fn power_off_phone_count(&mut self, count: u8) {
      {
         let mut ctx = self.power_off.lock();
         if ctx.state != PowerOffState::WaitDisconnectPhone || count > 0 {
            return;
         }
         ctx.timer = None;
      }
      self.drive_power_off(PowerOffState::PhoneDisconnected);
   }

   pub(crate) fn on_power_off_timer(&mut self, expiry: &Expiry) {
      let next = {
         let mut ctx = self.power_off.lock();
         if !take_if_live(&mut ctx.timer, expiry) {
            debug!("Stale power-off timer {expiry:?}");
            return;
         }
         let Some((next, flags)) = expire(ctx.state, ctx.flags) else {
            warn!("Power-off timer fired in {}", ctx.state);
            return;
         };
         if flags.wait_timed_out && !ctx.flags.wait_timed_out {
            info!("Phones did not disconnect in time");
         }
         ctx.flags = flags;
         next
      };
      self.drive_power_off(next);
   }

   /// Genuine power-off running.
   pub(crate) fn powering_off(&self) -> bool {
      self.power_off.lock().is_shutting_down()
   }

   fn drive_power_off(&mut self, mut state: PowerOffState) {
      let shared = self.power_off.clone();
      loop {
         let facts = PowerOffFacts {
            phone_count: self.manager.phone_count,
            tws_connected: self.manager.tws_paired,
         };
         let transition = {
            let mut ctx = shared.lock();
            if state == PowerOffState::Start {
               ctx.history.clear();
               ctx.cycles += 1;
            }
            debug!("Power-off {} -> {state}", ctx.state);
            ctx.state = state;
            ctx.history.push(state);
            ctx.timer = None;
            let transition = enter(state, ctx.flags, facts, self.config.tws_teardown_timeout());
            ctx.flags = transition.flags;
            transition
         };

         for action in transition.actions {
            self.apply_power_off_action(action);
         }

         match transition.next {
            Next::Idle => {
               let mut ctx = shared.lock();
               // A handle may have queued a request while Finish was reporting.
               if ctx.flags.later_request {
                  info!("Local power-off queued during Finish, running another cycle");
                  ctx.flags = PowerOffFlags::local();
                  state = PowerOffState::Start;
                  continue;
               }
               ctx.state = PowerOffState::None;
               ctx.timer = None;
               break;
            },
            Next::Now(next) => state = next,
            Next::Wait(delay) => {
               let timer = self.timers.start(delay, TimerKind::PowerOff);
               shared.lock().timer = Some(timer);
               break;
            },
         }
      }
   }

   fn apply_power_off_action(&mut self, action: PowerOffAction) {
      match action {
         PowerOffAction::DisableScan => self.refresh_scan_mode(),
         PowerOffAction::StopPairingSearch => {
            if self.manager.pairing == PairingState::Searching {
               self.stack.submit(StackCommand::StopTwsSearch);
            }
            self.manager.pairing = PairingState::Idle;
            self.manager.pair_mode_timer = None;
            self.manager.wait_window = None;
         },
         PowerOffAction::StopReconnect => self.reconnect.clear(),
         PowerOffAction::NotifyLeaBtOff => self.lea.post(LeaEvent::BtOff),
         PowerOffAction::BeginTwsTeardown => self.stack.submit(StackCommand::BeginTwsTeardown),
         PowerOffAction::DisconnectAllPhones => {
            info!("Disconnecting {} phone(s) for power-off", self.manager.phone_count);
            self.stack.submit(StackCommand::DisconnectAllPhones);
         },
         PowerOffAction::Report(result) => {
            info!("Power-off finished: {result}");
            self.power_off.lock().last_result = Some(result);
            self.events.emit(AppEvent::PowerOff { result });
         },
         PowerOffAction::PowerDown => {
            self.manager.started = false;
            self.refresh_scan_mode();
         },
      }
   }
}
