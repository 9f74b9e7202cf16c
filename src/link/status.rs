//! Device-wide connectivity status.
//!
//! Per-link events funnel into [`ConnectionCore::set_status`], which keeps
//! the phone counter, decides which prompt tone to request and re-derives
//! the scan mode before returning.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
   connection::ConnectionCore,
   event::{AppEvent, ToneKind},
   link::registry::{DeviceKey, REGISTRY_CAPACITY},
   stack::StackCommand,
   store::keys,
   timer::{DelayedAction, Expiry, TimerKind, take_if_live},
   types::{BdAddr, HciReason, TwsRole},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum Status {
   #[default]
   LinkNone,
   WaitConnect,
   PairMode,
   Connected,
   Disconnected,
   TwsPaired,
   TwsUnpaired,
   TwsPairSearch,
}

/// Inquiry/page scan enablement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScanMode {
   pub discoverable: bool,
   pub connectable: bool,
}

impl ScanMode {
   pub const OFF: Self = Self {
      discoverable: false,
      connectable: false,
   };
   pub const OPEN: Self = Self {
      discoverable: true,
      connectable: true,
   };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
   #[default]
   Idle,
   /// Looking for the other earpiece.
   Searching,
   ClearingList,
}

/// What the last ACL disconnect looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisconnectSummary {
   pub addr: BdAddr,
   pub reason: HciReason,
   pub timeout: bool,
   pub need_resume_play: bool,
   pub tone_suppressed: bool,
}

#[derive(Debug, Default)]
pub struct ManagerContext {
   pub started: bool,
   pub status: Status,
   /// Phones announced as connected.
   pub phone_count: u8,
   pub tws_paired: bool,
   pub tws_peer: Option<BdAddr>,
   pub tws_role: TwsRole,
   pub pairing: PairingState,
   /// Phones disconnected locally to make room for another.
   pub halted: SmallVec<[BdAddr; 2]>,
   pub last_reason: Option<HciReason>,
   pub last_disconnect: Option<DisconnectSummary>,
   pub wait_window_open: bool,
   pub wait_window: Option<DelayedAction>,
   pub pair_mode_timer: Option<DelayedAction>,
   pub scan_mode: Option<ScanMode>,
}

impl ManagerContext {
   pub fn reset(&mut self) {
      *self = Self::default();
   }
}

/// Scan mode implied by the manager state.
pub fn derive_scan_mode(ctx: &ManagerContext, max_phones: u8, powering_off: bool) -> ScanMode {
   if !ctx.started || powering_off || ctx.tws_role == TwsRole::Slave {
      return ScanMode::OFF;
   }
   if matches!(ctx.status, Status::PairMode | Status::TwsPairSearch) {
      return ScanMode::OPEN;
   }
   let room = ctx.phone_count < max_phones;
   ScanMode {
      discoverable: room && ctx.wait_window_open,
      connectable: room,
   }
}

enum Outcome {
   Ignore,
   Announce { tone: Option<ToneKind>, unlinked: bool },
}

impl Outcome {
   const fn tone(tone: Option<ToneKind>) -> Self {
      Self::Announce {
         tone,
         unlinked: false,
      }
   }
}

impl ConnectionCore {
   pub fn set_status(&mut self, status: Status, suppress_tone: bool, device: Option<DeviceKey>) {
      let outcome = match status {
         Status::Connected => self.status_connected(device),
         Status::Disconnected => self.status_disconnected(device, suppress_tone),
         Status::TwsPaired => {
            if self.manager.tws_paired {
               Outcome::Ignore
            } else {
               self.manager.tws_paired = true;
               if self.manager.pairing == PairingState::Searching {
                  self.stack.submit(StackCommand::StopTwsSearch);
                  self.manager.pairing = PairingState::Idle;
                  self.manager.pair_mode_timer = None;
               }
               Outcome::tone(Some(ToneKind::TwsConnected(self.manager.tws_role)))
            }
         },
         Status::TwsUnpaired => {
            if self.manager.tws_paired {
               let role = self.manager.tws_role;
               self.manager.tws_paired = false;
               self.manager.tws_peer = None;
               self.manager.tws_role = TwsRole::Standalone;
               if !self.powering_off() {
                  self.restart_wait_window();
               }
               Outcome::tone(Some(ToneKind::TwsDisconnected(role)))
            } else {
               Outcome::Ignore
            }
         },
         Status::LinkNone | Status::WaitConnect | Status::PairMode | Status::TwsPairSearch => {
            Outcome::tone(None)
         },
      };

      let Outcome::Announce { tone, unlinked } = outcome else {
         debug!("Status {status} ignored");
         return;
      };
      let tone = tone.filter(|_| !suppress_tone);

      if self.manager.status != status {
         info!("Status {} -> {status}", self.manager.status);
      }
      self.manager.status = status;
      self.events.emit(AppEvent::StatusChanged {
         status,
         tone: tone.is_some(),
      });
      if let Some(kind) = tone {
         self.events.emit(AppEvent::Tone { kind });
      }
      if unlinked {
         self.events.emit(AppEvent::Unlinked);
      }
      self.refresh_scan_mode();
   }

   fn status_connected(&mut self, device: Option<DeviceKey>) -> Outcome {
      let Some(record) = device.and_then(|key| self.registry.get_mut(key)) else {
         warn!("Connected status without a live device");
         return Outcome::Ignore;
      };
      if record.is_tws {
         return Outcome::Ignore;
      }

      let tone = if record.notify_connected {
         if record.notified_tts {
            None
         } else {
            record.notified_tts = true;
            Some(ToneKind::Reconnected)
         }
      } else {
         record.notify_connected = true;
         let count = (self.manager.phone_count + 1).min(REGISTRY_CAPACITY as u8);
         self.manager.phone_count = count;
         info!("{} connected, {count} phone(s)", record.addr);
         // Links we paged ourselves come back silently.
         if !record.connect_requested_by_peer {
            None
         } else if count == 1 {
            Some(ToneKind::FirstConnected)
         } else {
            Some(ToneKind::SecondConnected)
         }
      };

      self.manager.pair_mode_timer = None;
      if self.manager.pairing == PairingState::ClearingList {
         self.manager.pairing = PairingState::Idle;
      }
      if self.manager.phone_count >= self.max_phones {
         self.manager.wait_window = None;
         self.manager.wait_window_open = false;
      }
      Outcome::tone(tone)
   }

   fn status_disconnected(&mut self, device: Option<DeviceKey>, suppress_tone: bool) -> Outcome {
      if let Some(key) = device {
         let Some(record) = self.registry.get_mut(key) else {
            return Outcome::Ignore;
         };
         if !record.counts_as_phone() {
            return Outcome::Ignore;
         }
         record.notify_connected = false;
         record.notified_tts = false;
      }
      self.manager.phone_count = self.manager.phone_count.saturating_sub(1);

      let key_missing = self.manager.last_reason.is_some_and(HciReason::is_key_missing);
      let tone = (!suppress_tone && !key_missing).then_some(ToneKind::Disconnected);
      let unlinked = self.manager.phone_count == 0;

      if self.manager.tws_role != TwsRole::Slave && !self.powering_off() {
         self.restart_wait_window();
      }
      Outcome::Announce { tone, unlinked }
   }

   /// Pushes the derived scan mode to the stack when it changed.
   pub(crate) fn refresh_scan_mode(&mut self) {
      let mode = derive_scan_mode(&self.manager, self.max_phones, self.powering_off());
      if self.manager.scan_mode == Some(mode) {
         return;
      }
      debug!("Scan mode -> {mode:?}");
      self.manager.scan_mode = Some(mode);
      self.stack.submit(StackCommand::SetScanMode { mode });
      self.events.emit(AppEvent::ScanModeChanged { mode });
   }

   /// Opens the wait-for-connection window; without a configured length it
   /// stays open.
   pub(crate) fn restart_wait_window(&mut self) {
      self.manager.wait_window = self
         .config
         .wait_connect_window()
         .map(|window| self.timers.start(window, TimerKind::WaitConnect));
      self.manager.wait_window_open = true;
   }

   pub(crate) fn on_wait_window_expired(&mut self, expiry: &Expiry) {
      if !take_if_live(&mut self.manager.wait_window, expiry) {
         return;
      }
      info!("Wait-for-connection window closed");
      self.manager.wait_window_open = false;
      self.refresh_scan_mode();
   }

   /// Makes the device discoverable for the pairing window.
   pub fn enter_pairing(&mut self) {
      if !self.manager.started || self.powering_off() {
         info!("Ignoring pairing request while powered off");
         return;
      }
      self.manager.pair_mode_timer =
         Some(self.timers.start(self.config.pairing_duration(), TimerKind::PairMode));
      self.set_status(Status::PairMode, false, None);
   }

   /// Starts looking for the other earpiece.
   pub fn tws_pair_search(&mut self) {
      if !self.manager.started || self.powering_off() {
         info!("Ignoring TWS search while powered off");
         return;
      }
      if self.manager.tws_paired {
         info!("TWS peer already paired");
         return;
      }
      if self.manager.pairing != PairingState::Searching {
         self.manager.pairing = PairingState::Searching;
         self.stack.submit(StackCommand::StartTwsSearch);
      }
      self.manager.pair_mode_timer =
         Some(self.timers.start(self.config.pairing_duration(), TimerKind::PairMode));
      self.set_status(Status::TwsPairSearch, false, None);
   }

   /// Forgets every paired phone and reopens pairing.
   pub fn clear_paired_list(&mut self) {
      if !self.manager.started || self.powering_off() {
         info!("Ignoring clear-paired-list while powered off");
         return;
      }
      info!("Clearing paired list");
      self.manager.pairing = PairingState::ClearingList;
      self.manager.halted.clear();
      self.reconnect.clear();
      if self.manager.phone_count > 0 {
         self.stack.submit(StackCommand::DisconnectAllPhones);
      }
      self.stack.submit(StackCommand::ClearPairedList);
      for key in self.store.keys_with_prefix(keys::VOLUME_PREFIX) {
         if let Err(e) = self.store.remove(&key) {
            warn!("Failed to remove {key}: {e}");
         }
      }
      self.enter_pairing();
   }

   pub(crate) fn on_pair_mode_expired(&mut self, expiry: &Expiry) {
      if !take_if_live(&mut self.manager.pair_mode_timer, expiry) {
         return;
      }
      if self.manager.pairing == PairingState::Searching {
         info!("TWS search timed out");
         self.stack.submit(StackCommand::StopTwsSearch);
      }
      self.manager.pairing = PairingState::Idle;
      if matches!(self.manager.status, Status::PairMode | Status::TwsPairSearch) {
         info!("Pairing window closed");
         self.set_status(Status::WaitConnect, false, None);
      }
   }
}
