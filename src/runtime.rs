//! Tokio actor around [`ConnectionCore`].
//!
//! Stack callbacks, control requests and timer expiries all funnel into one
//! task, which owns the core and processes them in arrival order. Timers
//! are tokio sleep tasks that post their expiry to the actor's loopback
//! channel and get aborted when the owning [`DelayedAction`] is dropped.
//!
//! [`DelayedAction`]: crate::timer::DelayedAction

use std::{sync::Arc, time::Duration};

use crossbeam::atomic::AtomicCell;
use log::{debug, info};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   config::Config,
   connection::{ConnectionCore, CoreInput, CoreSnapshot},
   error::{CoreError, Result},
   event::EventSender,
   link::dispatcher::{LinkEvent, Verdict},
   policy::{
      lea::{AdvParams, LeaSnapshot},
      power_off::{PowerOffOrigin, PowerOffRequest, PowerOffState, SharedPowerOff},
   },
   stack::StackSender,
   store::StoreHandle,
   timer::{Cancel, Expiry, Scheduler},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Arms timers as sleeping tokio tasks.
pub struct TokioScheduler {
   loopback: mpsc::Sender<Expiry>,
}

impl Scheduler for TokioScheduler {
   fn arm(&self, delay: Duration, expiry: Expiry) -> Cancel {
      let loopback = self.loopback.clone();
      let task = tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback.send(expiry).await;
      });
      Box::new(move || task.abort())
   }
}

// === Commands ===

#[derive(Debug)]
enum CoreCommand {
   Input(CoreInput, oneshot::Sender<Verdict>),
   Snapshot(oneshot::Sender<CoreSnapshot>),
   Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the running core.
#[derive(Clone)]
pub struct CoreHandle {
   inbox: mpsc::Sender<CoreCommand>,
   power_off: SharedPowerOff,
   lea: Arc<AtomicCell<LeaSnapshot>>,
}

impl CoreHandle {
   /// Builds the core and spawns its actor on the current runtime.
   pub fn spawn(
      config: Config,
      stack: StackSender,
      events: EventSender,
      store: StoreHandle,
   ) -> Result<(Self, JoinHandle<()>)> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let scheduler = Arc::new(TokioScheduler {
         loopback: loopback_tx,
      });
      let core = ConnectionCore::new(config, stack, events, store, scheduler)?;
      let handle = Self {
         inbox: command_tx,
         power_off: core.power_off_context(),
         lea: core.lea_snapshot_cell(),
      };
      let task = tokio::spawn(
         CoreActor {
            core,
            command_rx,
            loopback_rx,
         }
         .run(),
      );
      Ok((handle, task))
   }

   pub async fn send(&self, input: CoreInput) -> Result<Verdict> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(CoreCommand::Input(input, tx))
         .await
         .map_err(|_| CoreError::CoreShutdown)?;
      rx.await.map_err(|_| CoreError::CoreShutdown)
   }

   /// Delivers a stack callback and returns its verdict.
   pub async fn link_event(&self, event: LinkEvent) -> Result<Verdict> {
      self.send(CoreInput::Link(event)).await
   }

   pub async fn request_power_off(&self, request: PowerOffRequest) -> Result<()> {
      let queued =
         request.origin == PowerOffOrigin::Local && self.power_off.lock().queue_local();
      if queued {
         return Ok(());
      }
      self.send(CoreInput::PowerOff(request)).await.map(|_| ())
   }

   pub fn power_off_state(&self) -> PowerOffState {
      self.power_off.lock().state
   }

   /// Last committed LE advertising parameters.
   pub fn le_adv_params(&self) -> AdvParams {
      self.lea.load().adv
   }

   pub async fn snapshot(&self) -> Result<CoreSnapshot> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(CoreCommand::Snapshot(tx))
         .await
         .map_err(|_| CoreError::CoreShutdown)?;
      rx.await.map_err(|_| CoreError::CoreShutdown)
   }

   /// Stops the core and waits for it to release its state.
   pub async fn shutdown(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(CoreCommand::Shutdown(tx))
         .await
         .map_err(|_| CoreError::CoreShutdown)?;
      rx.await.map_err(|_| CoreError::CoreShutdown)
   }
}

// === Core Actor ===

struct CoreActor {
   core: ConnectionCore,
   command_rx: mpsc::Receiver<CoreCommand>,
   loopback_rx: mpsc::Receiver<Expiry>,
}

impl CoreActor {
   async fn run(mut self) {
      info!("Session core actor starting up");
      self.core.start();

      let mut ack = None;
      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Session core actor shutting down");
                  break;
               };
               match cmd {
                  CoreCommand::Input(input, reply) => {
                     let _ = reply.send(self.core.handle(input));
                  },
                  CoreCommand::Snapshot(reply) => {
                     let _ = reply.send(self.core.snapshot());
                  },
                  CoreCommand::Shutdown(reply) => {
                     ack = Some(reply);
                     break;
                  },
               }
            }
            Some(expiry) = self.loopback_rx.recv() => {
               debug!("Timer fired: {expiry:?}");
               self.core.handle(CoreInput::Timer(expiry));
            }
         }
      }

      self.core.stop();
      if let Some(ack) = ack {
         let _ = ack.send(());
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      event::{AppEvent, PowerOffResult},
      sim::{EventLog, RecordingStack},
      store::MemoryStore,
      types::{BdAddr, ConnHandle, Profile},
   };

   const PHONE: BdAddr = BdAddr([0x40, 0, 0, 0, 0, 1]);

   fn spawn() -> (CoreHandle, JoinHandle<()>, Arc<EventLog>, Arc<RecordingStack>) {
      let events = Arc::new(EventLog::default());
      let stack = Arc::new(RecordingStack::default());
      let (handle, task) = CoreHandle::spawn(
         Config::default(),
         stack.clone(),
         events.clone(),
         Arc::new(MemoryStore::new()),
      )
      .unwrap();
      (handle, task, events, stack)
   }

   fn results(events: &EventLog) -> Vec<PowerOffResult> {
      events
         .take()
         .into_iter()
         .filter_map(|event| match event {
            AppEvent::PowerOff { result } => Some(result),
            _ => None,
         })
         .collect()
   }

   #[tokio::test]
   async fn test_link_events_round_trip() {
      let (handle, task, events, _) = spawn();
      let verdict = handle
         .link_event(LinkEvent::AclConnectRequest {
            addr: PHONE,
            inbound: true,
         })
         .await
         .unwrap();
      assert_eq!(verdict.code(), 0);
      assert_eq!(handle.le_adv_params(), AdvParams::general());

      handle
         .link_event(LinkEvent::AclConnected {
            addr: PHONE,
            handle: ConnHandle(0x10),
            phone_initiated: true,
            is_tws: Some(false),
         })
         .await
         .unwrap();
      handle
         .link_event(LinkEvent::ProfileConnected {
            handle: ConnHandle(0x10),
            profile: Profile::A2dp,
         })
         .await
         .unwrap();
      let snapshot = handle.snapshot().await.unwrap();
      assert_eq!(snapshot.phone_count, 1);
      assert_eq!(snapshot.devices.len(), 1);
      assert!(events.take().contains(&AppEvent::BtReady));

      handle.shutdown().await.unwrap();
      task.await.unwrap();
      assert!(handle.snapshot().await.is_err());
   }

   #[tokio::test(start_paused = true)]
   async fn test_power_off_times_out_on_tokio_timers() {
      let (handle, task, events, stack) = spawn();
      handle
         .link_event(LinkEvent::AclConnected {
            addr: PHONE,
            handle: ConnHandle(0x10),
            phone_initiated: true,
            is_tws: Some(false),
         })
         .await
         .unwrap();
      handle
         .link_event(LinkEvent::ProfileConnected {
            handle: ConnHandle(0x10),
            profile: Profile::A2dp,
         })
         .await
         .unwrap();

      handle.request_power_off(PowerOffRequest::local()).await.unwrap();
      assert_eq!(handle.power_off_state(), PowerOffState::Start);

      time::sleep(Duration::from_secs(1)).await;
      assert_eq!(handle.power_off_state(), PowerOffState::WaitDisconnectPhone);
      assert!(stack.take().contains(&crate::stack::StackCommand::DisconnectAllPhones));

      time::sleep(Duration::from_secs(3)).await;
      assert_eq!(handle.power_off_state(), PowerOffState::None);
      assert_eq!(results(&events), vec![PowerOffResult::Timeout]);

      handle.shutdown().await.unwrap();
      task.await.unwrap();
   }

   #[tokio::test(start_paused = true)]
   async fn test_local_request_is_queued_without_the_actor() {
      let (handle, task, events, _) = spawn();
      handle.request_power_off(PowerOffRequest::local()).await.unwrap();
      handle.request_power_off(PowerOffRequest::local()).await.unwrap();
      handle.request_power_off(PowerOffRequest::local()).await.unwrap();

      time::sleep(Duration::from_secs(1)).await;
      assert_eq!(results(&events), vec![PowerOffResult::Ok, PowerOffResult::Ok]);
      assert_eq!(handle.power_off_state(), PowerOffState::None);

      handle.shutdown().await.unwrap();
      task.await.unwrap();
   }
}
