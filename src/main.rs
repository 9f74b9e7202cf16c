//! budlink session daemon
//!
//! Drives the session core from a JSON-lines trace of stack callbacks and
//! control requests. By default the trace is played in real time against
//! the tokio actor with a logging stack; `--virtual` replays it instantly
//! on a virtual clock. Either way verdicts, events and stack commands are
//! written to stdout as JSON lines.

use std::{env, fs, path::PathBuf, sync::Arc, time::Duration};

use budlink::{
   config::Config,
   error::{CoreError, Result},
   event::{AppEvent, EventBus},
   runtime::CoreHandle,
   sim::{Simulation, TraceEntry, parse_trace},
   stack::LoggingStack,
   store::{HeedStore, StoreHandle},
};
use crossbeam::queue::SegQueue;
use log::{info, warn};
use serde_json::json;
use tokio::{signal, sync::Notify, task::JoinHandle, time};

struct Args {
   virtual_time: bool,
   trace: PathBuf,
}

impl Args {
   fn parse() -> Option<Self> {
      let mut virtual_time = false;
      let mut trace = None;
      for arg in env::args().skip(1) {
         match arg.as_str() {
            "--virtual" => virtual_time = true,
            _ if trace.is_none() => trace = Some(PathBuf::from(arg)),
            _ => return None,
         }
      }
      Some(Self {
         virtual_time,
         trace: trace?,
      })
   }
}

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let Some(args) = Args::parse() else {
      eprintln!("usage: budlinkd [--virtual] <trace.jsonl>");
      std::process::exit(2);
   };

   let config = Config::load()?;
   info!(
      "Loaded configuration ({} phone(s), wait window {}s)",
      config.phone_limit(),
      config.wait_connect_secs
   );

   let entries = parse_trace(&fs::read_to_string(&args.trace)?)?;
   info!("Loaded {} trace entries from {}", entries.len(), args.trace.display());

   let store_path = match config.store_path.clone() {
      Some(path) => path,
      None => HeedStore::default_path()?,
   };
   let store: StoreHandle = Arc::new(HeedStore::open(store_path)?);

   if args.virtual_time {
      replay_virtual(config, store, &entries)
   } else {
      replay_realtime(config, store, &entries).await
   }
}

fn replay_virtual(config: Config, store: StoreHandle, entries: &[TraceEntry]) -> Result<()> {
   let mut sim = Simulation::with_store(config, store)?;
   flush(&sim);
   for entry in entries {
      sim.advance_to(Duration::from_millis(entry.at_ms));
      let verdict = sim.feed(entry.input.clone());
      println!("{}", json!({ "at_ms": entry.at_ms, "verdict": verdict }));
      flush(&sim);
   }
   println!("{}", serde_json::to_string(&sim.core.snapshot())?);
   Ok(())
}

fn flush(sim: &Simulation) {
   for event in sim.events.take() {
      print_json(&event);
   }
   for cmd in sim.stack.take() {
      print_json(&cmd);
   }
}

fn print_json(value: &impl serde::Serialize) {
   match serde_json::to_string(value) {
      Ok(line) => println!("{line}"),
      Err(e) => warn!("Failed to encode output: {e}"),
   }
}

async fn replay_realtime(config: Config, store: StoreHandle, entries: &[TraceEntry]) -> Result<()> {
   let event_bus = EventProcessor::new();
   let dispatcher = event_bus.clone().spawn_dispatcher();
   let (core, task) = CoreHandle::spawn(config, Arc::new(LoggingStack), event_bus.clone(), store)?;
   info!("Session core started");

   let start = time::Instant::now();
   let replay = async {
      for entry in entries {
         time::sleep_until(start + Duration::from_millis(entry.at_ms)).await;
         match core.send(entry.input.clone()).await {
            Ok(verdict) => println!("{}", json!({ "at_ms": entry.at_ms, "verdict": verdict })),
            Err(e) => {
               warn!("Core rejected trace entry at {} ms: {e}", entry.at_ms);
               return Err(e);
            },
         }
      }
      Ok(())
   };

   tokio::select! {
      result = replay => {
         result?;
         info!("Trace finished");
      }
      result = signal::ctrl_c() => {
         result?;
         info!("Interrupted");
      }
   }

   let snapshot = core.snapshot().await?;
   print_json(&snapshot);
   core.shutdown().await?;
   if let Err(e) = task.await {
      warn!("Core task ended abnormally: {e}");
   }

   drop(core);
   drop(event_bus);
   dispatcher.await.map_err(|_| CoreError::CoreShutdown)?;
   info!("Shutting down budlink...");
   Ok(())
}

struct EventProcessor {
   queue: SegQueue<AppEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<AppEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn spawn_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            print_json(&event);
         }
      })
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: AppEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
