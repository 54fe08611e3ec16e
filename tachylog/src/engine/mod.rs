//! # Engine
//!
//! Ties the pieces together: the frontend options every thread queue is created
//! with, the loggers, and the backend thread draining the queues.
//!
//! An engine is cheap to clone; clones share everything. The backend is stopped
//! when the last clone is dropped.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let engine = Engine::new(FrontendOptions::default())?;
//! engine.start_backend(BackendOptions::default())?;
//!
//! let logger = engine.create_or_get_logger("app", vec![Arc::new(StdoutSink::text())]);
//! tachylog::info!(logger, "listening on port {}", port);
//!
//! engine.stop_backend();
//! ```

mod __test__;

use crossbeam_channel::Receiver;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;

use crate::backend::{BackendWorker, ThreadQueue};
use crate::clock::ClockSource;
use crate::error::{Error, Result};
use crate::logger::{is_backend_thread, Frontend, Logger, LoggerRegistry};
use crate::options::{BackendOptions, FrontendOptions};
use crate::sink::Sink;
use crate::thread_context::{release_local_context, with_local_context};

#[derive(Default)]
struct BackendSlot {
  handle: Option<JoinHandle<Vec<ThreadQueue>>>,
  /// Thread queues kept between a stop and the next start.
  parked: Vec<ThreadQueue>,
}

struct EngineShared {
  frontend: Arc<Frontend>,
  loggers: Arc<LoggerRegistry>,
  wakeup: Receiver<()>,
  backend: Mutex<BackendSlot>,
}

impl Drop for EngineShared {
  fn drop(&mut self) {
    let slot = self.backend.get_mut().unwrap_or_else(PoisonError::into_inner);
    stop(&self.frontend, slot);
  }
}

#[derive(Clone)]
pub struct Engine {
  shared: Arc<EngineShared>,
}

impl std::fmt::Debug for Engine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Engine")
      .field("id", &self.shared.frontend.engine_id)
      .field("loggers", &self.shared.loggers.len())
      .field("backend_running", &self.is_backend_running())
      .finish()
  }
}

impl Engine {
  /// Creates an engine after validating `options`.
  pub fn new(options: FrontendOptions) -> Result<Self> {
    options.validate()?;
    Ok(Self::build(options))
  }

  fn build(options: FrontendOptions) -> Self {
    let (wakeup_tx, wakeup_rx) = crossbeam_channel::bounded(1);
    Self {
      shared: Arc::new(EngineShared {
        frontend: Arc::new(Frontend::new(options, wakeup_tx)),
        loggers: Arc::new(LoggerRegistry::new()),
        wakeup: wakeup_rx,
        backend: Mutex::new(BackendSlot::default()),
      }),
    }
  }

  /// Process-wide engine with default frontend options.
  pub fn global() -> &'static Engine {
    static GLOBAL: OnceLock<Engine> = OnceLock::new();
    GLOBAL.get_or_init(|| Self::build(FrontendOptions::default()))
  }

  pub fn id(&self) -> u64 {
    self.shared.frontend.engine_id
  }

  pub fn frontend_options(&self) -> &FrontendOptions {
    &self.shared.frontend.options
  }

  /// Returns the logger called `name`, creating it with `sinks` and the cycle
  /// counter clock when it does not exist. An existing logger keeps its sinks.
  pub fn create_or_get_logger(&self, name: &str, sinks: Vec<Arc<dyn Sink>>) -> Arc<Logger> {
    self.create_or_get_logger_with_clock(name, sinks, ClockSource::Tsc)
  }

  pub fn create_or_get_logger_with_clock(
    &self,
    name: &str,
    sinks: Vec<Arc<dyn Sink>>,
    clock_source: ClockSource,
  ) -> Arc<Logger> {
    let frontend = &self.shared.frontend;
    let logger = self.shared.loggers.create_or_get(name, |id| {
      Logger::new(name.to_string(), id, sinks, clock_source, Arc::clone(frontend))
    });
    frontend.notify_backend();
    logger
  }

  pub fn get_logger(&self, name: &str) -> Option<Arc<Logger>> {
    self.shared.loggers.get(name)
  }

  pub fn loggers(&self) -> Vec<Arc<Logger>> {
    self
      .shared
      .loggers
      .snapshot()
      .into_iter()
      .filter(|l| l.is_valid())
      .collect()
  }

  /// Invalidates `logger`. Its records still in flight are delivered; the
  /// backend drops it once every queue is empty.
  pub fn remove_logger(&self, logger: &Logger) {
    logger.invalidate();
    self.notify_backend();
  }

  /// Creates the calling thread's queue now instead of on its first log call.
  pub fn preallocate(&self) -> bool {
    let frontend = &self.shared.frontend;
    with_local_context(frontend.engine_id, &frontend.manager, &frontend.options, |_| ()).is_some()
  }

  /// Drops the calling thread's queue. The backend removes it once drained.
  pub fn release_thread(&self) {
    release_local_context(self.shared.frontend.engine_id);
  }

  /// Validates `options` and spawns the backend thread.
  pub fn start_backend(&self, mut options: BackendOptions) -> Result<()> {
    options.validate()?;

    let mut slot = self.shared.backend.lock().unwrap_or_else(PoisonError::into_inner);
    // Reap a backend that died on its own
    if slot.handle.as_ref().is_some_and(|handle| handle.is_finished()) {
      stop(&self.shared.frontend, &mut slot);
    }
    if slot.handle.is_some() {
      return Err(Error::config("the backend is already running"));
    }

    let frontend = Arc::clone(&self.shared.frontend);
    let thread_name = options.thread_name.clone();
    let worker = BackendWorker::new(
      options,
      Arc::clone(&frontend),
      Arc::clone(&self.shared.loggers),
      self.shared.wakeup.clone(),
      std::mem::take(&mut slot.parked),
    );

    frontend.backend_running.store(true, Ordering::Release);
    let spawned = std::thread::Builder::new()
      .name(thread_name.clone())
      .spawn(move || worker.run());

    match spawned {
      Ok(handle) => {
        tracing::debug!(target: "tachylog", engine = frontend.engine_id, thread = %thread_name, "backend spawned");
        slot.handle = Some(handle);
        Ok(())
      },
      Err(err) => {
        frontend.backend_running.store(false, Ordering::Release);
        Err(Error::config(format!("cannot spawn the backend thread: {}", err)))
      },
    }
  }

  /// Signals the backend to drain and exit, then joins it. No-op when stopped.
  pub fn stop_backend(&self) {
    let mut slot = self.shared.backend.lock().unwrap_or_else(PoisonError::into_inner);
    stop(&self.shared.frontend, &mut slot);
  }

  pub fn is_backend_running(&self) -> bool {
    self.shared.frontend.is_backend_running()
  }

  /// Wakes a sleeping backend before its sleep duration elapses.
  pub fn notify_backend(&self) {
    self.shared.frontend.notify_backend();
  }
}

fn stop(frontend: &Frontend, slot: &mut BackendSlot) {
  // Joining from the backend thread itself would never return
  if is_backend_thread() {
    return;
  }
  let Some(handle) = slot.handle.take() else {
    return;
  };

  frontend.backend_running.store(false, Ordering::Release);
  frontend.notify_backend();

  match handle.join() {
    Ok(threads) => slot.parked = threads,
    Err(_) => tracing::warn!(target: "tachylog", engine = frontend.engine_id, "backend thread panicked"),
  }
}
