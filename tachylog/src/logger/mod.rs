//! # Logger
//!
//! The frontend entry point. A [`Logger`] names a destination (its sinks) and
//! owns a level filter; logging through it encodes the call site's arguments
//! into the calling thread's queue and returns immediately.
//!
//! ## Hot path
//!
//! 1. level check (one relaxed atomic load)
//! 2. thread context lookup (thread-local, registered on first use)
//! 3. size computation through the codec
//! 4. reserve, write header and arguments, commit
//!
//! Nothing on this path formats, locks or returns an error: failures are a
//! `false` return and a per-thread counter the backend reports.
//!
//! ## Usage
//!
//! ```rust,ignore
//! static SITE: Metadata = Metadata::new("filled {} @ {}", file!(), line!(), module_path!(), LogLevel::Info);
//!
//! let logger = engine.create_or_get_logger("orders", vec![Arc::new(StdoutSink::text())]);
//! logger.log(&SITE, (&qty, &price));
//! logger.flush();
//! ```


use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::clock::{now_ns, rdtsc, ClockSource};
use crate::codec::{EncodeArgs, Encoder};
use crate::level::LogLevel;
use crate::options::FrontendOptions;
use crate::record::{EventKind, Metadata, RecordHeader, HEADER_SIZE};
use crate::registry;
use crate::sink::Sink;
use crate::thread_context::{with_local_context, ThreadContextManager};

thread_local! {
  static IS_BACKEND_THREAD: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// True on an engine's backend worker thread.
#[inline]
pub fn is_backend_thread() -> bool {
  IS_BACKEND_THREAD.try_with(|flag| flag.get()).unwrap_or(false)
}

pub(crate) fn mark_backend_thread() {
  let _ = IS_BACKEND_THREAD.try_with(|flag| flag.set(true));
}

/// Engine state every logger of that engine needs on the hot path.
pub(crate) struct Frontend {
  pub(crate) engine_id: u64,
  pub(crate) options: FrontendOptions,
  pub(crate) manager: Arc<ThreadContextManager>,
  pub(crate) backend_running: AtomicBool,
  wakeup: Sender<()>,
}

impl Frontend {
  pub(crate) fn new(options: FrontendOptions, wakeup: Sender<()>) -> Self {
    static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

    Self {
      engine_id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
      options,
      manager: Arc::new(ThreadContextManager::new()),
      backend_running: AtomicBool::new(false),
      wakeup,
    }
  }

  #[inline]
  pub(crate) fn is_backend_running(&self) -> bool {
    self.backend_running.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn notify_backend(&self) {
    // A pending wake-up is as good as a new one
    let _ = self.wakeup.try_send(());
  }
}

pub struct Logger {
  name: String,
  id: u32,
  sinks: Vec<Arc<dyn Sink>>,
  level: AtomicU8,
  clock_source: ClockSource,
  valid: AtomicBool,
  frontend: Arc<Frontend>,
}

impl std::fmt::Debug for Logger {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Logger")
      .field("name", &self.name)
      .field("id", &self.id)
      .field("sinks", &self.sinks.len())
      .field("level", &self.log_level())
      .field("clock_source", &self.clock_source)
      .field("valid", &self.is_valid())
      .finish()
  }
}

impl Logger {
  pub(crate) fn new(
    name: String,
    id: u32,
    sinks: Vec<Arc<dyn Sink>>,
    clock_source: ClockSource,
    frontend: Arc<Frontend>,
  ) -> Self {
    Self {
      name,
      id,
      sinks,
      level: AtomicU8::new(LogLevel::Info as u8),
      clock_source,
      valid: AtomicBool::new(true),
      frontend,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn id(&self) -> u32 {
    self.id
  }

  pub fn sinks(&self) -> &[Arc<dyn Sink>] {
    &self.sinks
  }

  pub fn clock_source(&self) -> ClockSource {
    self.clock_source
  }

  #[inline]
  pub fn log_level(&self) -> LogLevel {
    LogLevel::from_u8(self.level.load(Ordering::Relaxed)).unwrap_or(LogLevel::Info)
  }

  pub fn set_log_level(&self, level: LogLevel) {
    self.level.store(level as u8, Ordering::Relaxed);
  }

  /// Level filter. `None` and `Dynamic` are never loggable as such.
  #[inline]
  pub fn should_log(&self, level: LogLevel) -> bool {
    level >= self.log_level() && level != LogLevel::None && level != LogLevel::Dynamic
  }

  #[inline]
  pub fn is_valid(&self) -> bool {
    self.valid.load(Ordering::Acquire)
  }

  pub(crate) fn invalidate(&self) {
    self.valid.store(false, Ordering::Release);
  }

  /// Enqueues one log record. Returns `false` when it was filtered or dropped.
  #[inline]
  pub fn log<A: EncodeArgs>(&self, metadata: &'static Metadata, args: A) -> bool {
    if metadata.level != LogLevel::Dynamic && !self.should_log(metadata.level) {
      return false;
    }
    self.write_log(metadata, metadata.level, None, &args)
  }

  /// Like [`Logger::log`] for a `Dynamic` call site, with the level chosen now.
  #[inline]
  pub fn log_dynamic<A: EncodeArgs>(&self, level: LogLevel, metadata: &'static Metadata, args: A) -> bool {
    if !self.should_log(level) {
      return false;
    }
    self.write_log(metadata, level, None, &args)
  }

  /// Like [`Logger::log`] with a caller-provided timestamp, for `User` clock loggers.
  #[inline]
  pub fn log_at<A: EncodeArgs>(&self, timestamp: u64, metadata: &'static Metadata, args: A) -> bool {
    if metadata.level != LogLevel::Dynamic && !self.should_log(metadata.level) {
      return false;
    }
    self.write_log(metadata, metadata.level, Some(timestamp), &args)
  }

  #[inline]
  fn write_log<A: EncodeArgs>(
    &self,
    metadata: &'static Metadata,
    level: LogLevel,
    timestamp: Option<u64>,
    args: &A,
  ) -> bool {
    let dynamic = metadata.level == LogLevel::Dynamic;
    let size = args.encoded_size() + usize::from(dynamic);

    self.write_record(
      EventKind::Log,
      metadata.id(),
      registry::format_id::<A>(),
      timestamp,
      size,
      |encoder| {
        args.encode(encoder);
        if dynamic {
          encoder.put_u8(level as u8);
        }
      },
    )
  }

  /// Starts holding back `Backtrace` records in a ring of `capacity`, emitted
  /// when a record at or above `flush_level` is logged.
  pub fn init_backtrace(&self, capacity: u32, flush_level: LogLevel) -> bool {
    self.write_record(EventKind::InitBacktrace, 0, 0, None, 5, |encoder| {
      encoder.put_u32(capacity);
      encoder.put_u8(flush_level as u8);
    })
  }

  /// Emits the stored backtrace records now.
  pub fn flush_backtrace(&self) -> bool {
    self.write_record(EventKind::FlushBacktrace, 0, 0, None, 0, |_| {})
  }

  /// Blocks until every record this thread enqueued before the call has been
  /// written to the sinks and the sinks were flushed.
  ///
  /// Returns `false` without waiting when no backend is running, when called
  /// from the backend thread, or when the request could not be enqueued.
  pub fn flush(&self) -> bool {
    if !self.frontend.is_backend_running() || is_backend_thread() {
      return false;
    }

    let frontend = &self.frontend;
    let request = with_local_context(frontend.engine_id, &frontend.manager, &frontend.options, |local| {
      let sequence = local.next_flush_sequence();
      let context = Arc::clone(local.context());
      let written = self.write_with(local, EventKind::Flush, 0, 0, None, 8, |encoder| {
        encoder.put_u64(sequence);
      });
      written.then_some((sequence, context))
    })
    .flatten();

    let Some((sequence, context)) = request else {
      return false;
    };

    while context.flush_ack() < sequence {
      if !frontend.is_backend_running() {
        return context.flush_ack() >= sequence;
      }
      // The request may still be inside the grace period when the backend wakes
      frontend.notify_backend();
      std::thread::sleep(Duration::from_micros(100));
    }
    true
  }

  #[inline]
  fn timestamp(&self) -> u64 {
    match self.clock_source {
      ClockSource::Tsc => rdtsc(),
      ClockSource::System | ClockSource::User => now_ns(),
    }
  }

  #[inline]
  fn write_record(
    &self,
    kind: EventKind,
    metadata_ref: u32,
    format_ref: u32,
    timestamp: Option<u64>,
    payload_size: usize,
    encode: impl FnOnce(&mut Encoder<'_>),
  ) -> bool {
    let frontend = &self.frontend;
    with_local_context(frontend.engine_id, &frontend.manager, &frontend.options, |local| {
      self.write_with(local, kind, metadata_ref, format_ref, timestamp, payload_size, encode)
    })
    .unwrap_or(false)
  }

  #[allow(clippy::too_many_arguments)]
  #[inline]
  fn write_with(
    &self,
    local: &mut crate::thread_context::LocalContext,
    kind: EventKind,
    metadata_ref: u32,
    format_ref: u32,
    timestamp: Option<u64>,
    payload_size: usize,
    encode: impl FnOnce(&mut Encoder<'_>),
  ) -> bool {
    // Taken after the context lookup so a first-use registration does not
    // push the timestamp ahead of the record's queue position
    let header = RecordHeader {
      timestamp: timestamp.unwrap_or_else(|| self.timestamp()),
      kind,
      metadata_ref,
      logger_ref: self.id,
      format_ref,
    };

    local.write(HEADER_SIZE + payload_size, &self.frontend.options, |buf| {
      let mut encoder = Encoder::new(buf);
      header.encode(&mut encoder);
      encode(&mut encoder);
      encoder.is_exact()
    })
  }
}

/// Loggers of one engine, in creation order.
pub struct LoggerRegistry {
  loggers: RwLock<Vec<Arc<Logger>>>,
  next_id: AtomicU32,
  version: AtomicU64,
}

impl Default for LoggerRegistry {
  fn default() -> Self {
    Self {
      loggers: RwLock::new(Vec::new()),
      next_id: AtomicU32::new(1),
      version: AtomicU64::new(0),
    }
  }
}

impl LoggerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the valid logger called `name`, or creates it with `build(id)`.
  pub(crate) fn create_or_get(&self, name: &str, build: impl FnOnce(u32) -> Logger) -> Arc<Logger> {
    let mut loggers = self.loggers.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(logger) = loggers.iter().find(|l| l.is_valid() && l.name == name) {
      return Arc::clone(logger);
    }

    let logger = Arc::new(build(self.next_id.fetch_add(1, Ordering::Relaxed)));
    loggers.push(Arc::clone(&logger));
    self.version.fetch_add(1, Ordering::Release);
    logger
  }

  pub fn get(&self, name: &str) -> Option<Arc<Logger>> {
    self
      .loggers
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .find(|l| l.is_valid() && l.name == name)
      .cloned()
  }

  /// Every registered logger, including invalidated ones not yet removed.
  pub fn snapshot(&self) -> Vec<Arc<Logger>> {
    self.loggers.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  /// Changes whenever a logger is added or removed.
  #[inline]
  pub fn version(&self) -> u64 {
    self.version.load(Ordering::Acquire)
  }

  /// Removes and returns every invalidated logger.
  pub(crate) fn remove_invalid(&self) -> Vec<Arc<Logger>> {
    let mut loggers = self.loggers.write().unwrap_or_else(PoisonError::into_inner);
    let (removed, kept): (Vec<_>, Vec<_>) = loggers.drain(..).partition(|l| !l.is_valid());
    *loggers = kept;
    if !removed.is_empty() {
      self.version.fetch_add(1, Ordering::Release);
    }
    removed
  }

  pub fn len(&self) -> usize {
    self.loggers.read().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
