//! # Backend
//!
//! The single consumer of every frontend queue of an engine.
//!
//! ## Poll cycle
//!
//! ```text
//!            +---------+   records read   +----------+
//!   +------> |  Idle   | ---------------> | Draining |
//!   |        +---------+                  +----------+
//!   |             ^                             |
//!   |             | nothing cached              v
//!   |        +-------------+             +----------+
//!   +------- | Dispatching | <---------- | Ordering |
//!            +-------------+             +----------+
//! ```
//!
//! - **Draining** decodes records from every thread queue into that thread's
//!   transit buffer, formatting the message on the way. Records stamped later
//!   than `now - grace period` stay in the queue for the next poll.
//! - **Ordering** picks the cached event with the smallest timestamp across
//!   threads; ties go to the thread that registered first.
//! - **Dispatching** hands the event to the logger's sinks, or runs the
//!   flush or backtrace command it carries.
//! - **Idle** runs the housekeeping: sink flushes, failure reports, clock
//!   resync, removal of finished threads and loggers, then sleeps.
//!
//! Below `transit_events_soft_limit` cached events one event is dispatched per
//! poll so new records are merged into the order as early as possible; above it
//! everything cached is dispatched in one batch.

mod __test__;

use crossbeam_channel::Receiver;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::backtrace::BacktraceStorage;
use crate::clock::{now_ns, ClockSource, RdtscClock};
use crate::codec::{ArgList, Decoder};
use crate::error::{Error, Result};
use crate::level::LogLevel;
use crate::logger::{mark_backend_thread, Frontend, Logger, LoggerRegistry};
use crate::message_format::FormatTemplate;
use crate::options::BackendOptions;
use crate::record::{EventKind, Metadata, RecordHeader};
use crate::registry::{FnvBuildHasher, FormatCache, MetadataCache};
use crate::sink::LogRecord;
use crate::thread_context::{QueueConsumer, ThreadContext};
use crate::transit::{TransitEvent, TransitEventBuffer};
use crate::utils::process_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
  Idle,
  Draining,
  Ordering,
  Dispatching,
}

/// Consumer side of one frontend thread.
pub(crate) struct ThreadQueue {
  context: Arc<ThreadContext>,
  consumer: QueueConsumer,
  transit: TransitEventBuffer,
}

impl ThreadQueue {
  fn is_finished(&self) -> bool {
    !self.context.is_valid() && self.consumer.is_empty() && self.transit.is_empty()
  }
}

/// Backend view of the logger registry, sorted by id.
struct LoggerCache {
  registry: Arc<LoggerRegistry>,
  version: Option<u64>,
  loggers: Vec<Arc<Logger>>,
  started_up_to: u32,
}

impl LoggerCache {
  fn new(registry: Arc<LoggerRegistry>) -> Self {
    Self {
      registry,
      version: None,
      loggers: Vec::new(),
      started_up_to: 0,
    }
  }

  fn refresh(&mut self) {
    let version = self.registry.version();
    if self.version == Some(version) {
      return;
    }

    self.loggers = self.registry.snapshot();
    self.loggers.sort_by_key(|l| l.id());
    self.version = Some(version);

    for logger in &self.loggers {
      if logger.id() > self.started_up_to {
        for sink in logger.sinks() {
          let _ = catch_unwind(AssertUnwindSafe(|| sink.on_start()));
        }
      }
    }
    if let Some(last) = self.loggers.last() {
      self.started_up_to = self.started_up_to.max(last.id());
    }
  }

  #[inline]
  fn get(&self, id: u32) -> Option<&Arc<Logger>> {
    self
      .loggers
      .binary_search_by_key(&id, |l| l.id())
      .ok()
      .map(|index| &self.loggers[index])
  }

  /// Like `get`, refreshing once when the id is not known yet.
  #[inline]
  fn lookup(&mut self, id: u32) -> Option<&Arc<Logger>> {
    if self.get(id).is_none() {
      self.refresh();
    }
    self.get(id)
  }
}

/// Turns queue bytes into transit events.
struct RecordDecoder {
  metadata: MetadataCache,
  formats: FormatCache,
  /// Parsed template per metadata id, or the parse error text.
  templates: Vec<Option<std::result::Result<FormatTemplate, String>>>,
  loggers: LoggerCache,
  rdtsc: Option<RdtscClock>,
  options: BackendOptions,
}

impl RecordDecoder {
  #[inline]
  fn timestamp_ns(&mut self, clock_source: ClockSource, raw: u64) -> u64 {
    match clock_source {
      ClockSource::Tsc => {
        let interval = self.options.rdtsc_resync_interval;
        self
          .rdtsc
          .get_or_insert_with(|| RdtscClock::new(interval))
          .time_since_epoch(raw)
      },
      ClockSource::System | ClockSource::User => raw,
    }
  }

  /// Reads as many records of `thread` as the cutoff and `limit` allow.
  /// Returns the number of events cached.
  fn read_queue(&mut self, thread: &mut ThreadQueue, cutoff: Option<u64>, limit: usize) -> usize {
    let Some(window) = thread.consumer.try_read() else {
      return 0;
    };

    let mut offset = 0;
    let mut cached = 0;
    let mut failure = None;

    while offset < window.len() && thread.transit.len() < limit {
      let mut decoder = Decoder::new(&window[offset..]);
      let header = match RecordHeader::decode(&mut decoder) {
        Ok(header) => header,
        Err(err) => {
          failure = Some(err);
          break;
        },
      };

      let clock_source = self
        .loggers
        .lookup(header.logger_ref)
        .map_or(ClockSource::System, |l| l.clock_source());
      let timestamp = self.timestamp_ns(clock_source, header.timestamp);

      if clock_source != ClockSource::User && cutoff.is_some_and(|cutoff| timestamp > cutoff) {
        break;
      }

      let event = thread.transit.back_mut();
      event.timestamp = timestamp;
      event.kind = header.kind;
      event.logger_id = header.logger_ref;
      event.thread_id = thread.context.thread_id();
      let thread_name = thread.context.shared_thread_name();
      if !Arc::ptr_eq(&event.thread_name, thread_name) {
        event.thread_name = Arc::clone(thread_name);
      }

      if let Err(err) = self.decode_payload(&header, &mut decoder, event) {
        failure = Some(err);
        break;
      }

      offset += decoder.position();
      thread.transit.push_back();
      cached += 1;
    }

    if let Some(err) = failure {
      // Record boundaries past a bad record are unknown
      self.options.notify(&format!(
        "Discarding {} unreadable bytes from thread {}: {}",
        window.len() - offset,
        thread.context.thread_id(),
        err
      ));
      offset = window.len();
    }

    thread.consumer.release(offset);
    cached
  }

  fn decode_payload(&mut self, header: &RecordHeader, decoder: &mut Decoder<'_>, event: &mut TransitEvent) -> Result<()> {
    match header.kind {
      EventKind::Log => self.decode_log(header, decoder, event),
      EventKind::InitBacktrace => {
        event.backtrace_capacity = decoder.u32()?;
        event.backtrace_flush_level = decode_level(decoder)?;
        Ok(())
      },
      EventKind::FlushBacktrace => Ok(()),
      EventKind::Flush => {
        event.flush_sequence = decoder.u64()?;
        Ok(())
      },
    }
  }

  fn decode_log(&mut self, header: &RecordHeader, decoder: &mut Decoder<'_>, event: &mut TransitEvent) -> Result<()> {
    let metadata = self
      .metadata
      .get(header.metadata_ref)
      .ok_or_else(|| Error::decode(format!("unknown call site {}", header.metadata_ref)))?;
    let decode_args = self
      .formats
      .get(header.format_ref)
      .ok_or_else(|| Error::decode(format!("unknown argument signature {}", header.format_ref)))?;

    // A panicking user decoder leaves the record boundary unknown
    let mut args = ArgList::new();
    catch_unwind(AssertUnwindSafe(|| decode_args(decoder, &mut args)))
      .unwrap_or_else(|payload| Err(Error::decode(panic_message(payload.as_ref()))))?;
    if metadata.level == LogLevel::Dynamic {
      event.dynamic_level = Some(decode_level(decoder)?);
    }
    event.metadata = Some(metadata);

    let printable = self.options.check_printable_char;
    let rendered = match self.template(metadata) {
      Ok(template) => catch_unwind(AssertUnwindSafe(|| {
        template
          .render(&args, &mut event.formatted_message, printable)
          .and_then(|()| {
            if template.has_named_args() {
              template.named_args(&args, &mut event.named_args, printable)
            } else {
              Ok(())
            }
          })
          .map_err(|err| err.to_string())
      }))
      .unwrap_or_else(|payload| Err(panic_message(payload.as_ref()))),
      Err(err) => Err(err.clone()),
    };

    if let Err(err) = rendered {
      event.formatted_message.clear();
      event.named_args.clear();
      event.formatted_message.push_str(&format!(
        "[Could not format log statement. message: \"{}\", location: \"{}\", error: \"{}\"]",
        metadata.format,
        metadata.location(),
        err
      ));
      self.options.notify(&event.formatted_message);
    }
    Ok(())
  }

  fn template(&mut self, metadata: &'static Metadata) -> &std::result::Result<FormatTemplate, String> {
    let index = metadata.id() as usize;
    if index >= self.templates.len() {
      self.templates.resize_with(index + 1, || None);
    }
    self.templates[index].get_or_insert_with(|| FormatTemplate::parse(metadata.format).map_err(|e| e.to_string()))
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  let reason = payload
    .downcast_ref::<&str>()
    .copied()
    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
    .unwrap_or("unknown panic");
  format!("an argument panicked while formatting: {}", reason)
}

fn decode_level(decoder: &mut Decoder<'_>) -> Result<LogLevel> {
  let raw = decoder.u8()?;
  LogLevel::from_u8(raw).ok_or_else(|| Error::decode(format!("invalid level byte {}", raw)))
}

/// Hands transit events to sinks and runs the commands they carry.
struct Dispatcher {
  backtraces: HashMap<u32, BacktraceStorage, FnvBuildHasher>,
  process_id: u32,
}

impl Dispatcher {
  fn dispatch(&mut self, decoder: &RecordDecoder, context: &ThreadContext, event: &TransitEvent) {
    match event.kind {
      EventKind::Log => {
        let Some(logger) = decoder.loggers.get(event.logger_id) else {
          return;
        };
        let level = event.level();

        if level == LogLevel::Backtrace {
          if let Some(storage) = self.backtraces.get_mut(&event.logger_id) {
            storage.store(event);
          }
          return;
        }

        write_record(&decoder.options, self.process_id, logger, event);

        if let Some(storage) = self.backtraces.get_mut(&event.logger_id) {
          if storage.should_flush(level) {
            let process_id = self.process_id;
            storage.process(|stored| write_record(&decoder.options, process_id, logger, stored));
          }
        }
      },
      EventKind::InitBacktrace => {
        self
          .backtraces
          .entry(event.logger_id)
          .or_insert_with(|| BacktraceStorage::new(0, LogLevel::None))
          .configure(event.backtrace_capacity as usize, event.backtrace_flush_level);
      },
      EventKind::FlushBacktrace => {
        let (Some(logger), Some(storage)) = (
          decoder.loggers.get(event.logger_id),
          self.backtraces.get_mut(&event.logger_id),
        ) else {
          return;
        };
        let process_id = self.process_id;
        storage.process(|stored| write_record(&decoder.options, process_id, logger, stored));
      },
      EventKind::Flush => {
        flush_sinks(&decoder.options, &decoder.loggers.loggers);
        context.acknowledge_flush(event.flush_sequence);
      },
    }
  }
}

fn write_record(options: &BackendOptions, process_id: u32, logger: &Logger, event: &TransitEvent) {
  let Some(metadata) = event.metadata else {
    return;
  };
  let level = event.level();

  let record = LogRecord {
    metadata,
    timestamp: event.timestamp,
    thread_id: event.thread_id,
    thread_name: &event.thread_name,
    process_id,
    logger_name: logger.name(),
    level,
    level_description: &options.log_level_descriptions[level.as_index()],
    level_short_code: &options.log_level_short_codes[level.as_index()],
    named_args: &event.named_args,
    message: &event.formatted_message,
  };

  for sink in logger.sinks() {
    if !sink.enabled(level) {
      continue;
    }
    if catch_unwind(AssertUnwindSafe(|| sink.write_log(&record))).is_err() {
      options.notify(&format!(
        "A sink of logger \"{}\" panicked while writing a record from {}",
        logger.name(),
        metadata.location()
      ));
    }
  }
}

fn flush_sinks(options: &BackendOptions, loggers: &[Arc<Logger>]) {
  for logger in loggers {
    for sink in logger.sinks() {
      if catch_unwind(AssertUnwindSafe(|| sink.flush())).is_err() {
        options.notify(&format!("A sink of logger \"{}\" panicked while flushing", logger.name()));
      }
    }
  }
}

/// Clears the running flag if the worker unwinds, so `Logger::flush` callers
/// stop waiting on a dead backend.
pub(crate) struct RunningGuard(pub(crate) Arc<Frontend>);

impl Drop for RunningGuard {
  fn drop(&mut self) {
    if std::thread::panicking() {
      self.0.backend_running.store(false, Ordering::Release);
      tracing::warn!(target: "tachylog", engine = self.0.engine_id, "backend worker panicked");
    }
  }
}

/// The backend worker. Owns every consumer end and every transit event.
pub(crate) struct BackendWorker {
  frontend: Arc<Frontend>,
  wakeup: Receiver<()>,
  state: BackendState,
  threads: Vec<ThreadQueue>,
  decoder: RecordDecoder,
  dispatcher: Dispatcher,
  last_sink_flush: Instant,
}

impl BackendWorker {
  pub(crate) fn new(
    options: BackendOptions,
    frontend: Arc<Frontend>,
    registry: Arc<LoggerRegistry>,
    wakeup: Receiver<()>,
    threads: Vec<ThreadQueue>,
  ) -> Self {
    Self {
      frontend,
      wakeup,
      state: BackendState::Idle,
      threads,
      decoder: RecordDecoder {
        metadata: MetadataCache::new(),
        formats: FormatCache::new(),
        templates: Vec::new(),
        loggers: LoggerCache::new(registry),
        rdtsc: None,
        options,
      },
      dispatcher: Dispatcher {
        backtraces: HashMap::default(),
        process_id: process_id(),
      },
      last_sink_flush: Instant::now(),
    }
  }

  #[cfg(test)]
  pub fn state(&self) -> BackendState {
    self.state
  }

  /// Number of frontend threads currently known to the backend.
  #[cfg(test)]
  pub fn thread_count(&self) -> usize {
    self.threads.len()
  }

  /// Runs until the engine clears its running flag, then drains and hands the
  /// thread queues back for a later restart.
  pub(crate) fn run(mut self) -> Vec<ThreadQueue> {
    mark_backend_thread();
    let _running = RunningGuard(Arc::clone(&self.frontend));

    if let Some(cpu) = self.decoder.options.cpu_affinity {
      if let Err(err) = set_cpu_affinity(cpu) {
        self.decoder.options.notify(&format!(
          "Failed to set cpu affinity {} for the backend thread, continuing unpinned: {}",
          cpu, err
        ));
      }
    }

    tracing::debug!(target: "tachylog", thread = %self.decoder.options.thread_name, "backend worker started");
    self.decoder.loggers.refresh();

    while self.frontend.is_backend_running() {
      if !self.poll() {
        self.sleep();
      }
    }

    self.drain_on_exit();
    tracing::debug!(target: "tachylog", thread = %self.decoder.options.thread_name, "backend worker stopped");
    self.threads
  }

  /// One poll cycle at the current wall-clock time. Returns `false` when the
  /// backend had nothing to do and ran its idle tasks.
  pub fn poll(&mut self) -> bool {
    self.poll_at(now_ns())
  }

  /// One poll cycle using `now` (nanoseconds since epoch) for the grace cutoff.
  pub fn poll_at(&mut self, now: u64) -> bool {
    let grace = self.decoder.options.log_timestamp_ordering_grace_period.as_nanos() as u64;
    let cutoff = (grace > 0).then(|| now.saturating_sub(grace));

    let cached = self.populate(cutoff);
    if cached == 0 {
      self.idle_tasks();
      self.state = BackendState::Idle;
      return false;
    }

    self.state = BackendState::Ordering;
    if cached < self.decoder.options.transit_events_soft_limit {
      self.process_next();
    } else {
      while self.process_next() {}
    }
    self.state = BackendState::Idle;
    true
  }

  /// Registers new threads and reads every queue. Returns the total number of
  /// cached events.
  fn populate(&mut self, cutoff: Option<u64>) -> usize {
    self.state = BackendState::Draining;

    while let Some(registration) = self.frontend.manager.take_pending() {
      self.threads.push(ThreadQueue {
        context: registration.context,
        consumer: registration.consumer,
        transit: TransitEventBuffer::new(self.decoder.options.transit_event_buffer_initial_capacity),
      });
    }
    self.decoder.loggers.refresh();

    let limit = self.decoder.options.transit_events_hard_limit;
    let mut cached = 0;
    for thread in &mut self.threads {
      if thread.transit.len() < limit {
        self.decoder.read_queue(thread, cutoff, limit);
      }
      thread.consumer.commit_read();
      cached += thread.transit.len();
    }
    cached
  }

  /// Thread whose cached front event has the smallest timestamp.
  fn next_thread(&self) -> Option<usize> {
    let mut next: Option<(usize, u64)> = None;
    for (index, thread) in self.threads.iter().enumerate() {
      if let Some(event) = thread.transit.front() {
        if next.map_or(true, |(_, timestamp)| event.timestamp < timestamp) {
          next = Some((index, event.timestamp));
        }
      }
    }
    next.map(|(index, _)| index)
  }

  /// Dispatches the cached event with the smallest timestamp.
  ///
  /// Before a flush is acknowledged every queue is read without the grace
  /// cutoff, so records stamped before the flush on any thread go out first.
  fn process_next(&mut self) -> bool {
    let Some(mut index) = self.next_thread() else {
      return false;
    };

    let is_flush = self.threads[index]
      .transit
      .front()
      .is_some_and(|event| event.kind == EventKind::Flush);
    if is_flush {
      self.populate(None);
      match self.next_thread() {
        Some(next) => index = next,
        None => return false,
      }
    }

    self.state = BackendState::Dispatching;
    let thread = &mut self.threads[index];
    if let Some(event) = thread.transit.front() {
      self.dispatcher.dispatch(&self.decoder, &thread.context, event);
    }
    thread.transit.pop_front();
    true
  }

  fn idle_tasks(&mut self) {
    let options = &self.decoder.options;

    if self.last_sink_flush.elapsed() >= options.sink_min_flush_interval {
      flush_sinks(options, &self.decoder.loggers.loggers);
      self.last_sink_flush = Instant::now();
    }
    for logger in &self.decoder.loggers.loggers {
      for sink in logger.sinks() {
        if catch_unwind(AssertUnwindSafe(|| sink.run_periodic_tasks())).is_err() {
          options.notify(&format!("A sink of logger \"{}\" panicked in its periodic tasks", logger.name()));
        }
      }
    }

    self.report_failures();

    if let Some(rdtsc) = self.decoder.rdtsc.as_mut() {
      rdtsc.resync(RdtscClock::RESYNC_LAG);
    }

    self.threads.retain(|thread| !thread.is_finished());
    self.remove_loggers();

    for thread in &mut self.threads {
      thread.transit.shrink();
    }
  }

  fn report_failures(&mut self) {
    let options = &self.decoder.options;
    for thread in &mut self.threads {
      let failures = thread.context.take_failures();
      if failures > 0 {
        let message = if thread.context.queue_type().is_dropping() {
          format!("Dropped {} log messages from thread {}", failures, thread.context.thread_id())
        } else {
          format!(
            "Experienced {} blocking occurrences on thread {}",
            failures,
            thread.context.thread_id()
          )
        };
        options.notify(&message);
      }

      if let Some(switch) = thread.consumer.take_switch() {
        options.notify(&format!(
          "Allocated a new SPSC queue with a capacity of {} KiB (previously {} KiB) from thread {}",
          switch.new_capacity / 1024,
          switch.previous_capacity / 1024,
          thread.context.thread_id()
        ));
      }
    }
  }

  /// Drops invalidated loggers once no queue can still hold their records.
  fn remove_loggers(&mut self) {
    if !self.decoder.loggers.loggers.iter().any(|l| !l.is_valid()) {
      return;
    }
    let all_empty = self
      .threads
      .iter()
      .all(|t| t.consumer.is_empty() && t.transit.is_empty());
    if !all_empty || self.frontend.manager.has_pending() {
      return;
    }

    let removed = self.decoder.loggers.registry.remove_invalid();
    flush_sinks(&self.decoder.options, &removed);
    for logger in &removed {
      self.dispatcher.backtraces.remove(&logger.id());
      tracing::debug!(target: "tachylog", logger = logger.name(), "logger removed");
    }
    self.decoder.loggers.refresh();
  }

  fn sleep(&self) {
    let options = &self.decoder.options;
    if options.enable_yield_when_idle {
      std::thread::yield_now();
    } else if !options.sleep_duration.is_zero() {
      // Woken early by `Engine::notify_backend`
      let _ = self.wakeup.recv_timeout(options.sleep_duration);
    }
  }

  fn is_drained(&self) -> bool {
    !self.frontend.manager.has_pending()
      && self
        .threads
        .iter()
        .all(|t| t.consumer.is_empty() && t.transit.is_empty())
  }

  fn drain_on_exit(&mut self) {
    loop {
      self.populate(None);
      self.state = BackendState::Ordering;
      while self.process_next() {}

      if !self.decoder.options.wait_for_queues_to_empty_before_exit || self.is_drained() {
        break;
      }
    }

    self.report_failures();
    flush_sinks(&self.decoder.options, &self.decoder.loggers.loggers);
    for logger in &self.decoder.loggers.loggers {
      for sink in logger.sinks() {
        let _ = catch_unwind(AssertUnwindSafe(|| sink.on_shutdown()));
      }
    }
    self.threads.retain(|thread| !thread.is_finished());
    self.state = BackendState::Idle;
  }
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(cpu: u16) -> std::io::Result<()> {
  let cpu = cpu as usize;
  if cpu >= libc::CPU_SETSIZE as usize {
    return Err(std::io::Error::new(
      std::io::ErrorKind::InvalidInput,
      format!("cpu {} is out of range", cpu),
    ));
  }

  // SAFETY: cpu_set_t is plain data and the index was checked above
  unsafe {
    let mut set: libc::cpu_set_t = std::mem::zeroed();
    libc::CPU_SET(cpu, &mut set);
    if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
      return Err(std::io::Error::last_os_error());
    }
  }
  Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(_cpu: u16) -> std::io::Result<()> {
  Err(std::io::Error::new(
    std::io::ErrorKind::Unsupported,
    "cpu affinity is not supported on this platform",
  ))
}
