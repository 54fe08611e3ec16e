//! # Sink
//!
//! Destinations for formatted log records, and the error notifier the backend
//! reports its own problems through.
//!
//! Sinks are called on the backend thread only, in global timestamp order.
//! A panicking sink is isolated: the panic is caught at the call site,
//! reported through the notifier and the next record is dispatched as usual.
//!
//! ## Usage
//!
//! ```rust,ignore
//! struct Counter(AtomicUsize);
//!
//! impl Sink for Counter {
//!   fn write_log(&self, _record: &LogRecord<'_>) {
//!     self.0.fetch_add(1, Ordering::Relaxed);
//!   }
//! }
//!
//! let logger = engine.create_or_get_logger("counted", vec![Arc::new(Counter(AtomicUsize::new(0)))]);
//! ```


use crossbeam_channel::Sender;
use std::sync::Arc;

use crate::level::LogLevel;
use crate::record::Metadata;

/// One formatted record, borrowed from the backend for the duration of a
/// [`Sink::write_log`] call.
#[derive(Debug, Clone, Copy)]
pub struct LogRecord<'a> {
  pub metadata: &'static Metadata,
  /// Nanoseconds since the Unix epoch (or the caller's unit for user clocks).
  pub timestamp: u64,
  pub thread_id: u32,
  pub thread_name: &'a str,
  pub process_id: u32,
  pub logger_name: &'a str,
  pub level: LogLevel,
  pub level_description: &'a str,
  pub level_short_code: &'a str,
  pub named_args: &'a [(String, String)],
  pub message: &'a str,
}

impl LogRecord<'_> {
  pub fn to_owned_record(&self) -> OwnedRecord {
    OwnedRecord {
      timestamp: self.timestamp,
      thread_id: self.thread_id,
      thread_name: self.thread_name.to_string(),
      logger_name: self.logger_name.to_string(),
      level: self.level,
      file: self.metadata.file,
      line: self.metadata.line,
      named_args: self.named_args.to_vec(),
      message: self.message.to_string(),
    }
  }
}

/// A [`LogRecord`] detached from the backend's buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedRecord {
  pub timestamp: u64,
  pub thread_id: u32,
  pub thread_name: String,
  pub logger_name: String,
  pub level: LogLevel,
  pub file: &'static str,
  pub line: u32,
  pub named_args: Vec<(String, String)>,
  pub message: String,
}

/// Core trait for log destinations.
/// No error returns: a sink handles its own I/O failures.
pub trait Sink: Send + Sync + 'static {
  /// Write one record.
  /// Panics are caught at the call site to isolate sink failures.
  fn write_log(&self, record: &LogRecord<'_>);

  /// Called after a flush request and whenever the backend goes idle.
  fn flush(&self) {}

  /// Called once per backend idle pass.
  fn run_periodic_tasks(&self) {}

  /// Sink-side level filter, checked before formatting is handed over.
  fn enabled(&self, _level: LogLevel) -> bool {
    true
  }

  /// Called when the backend thread starts
  fn on_start(&self) {}

  /// Called when the backend thread exits
  fn on_shutdown(&self) {}
}

/// Receives backend diagnostics: dropped messages, queue growth, format and sink failures.
pub type ErrorNotifier = Arc<dyn Fn(&str) + Send + Sync>;

pub fn default_error_notifier() -> ErrorNotifier {
  Arc::new(|message: &str| eprintln!("{}", message))
}

/// Forwards owned copies of every record over a channel.
pub struct ChannelSink {
  sender: Sender<OwnedRecord>,
  flushes: Option<Sender<()>>,
}

impl ChannelSink {
  pub fn new(sender: Sender<OwnedRecord>) -> Self {
    Self {
      sender,
      flushes: None,
    }
  }

  /// Also signal every [`Sink::flush`] call on `flushes`.
  pub fn with_flush_signal(mut self, flushes: Sender<()>) -> Self {
    self.flushes = Some(flushes);
    self
  }
}

impl Sink for ChannelSink {
  fn write_log(&self, record: &LogRecord<'_>) {
    // The receiver going away is not the backend's problem
    let _ = self.sender.send(record.to_owned_record());
  }

  fn flush(&self) {
    if let Some(flushes) = &self.flushes {
      let _ = flushes.try_send(());
    }
  }
}
