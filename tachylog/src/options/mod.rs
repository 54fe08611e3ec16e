//! # Options
//!
//! Frontend (queue) and backend (worker thread) configuration.
//!
//! Both structs deserialize from JSON with every field optional; missing fields
//! take their defaults. Durations are written as integer nanoseconds. Function
//! valued settings (error notifier, printable check) are code-only.
//!
//! ```rust
//! use tachylog::options::BackendOptions;
//!
//! let options = BackendOptions::from_json(r#"{ "thread_name": "log-backend", "cpu_affinity": 2 }"#).unwrap();
//! assert_eq!(options.thread_name, "log-backend");
//! assert_eq!(options.cpu_affinity, Some(2));
//! assert!(options.wait_for_queues_to_empty_before_exit);
//! ```

mod __test__;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::level::{default_level_descriptions, default_level_short_codes, LEVEL_COUNT};
use crate::message_format::is_printable_ascii;
use crate::sink::{default_error_notifier, ErrorNotifier};

/// Queue flavour used by every frontend thread of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueueType {
  /// Fixed capacity; the caller retries until there is room.
  BoundedBlocking,
  /// Fixed capacity; the record is dropped and counted.
  BoundedDropping,
  /// Grows up to `unbounded_queue_max_capacity`, then retries.
  #[default]
  UnboundedBlocking,
  /// Grows up to `unbounded_queue_max_capacity`, then drops.
  UnboundedDropping,
  /// Grows without limit.
  UnboundedUnlimited,
}

impl QueueType {
  #[inline]
  pub fn is_bounded(self) -> bool {
    matches!(self, QueueType::BoundedBlocking | QueueType::BoundedDropping)
  }

  #[inline]
  pub fn is_blocking(self) -> bool {
    matches!(self, QueueType::BoundedBlocking | QueueType::UnboundedBlocking)
  }

  #[inline]
  pub fn is_dropping(self) -> bool {
    matches!(self, QueueType::BoundedDropping | QueueType::UnboundedDropping)
  }
}

mod duration_ns {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_nanos() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
  }
}

fn load_json<T: DeserializeOwned>(json: &str) -> Result<T> {
  serde_json::from_str(json).map_err(|e| Error::config(format!("malformed options: {}", e)))
}

fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
  let json = std::fs::read_to_string(path)
    .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
  load_json(&json)
}

fn power_of_two(name: &str, value: usize) -> Result<()> {
  if value == 0 || !value.is_power_of_two() {
    return Err(Error::config(format!("{} must be a power of two, got {}", name, value)));
  }
  Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendOptions {
  pub queue_type: QueueType,
  /// Bytes, power of two. Values below 1024 are raised to 1024.
  pub initial_queue_capacity: usize,
  /// Growth cap for the bounded-growth unbounded queues.
  pub unbounded_queue_max_capacity: usize,
  #[serde(with = "duration_ns")]
  pub blocking_queue_retry_interval: Duration,
  pub huge_pages: bool,
}

impl Default for FrontendOptions {
  fn default() -> Self {
    Self {
      queue_type: QueueType::UnboundedBlocking,
      initial_queue_capacity: 128 * 1024,
      unbounded_queue_max_capacity: 2 * 1024 * 1024 * 1024,
      blocking_queue_retry_interval: Duration::from_nanos(800),
      huge_pages: false,
    }
  }
}

impl FrontendOptions {
  pub fn from_json(json: &str) -> Result<Self> {
    let options: Self = load_json(json)?;
    options.validate()?;
    Ok(options)
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
    let options: Self = load_json_file(path.as_ref())?;
    options.validate()?;
    Ok(options)
  }

  pub fn validate(&self) -> Result<()> {
    power_of_two("initial_queue_capacity", self.initial_queue_capacity)?;
    power_of_two("unbounded_queue_max_capacity", self.unbounded_queue_max_capacity)?;
    if self.unbounded_queue_max_capacity < self.initial_queue_capacity {
      return Err(Error::config(format!(
        "unbounded_queue_max_capacity ({}) is smaller than initial_queue_capacity ({})",
        self.unbounded_queue_max_capacity, self.initial_queue_capacity
      )));
    }
    Ok(())
  }

  /// Growth cap for the configured queue type, `None` when unlimited.
  pub(crate) fn max_capacity(&self) -> Option<usize> {
    match self.queue_type {
      QueueType::UnboundedUnlimited => None,
      _ => Some(self.unbounded_queue_max_capacity),
    }
  }
}

/// Backend worker configuration.
///
/// ## Ordering
///
/// `log_timestamp_ordering_grace_period` holds back records younger than the
/// grace period so records from slower threads can still be merged in order.
/// Zero disables the hold-back: records are then ordered only among those
/// already read.
///
/// ## Transit limits
///
/// While fewer than `transit_events_soft_limit` events are cached the backend
/// processes one event per poll, re-reading the queues in between. Above it, it
/// processes cached events in a batch. A single thread never caches more than
/// `transit_events_hard_limit` events.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
  pub thread_name: String,
  pub enable_yield_when_idle: bool,
  #[serde(with = "duration_ns")]
  pub sleep_duration: Duration,
  pub transit_event_buffer_initial_capacity: usize,
  pub transit_events_soft_limit: usize,
  pub transit_events_hard_limit: usize,
  #[serde(with = "duration_ns")]
  pub log_timestamp_ordering_grace_period: Duration,
  pub wait_for_queues_to_empty_before_exit: bool,
  pub cpu_affinity: Option<u16>,
  #[serde(with = "duration_ns")]
  pub rdtsc_resync_interval: Duration,
  #[serde(with = "duration_ns")]
  pub sink_min_flush_interval: Duration,
  pub log_level_descriptions: [String; LEVEL_COUNT],
  pub log_level_short_codes: [String; LEVEL_COUNT],
  /// `None` disables sanitizing of string arguments.
  #[serde(skip)]
  pub check_printable_char: Option<fn(char) -> bool>,
  #[serde(skip, default = "default_error_notifier")]
  pub error_notifier: ErrorNotifier,
}

impl Default for BackendOptions {
  fn default() -> Self {
    Self {
      thread_name: "TachylogBackend".to_string(),
      enable_yield_when_idle: false,
      sleep_duration: Duration::from_nanos(500),
      transit_event_buffer_initial_capacity: 64,
      transit_events_soft_limit: 1024,
      transit_events_hard_limit: 131_072,
      log_timestamp_ordering_grace_period: Duration::from_micros(1),
      wait_for_queues_to_empty_before_exit: true,
      cpu_affinity: None,
      rdtsc_resync_interval: Duration::from_millis(500),
      sink_min_flush_interval: Duration::from_millis(200),
      log_level_descriptions: default_level_descriptions().map(String::from),
      log_level_short_codes: default_level_short_codes().map(String::from),
      check_printable_char: Some(is_printable_ascii),
      error_notifier: default_error_notifier(),
    }
  }
}

impl fmt::Debug for BackendOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BackendOptions")
      .field("thread_name", &self.thread_name)
      .field("enable_yield_when_idle", &self.enable_yield_when_idle)
      .field("sleep_duration", &self.sleep_duration)
      .field("transit_event_buffer_initial_capacity", &self.transit_event_buffer_initial_capacity)
      .field("transit_events_soft_limit", &self.transit_events_soft_limit)
      .field("transit_events_hard_limit", &self.transit_events_hard_limit)
      .field("log_timestamp_ordering_grace_period", &self.log_timestamp_ordering_grace_period)
      .field("wait_for_queues_to_empty_before_exit", &self.wait_for_queues_to_empty_before_exit)
      .field("cpu_affinity", &self.cpu_affinity)
      .field("rdtsc_resync_interval", &self.rdtsc_resync_interval)
      .field("sink_min_flush_interval", &self.sink_min_flush_interval)
      .field("check_printable_char", &self.check_printable_char.is_some())
      .finish_non_exhaustive()
  }
}

impl BackendOptions {
  pub fn from_json(json: &str) -> Result<Self> {
    let mut options: Self = load_json(json)?;
    options.validate()?;
    Ok(options)
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
    let mut options: Self = load_json_file(path.as_ref())?;
    options.validate()?;
    Ok(options)
  }

  /// Normalizes zero limits to one, then checks every sizing rule.
  pub fn validate(&mut self) -> Result<()> {
    if self.transit_events_soft_limit == 0 {
      self.transit_events_soft_limit = 1;
    }
    if self.transit_events_hard_limit == 0 {
      self.transit_events_hard_limit = 1;
    }

    power_of_two("transit_events_soft_limit", self.transit_events_soft_limit)?;
    power_of_two("transit_events_hard_limit", self.transit_events_hard_limit)?;
    power_of_two(
      "transit_event_buffer_initial_capacity",
      self.transit_event_buffer_initial_capacity,
    )?;

    if self.transit_events_soft_limit > self.transit_events_hard_limit {
      return Err(Error::config(format!(
        "transit_events_soft_limit ({}) cannot exceed transit_events_hard_limit ({})",
        self.transit_events_soft_limit, self.transit_events_hard_limit
      )));
    }
    if self.thread_name.contains('\0') {
      return Err(Error::config("thread_name cannot contain NUL bytes"));
    }
    Ok(())
  }

  pub(crate) fn notify(&self, message: &str) {
    (self.error_notifier)(message);
  }
}
