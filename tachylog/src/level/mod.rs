
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Severity of a log statement.
///
/// Levels are ordered from the most detailed to the most severe. `Backtrace`
/// sits above `Critical` so it is never filtered by a logger level, `None`
/// disables a logger and `Dynamic` marks a call site whose level is chosen at
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogLevel {
  TraceL3 = 0,
  TraceL2 = 1,
  TraceL1 = 2,
  Debug = 3,
  Info = 4,
  Notice = 5,
  Warning = 6,
  Error = 7,
  Critical = 8,
  Backtrace = 9,
  None = 10,
  Dynamic = 11,
}

/// Number of distinct levels, used to size the description tables.
pub const LEVEL_COUNT: usize = 12;

impl LogLevel {
  pub const ALL: [LogLevel; LEVEL_COUNT] = [
    LogLevel::TraceL3,
    LogLevel::TraceL2,
    LogLevel::TraceL1,
    LogLevel::Debug,
    LogLevel::Info,
    LogLevel::Notice,
    LogLevel::Warning,
    LogLevel::Error,
    LogLevel::Critical,
    LogLevel::Backtrace,
    LogLevel::None,
    LogLevel::Dynamic,
  ];

  #[inline]
  pub fn from_u8(value: u8) -> Option<LogLevel> {
    Self::ALL.get(value as usize).copied()
  }

  #[inline]
  pub fn as_index(self) -> usize {
    self as usize
  }

  pub fn as_str(self) -> &'static str {
    default_level_descriptions()[self.as_index()]
  }
}

impl FromStr for LogLevel {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let level = match s.to_ascii_lowercase().as_str() {
      "tracel3" | "trace_l3" => LogLevel::TraceL3,
      "tracel2" | "trace_l2" => LogLevel::TraceL2,
      "tracel1" | "trace_l1" | "trace" => LogLevel::TraceL1,
      "debug" => LogLevel::Debug,
      "info" => LogLevel::Info,
      "notice" => LogLevel::Notice,
      "warning" | "warn" => LogLevel::Warning,
      "error" => LogLevel::Error,
      "critical" => LogLevel::Critical,
      "backtrace" => LogLevel::Backtrace,
      "none" => LogLevel::None,
      "dynamic" => LogLevel::Dynamic,
      other => return Err(Error::config(format!("unknown log level '{}'", other))),
    };
    Ok(level)
  }
}

impl std::fmt::Display for LogLevel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

pub(crate) fn default_level_descriptions() -> [&'static str; LEVEL_COUNT] {
  [
    "TRACE_L3",
    "TRACE_L2",
    "TRACE_L1",
    "DEBUG",
    "INFO",
    "NOTICE",
    "WARNING",
    "ERROR",
    "CRITICAL",
    "BACKTRACE",
    "NONE",
    "DYNAMIC",
  ]
}

pub(crate) fn default_level_short_codes() -> [&'static str; LEVEL_COUNT] {
  [
    "T3", "T2", "T1", "D", "I", "N", "W", "E", "C", "BT", "_", "DN",
  ]
}
