use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::Mutex;

use crate::sink::{LogRecord, Sink};

mod __test__;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdoutFormat {
  /// `2024-01-01T00:00:00.000000000Z [tid] file.rs:12  INFO      logger  message`
  #[default]
  Text,
  /// One JSON object per line; named arguments become top-level fields.
  Json,
}

/// Writes each record as one line to standard output.
pub struct StdoutSink {
  format: StdoutFormat,
  // Pre-allocate buffer to avoid allocations per record
  buffer: Mutex<String>,
}

impl StdoutSink {
  pub fn new(format: StdoutFormat) -> Self {
    Self {
      format,
      buffer: Mutex::new(String::with_capacity(256)),
    }
  }

  pub fn text() -> Self {
    Self::new(StdoutFormat::Text)
  }

  pub fn json() -> Self {
    Self::new(StdoutFormat::Json)
  }

  /// Appends the formatted line, including its trailing newline, to `out`.
  pub fn format_into(&self, record: &LogRecord<'_>, out: &mut String) {
    let message = record.message.strip_suffix('\n').unwrap_or(record.message);
    let time = format_timestamp(record.timestamp);

    match self.format {
      StdoutFormat::Text => {
        let location = format!("{}:{}", record.metadata.short_file(), record.metadata.line);
        let _ = write!(
          out,
          "{} [{}] {:<24} {:<9} {:<12} {}",
          time, record.thread_id, location, record.level_description, record.logger_name, message
        );
        out.push('\n');
      },
      StdoutFormat::Json => {
        let mut object = Map::new();
        object.insert("timestamp".into(), Value::String(time));
        object.insert("file_name".into(), Value::String(record.metadata.short_file().into()));
        object.insert("line".into(), Value::from(record.metadata.line));
        object.insert("thread_id".into(), Value::from(record.thread_id));
        object.insert("thread_name".into(), Value::String(record.thread_name.into()));
        object.insert("logger".into(), Value::String(record.logger_name.into()));
        object.insert("log_level".into(), Value::String(record.level_description.into()));
        object.insert("message".into(), Value::String(message.into()));
        for (key, value) in record.named_args {
          object.entry(key.clone()).or_insert_with(|| Value::String(value.clone()));
        }
        let _ = write!(out, "{}", Value::Object(object));
        out.push('\n');
      },
    }
  }
}

impl Default for StdoutSink {
  fn default() -> Self {
    Self::text()
  }
}

/// RFC 3339 in UTC with nanoseconds.
pub fn format_timestamp(ns: u64) -> String {
  let secs = (ns / 1_000_000_000) as i64;
  let nanos = (ns % 1_000_000_000) as u32;
  match DateTime::from_timestamp(secs, nanos) {
    Some(time) => time.to_rfc3339_opts(SecondsFormat::Nanos, true),
    None => ns.to_string(),
  }
}

impl Sink for StdoutSink {
  fn write_log(&self, record: &LogRecord<'_>) {
    let Ok(mut buf) = self.buffer.lock() else {
      return;
    };
    buf.clear();
    self.format_into(record, &mut buf);

    // Single write call
    let _ = io::stdout().lock().write_all(buf.as_bytes());
  }

  fn flush(&self) {
    let _ = io::stdout().flush();
  }
}
