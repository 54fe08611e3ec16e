//! # Record
//!
//! The fixed-size header every frontend writes in front of a record's payload,
//! and the static call-site [`Metadata`] it refers to.
//!
//! ## Layout
//!
//! | field          | type  | bytes |
//! |----------------|-------|-------|
//! | `timestamp`    | `u64` | 8     |
//! | `kind`         | `u8`  | 1     |
//! | `metadata_ref` | `u32` | 4     |
//! | `logger_ref`   | `u32` | 4     |
//! | `format_ref`   | `u32` | 4     |
//!
//! Fields are native-endian and unaligned. The payload depends on the kind:
//!
//! - `Log`: the encoded argument list, then one level byte when the call site
//!   is `Dynamic`.
//! - `InitBacktrace`: `u32` capacity followed by the flush level byte.
//! - `FlushBacktrace`: nothing.
//! - `Flush`: the `u64` flush sequence of the writing thread.

mod __test__;

use std::sync::atomic::{AtomicU32, Ordering};

use crate::codec::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::level::LogLevel;
use crate::registry;

pub const HEADER_SIZE: usize = 21;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
  Log = 0,
  InitBacktrace = 1,
  FlushBacktrace = 2,
  Flush = 3,
}

impl EventKind {
  pub fn from_u8(value: u8) -> Result<Self> {
    match value {
      0 => Ok(EventKind::Log),
      1 => Ok(EventKind::InitBacktrace),
      2 => Ok(EventKind::FlushBacktrace),
      3 => Ok(EventKind::Flush),
      other => Err(Error::decode(format!("unknown event kind {}", other))),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
  pub timestamp: u64,
  pub kind: EventKind,
  pub metadata_ref: u32,
  pub logger_ref: u32,
  pub format_ref: u32,
}

impl RecordHeader {
  #[inline]
  pub fn encode(&self, encoder: &mut Encoder<'_>) {
    encoder.put_u64(self.timestamp);
    encoder.put_u8(self.kind as u8);
    encoder.put_u32(self.metadata_ref);
    encoder.put_u32(self.logger_ref);
    encoder.put_u32(self.format_ref);
  }

  #[inline]
  pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
    Ok(Self {
      timestamp: decoder.u64()?,
      kind: EventKind::from_u8(decoder.u8()?)?,
      metadata_ref: decoder.u32()?,
      logger_ref: decoder.u32()?,
      format_ref: decoder.u32()?,
    })
  }

  /// Reads only the timestamp, without consuming anything.
  #[inline]
  pub fn peek_timestamp(bytes: &[u8]) -> Option<u64> {
    let raw = bytes.get(..8)?;
    let mut out = [0u8; 8];
    out.copy_from_slice(raw);
    Some(u64::from_ne_bytes(out))
  }
}

/// Static description of one log call site.
///
/// Created by the logging macros as a `static`; registered with the metadata
/// registry the first time the call site fires.
#[derive(Debug)]
pub struct Metadata {
  pub format: &'static str,
  pub file: &'static str,
  pub line: u32,
  pub module_path: &'static str,
  pub level: LogLevel,
  id: AtomicU32,
}

impl Metadata {
  pub const fn new(
    format: &'static str,
    file: &'static str,
    line: u32,
    module_path: &'static str,
    level: LogLevel,
  ) -> Self {
    Self {
      format,
      file,
      line,
      module_path,
      level,
      id: AtomicU32::new(0),
    }
  }

  /// Registry id of this call site. Zero is never a valid id.
  #[inline]
  pub fn id(&'static self) -> u32 {
    match self.id.load(Ordering::Acquire) {
      0 => registry::register_metadata(self),
      id => id,
    }
  }

  #[inline]
  pub(crate) fn id_slot(&self) -> &AtomicU32 {
    &self.id
  }

  /// `file:line`, as shown in the format failure placeholder.
  pub fn location(&self) -> String {
    format!("{}:{}", self.file, self.line)
  }

  /// File name without its directories.
  pub fn short_file(&self) -> &'static str {
    self.file.rsplit(['/', '\\']).next().unwrap_or(self.file)
  }
}
