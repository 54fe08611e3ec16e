//! # Transit
//!
//! The backend's decoded form of a record, and the per-thread ring the backend
//! caches them in between reading a queue and dispatching to sinks.
//!
//! Slots are reused: the message and named-argument buffers keep their
//! allocations across records, so a warmed-up backend formats without
//! allocating.


use std::sync::Arc;

use crate::level::LogLevel;
use crate::record::{EventKind, Metadata};

#[derive(Debug, Clone)]
pub struct TransitEvent {
  pub timestamp: u64,
  pub kind: EventKind,
  pub metadata: Option<&'static Metadata>,
  pub logger_id: u32,
  pub thread_id: u32,
  pub thread_name: Arc<str>,
  pub formatted_message: String,
  pub named_args: Vec<(String, String)>,
  /// Runtime level of a `Dynamic` call site.
  pub dynamic_level: Option<LogLevel>,
  /// `Flush` only.
  pub flush_sequence: u64,
  /// `InitBacktrace` only.
  pub backtrace_capacity: u32,
  /// `InitBacktrace` only.
  pub backtrace_flush_level: LogLevel,
}

impl Default for TransitEvent {
  fn default() -> Self {
    Self {
      timestamp: 0,
      kind: EventKind::Log,
      metadata: None,
      logger_id: 0,
      thread_id: 0,
      thread_name: Arc::from(""),
      formatted_message: String::new(),
      named_args: Vec::new(),
      dynamic_level: None,
      flush_sequence: 0,
      backtrace_capacity: 0,
      backtrace_flush_level: LogLevel::None,
    }
  }
}

impl TransitEvent {
  /// Effective level: the runtime level for dynamic call sites, otherwise the call site's.
  #[inline]
  pub fn level(&self) -> LogLevel {
    match (self.dynamic_level, self.metadata) {
      (Some(level), _) => level,
      (None, Some(metadata)) => metadata.level,
      (None, None) => LogLevel::None,
    }
  }

  /// Clears the per-record fields, keeping buffer allocations.
  #[inline]
  pub fn reset(&mut self) {
    self.formatted_message.clear();
    self.named_args.clear();
    self.dynamic_level = None;
    self.flush_sequence = 0;
    self.backtrace_capacity = 0;
  }
}

/// Growable FIFO of reusable [`TransitEvent`] slots. Capacity is a power of two.
///
/// Writing is two-step: fill [`TransitEventBuffer::back_mut`], then
/// [`TransitEventBuffer::push_back`] to make it visible.
pub struct TransitEventBuffer {
  events: Vec<TransitEvent>,
  mask: usize,
  reader: usize,
  writer: usize,
  initial_capacity: usize,
}

impl TransitEventBuffer {
  pub fn new(initial_capacity: usize) -> Self {
    let capacity = initial_capacity.max(1).next_power_of_two();
    Self {
      events: (0..capacity).map(|_| TransitEvent::default()).collect(),
      mask: capacity - 1,
      reader: 0,
      writer: 0,
      initial_capacity: capacity,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.writer - self.reader
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.reader == self.writer
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.events.len()
  }

  #[inline]
  pub fn front(&self) -> Option<&TransitEvent> {
    if self.is_empty() {
      return None;
    }
    Some(&self.events[self.reader & self.mask])
  }

  #[inline]
  pub fn front_mut(&mut self) -> Option<&mut TransitEvent> {
    if self.is_empty() {
      return None;
    }
    Some(&mut self.events[self.reader & self.mask])
  }

  #[inline]
  pub fn pop_front(&mut self) {
    if !self.is_empty() {
      self.reader += 1;
    }
  }

  /// The next free slot, already reset. Grows the buffer when it is full.
  #[inline]
  pub fn back_mut(&mut self) -> &mut TransitEvent {
    if self.len() == self.capacity() {
      self.grow();
    }
    let slot = &mut self.events[self.writer & self.mask];
    slot.reset();
    slot
  }

  #[inline]
  pub fn push_back(&mut self) {
    debug_assert!(self.len() < self.capacity());
    self.writer += 1;
  }

  #[cold]
  fn grow(&mut self) {
    self.resize(self.capacity() * 2);
  }

  fn resize(&mut self, capacity: usize) {
    let len = self.len();
    let mut events: Vec<TransitEvent> = Vec::with_capacity(capacity);
    for i in 0..len {
      let index = (self.reader + i) & self.mask;
      events.push(std::mem::take(&mut self.events[index]));
    }
    events.resize_with(capacity, TransitEvent::default);

    self.events = events;
    self.mask = capacity - 1;
    self.reader = 0;
    self.writer = len;
  }

  /// Returns an empty buffer to its initial capacity.
  pub fn shrink(&mut self) -> bool {
    if self.is_empty() && self.capacity() > self.initial_capacity {
      self.resize(self.initial_capacity);
      return true;
    }
    false
  }
}
