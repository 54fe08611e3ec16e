
use std::collections::VecDeque;

use crate::level::LogLevel;
use crate::transit::TransitEvent;

/// A fixed-capacity ring of `Backtrace` records held back by one logger.
///
/// When the ring is full, storing a new record evicts the oldest one. The
/// stored records are emitted in insertion order when a record at or above
/// `flush_level` is logged, or on an explicit backtrace flush.
#[derive(Debug)]
pub struct BacktraceStorage {
  /// Internal storage for the ring
  events: VecDeque<TransitEvent>,

  /// Maximum number of records the ring can hold
  capacity: usize,

  /// Records at or above this level trigger a flush of the ring
  flush_level: LogLevel,
}

impl BacktraceStorage {
  pub fn new(capacity: usize, flush_level: LogLevel) -> Self {
    Self {
      events: VecDeque::with_capacity(capacity),
      capacity,
      flush_level,
    }
  }

  /// Re-initializes the ring. Anything stored so far is discarded.
  pub fn configure(&mut self, capacity: usize, flush_level: LogLevel) {
    self.events.clear();
    self.events.shrink_to(capacity);
    self.capacity = capacity;
    self.flush_level = flush_level;
  }

  /// Stores a copy of `event`, evicting the oldest record when full.
  pub fn store(&mut self, event: &TransitEvent) {
    if self.capacity == 0 {
      return;
    }

    if self.events.len() == self.capacity {
      // Reuse the evicted slot's buffers
      if let Some(mut oldest) = self.events.pop_front() {
        oldest.clone_from(event);
        self.events.push_back(oldest);
        return;
      }
    }
    self.events.push_back(event.clone());
  }

  /// Hands every stored record to `f` in insertion order, then empties the ring.
  pub fn process(&mut self, mut f: impl FnMut(&TransitEvent)) {
    for event in &self.events {
      f(event);
    }
    self.events.clear();
  }

  #[inline]
  pub fn should_flush(&self, level: LogLevel) -> bool {
    level >= self.flush_level && level != LogLevel::Backtrace && level != LogLevel::None
  }

  pub fn flush_level(&self) -> LogLevel {
    self.flush_level
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn len(&self) -> usize {
    self.events.len()
  }

  pub fn is_empty(&self) -> bool {
    self.events.is_empty()
  }
}
