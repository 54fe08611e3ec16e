//! # Bounded Queue
//!
//! Single-producer/single-consumer queue of variable-length byte records on top
//! of [`RingStorage`]. The producer and consumer each own a handle; the only
//! shared state is the pair of cache-padded cursors.
//!
//! ## Cursor protocol
//!
//! - Both cursors grow monotonically; the ring offset is `pos & mask`.
//! - Each side keeps a cached copy of the opposite cursor and only reloads it
//!   (acquire) when the cached value says there is no room or no data.
//! - The producer publishes with a release store after the bytes are written,
//!   so a reader never observes a partial record.
//! - The consumer publishes its cursor in batches (5% of the capacity) or at the
//!   end of a drain pass with [`BoundedConsumer::commit_read`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (mut producer, mut consumer) = bounded(4096, false)?;
//!
//! let mut handle = producer.try_reserve(5).expect("room");
//! handle.copy_from_slice(b"hello");
//! handle.commit();
//!
//! let window = consumer.try_read().expect("data");
//! assert_eq!(&window[..5], b"hello");
//! consumer.release(5);
//! consumer.commit_read();
//! ```


use crossbeam_utils::CachePadded;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ring_storage::RingStorage;

/// Smallest capacity a queue is created with.
pub const MIN_CAPACITY: usize = 1024;

struct QueueCore {
  writer_pos: CachePadded<AtomicUsize>,
  reader_pos: CachePadded<AtomicUsize>,
  storage: RingStorage,
  capacity: usize,
  mask: usize,
  bytes_per_batch: usize,
}

/// Creates a queue and returns its two ends.
///
/// `capacity` must be a power of two; values below [`MIN_CAPACITY`] are raised
/// to it.
pub fn bounded(capacity: usize, huge_pages: bool) -> Result<(BoundedProducer, BoundedConsumer)> {
  if capacity == 0 || !capacity.is_power_of_two() {
    return Err(Error::config(format!(
      "queue capacity {} is not a power of two",
      capacity
    )));
  }
  let capacity = capacity.max(MIN_CAPACITY);
  let storage = RingStorage::reserve(capacity, huge_pages)?;

  let core = Arc::new(QueueCore {
    writer_pos: CachePadded::new(AtomicUsize::new(0)),
    reader_pos: CachePadded::new(AtomicUsize::new(0)),
    mask: storage.mask(),
    bytes_per_batch: (capacity as f64 * 0.05) as usize,
    storage,
    capacity,
  });

  let producer = BoundedProducer {
    core: Arc::clone(&core),
    writer_pos: 0,
    reader_pos_cache: 0,
  };

  let consumer = BoundedConsumer {
    core,
    reader_pos: 0,
    writer_pos_cache: 0,
    last_published_reader_pos: 0,
  };

  Ok((producer, consumer))
}

/// Producer end. Owned by exactly one frontend thread.
pub struct BoundedProducer {
  core: Arc<QueueCore>,
  writer_pos: usize,
  reader_pos_cache: usize,
}

impl BoundedProducer {
  /// Returns a writable window of exactly `n` bytes, or `None` when the queue
  /// does not have room even after refreshing the consumer cursor. Never blocks.
  #[inline]
  pub fn try_reserve(&mut self, n: usize) -> Option<WriteHandle<'_>> {
    if !self.has_room(n) {
      return None;
    }

    let offset = self.writer_pos & self.core.mask;
    Some(WriteHandle {
      producer: self,
      offset,
      len: n,
    })
  }

  /// Whether `n` bytes fit, reloading the cached consumer cursor at most once.
  #[inline]
  pub fn has_room(&mut self, n: usize) -> bool {
    let capacity = self.core.capacity;
    if n > capacity {
      return false;
    }

    if capacity - self.writer_pos.wrapping_sub(self.reader_pos_cache) < n {
      self.reader_pos_cache = self.core.reader_pos.load(Ordering::Acquire);
      if capacity - self.writer_pos.wrapping_sub(self.reader_pos_cache) < n {
        return false;
      }
    }
    true
  }

  #[inline]
  fn commit(&mut self, offset: usize, len: usize) {
    self.core.storage.publish_write(offset, len);
    self.writer_pos = self.writer_pos.wrapping_add(len);
    self.core.writer_pos.store(self.writer_pos, Ordering::Release);
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.core.capacity
  }

  /// True when the consumer has published every byte this producer wrote.
  pub fn is_empty(&self) -> bool {
    self.core.reader_pos.load(Ordering::Acquire) == self.writer_pos
  }
}

/// A reserved, not yet published region of the queue.
///
/// Dropping the handle without [`WriteHandle::commit`] discards the write.
pub struct WriteHandle<'a> {
  producer: &'a mut BoundedProducer,
  offset: usize,
  len: usize,
}

impl WriteHandle<'_> {
  /// Publishes the record to the consumer.
  #[inline]
  pub fn commit(self) {
    let (offset, len) = (self.offset, self.len);
    self.producer.commit(offset, len);
  }
}

impl Deref for WriteHandle<'_> {
  type Target = [u8];

  #[inline]
  fn deref(&self) -> &[u8] {
    // SAFETY: the region is free space owned by the producer until commit
    unsafe { self.producer.core.storage.as_slice(self.offset, self.len) }
  }
}

impl DerefMut for WriteHandle<'_> {
  #[inline]
  fn deref_mut(&mut self) -> &mut [u8] {
    // SAFETY: as above, and the handle borrows the producer mutably
    unsafe { self.producer.core.storage.as_mut_slice(self.offset, self.len) }
  }
}

/// Consumer end. Owned by the backend thread.
pub struct BoundedConsumer {
  core: Arc<QueueCore>,
  reader_pos: usize,
  writer_pos_cache: usize,
  last_published_reader_pos: usize,
}

impl BoundedConsumer {
  /// Returns every committed, unread byte as one flat window, or `None` when
  /// the queue is empty after refreshing the producer cursor.
  #[inline]
  pub fn try_read(&mut self) -> Option<&[u8]> {
    let len = self.available();
    if len == 0 {
      return None;
    }

    let offset = self.reader_pos & self.core.mask;
    self.core.storage.prepare_read(offset, len);

    // SAFETY: [reader_pos, writer_pos_cache) was published by the producer and
    // stays untouched until the consumer cursor moves past it
    Some(unsafe { self.core.storage.as_slice(offset, len) })
  }

  /// Number of readable bytes, reloading the cached producer cursor only when
  /// the cached value says the queue is empty.
  #[inline]
  pub fn available(&mut self) -> usize {
    if self.writer_pos_cache == self.reader_pos {
      self.writer_pos_cache = self.core.writer_pos.load(Ordering::Acquire);
    }
    self.writer_pos_cache.wrapping_sub(self.reader_pos)
  }

  /// Marks `n` bytes as consumed. The cursor becomes visible to the producer
  /// once a batch worth of bytes has been released, or on `commit_read`.
  #[inline]
  pub fn release(&mut self, n: usize) {
    debug_assert!(n <= self.writer_pos_cache.wrapping_sub(self.reader_pos));
    self.reader_pos = self.reader_pos.wrapping_add(n);

    if self.reader_pos.wrapping_sub(self.last_published_reader_pos) >= self.core.bytes_per_batch {
      self.publish();
    }
  }

  /// Publishes the consumer cursor if anything was released since the last publish.
  #[inline]
  pub fn commit_read(&mut self) {
    if self.reader_pos != self.last_published_reader_pos {
      self.publish();
    }
  }

  #[inline]
  fn publish(&mut self) {
    self.core.reader_pos.store(self.reader_pos, Ordering::Release);
    self.last_published_reader_pos = self.reader_pos;
  }

  /// True iff the consumer cursor equals the producer cursor.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.core.writer_pos.load(Ordering::Acquire) == self.reader_pos
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.core.capacity
  }
}
