//! # Unbounded Queue
//!
//! A forward-linked chain of bounded segments. When the producer's current
//! segment has no room it creates a larger one, links it behind the current
//! segment and continues there. The consumer drains the head segment and only
//! moves on (freeing the old one) once that segment is empty *and* a successor
//! has been linked.
//!
//! Growth doubles the capacity until the record fits. With a maximum capacity
//! the producer reports "no room" instead of growing past it.

mod __test__;

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::bounded_queue::{bounded, BoundedConsumer, BoundedProducer, WriteHandle};
use crate::error::{Error, Result};

/// Recorded by the consumer each time it moves to a new segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSwitch {
  pub previous_capacity: usize,
  pub new_capacity: usize,
}

struct NextSegment {
  consumer: BoundedConsumer,
  link: Arc<Link>,
}

/// Shared between the two ends of one segment; holds the successor, if any.
#[derive(Default)]
struct Link {
  next: AtomicPtr<NextSegment>,
}

impl Drop for Link {
  fn drop(&mut self) {
    let next = self.next.swap(ptr::null_mut(), Ordering::Acquire);
    if !next.is_null() {
      // SAFETY: created by Box::into_raw in `UnboundedProducer::grow` and never taken
      drop(unsafe { Box::from_raw(next) });
    }
  }
}

/// Creates a growable queue. `max_capacity` of `None` means growth is unlimited.
pub fn unbounded(
  initial_capacity: usize,
  max_capacity: Option<usize>,
  huge_pages: bool,
) -> Result<(UnboundedProducer, UnboundedConsumer)> {
  let (producer, consumer) = bounded(initial_capacity, huge_pages)?;
  let link = Arc::new(Link::default());

  Ok((
    UnboundedProducer {
      producer,
      link: Arc::clone(&link),
      max_capacity,
      huge_pages,
    },
    UnboundedConsumer {
      consumer,
      link,
      switch: None,
    },
  ))
}

pub struct UnboundedProducer {
  producer: BoundedProducer,
  link: Arc<Link>,
  max_capacity: Option<usize>,
  huge_pages: bool,
}

impl UnboundedProducer {
  /// Reserves `n` bytes, growing into a new segment when the current one is full.
  ///
  /// Returns `Ok(None)` only when growth would exceed the maximum capacity and
  /// `Err` when the record can never fit or a segment cannot be allocated.
  #[inline]
  pub fn try_reserve(&mut self, n: usize) -> Result<Option<WriteHandle<'_>>> {
    if !self.producer.has_room(n) && !self.grow(n)? {
      return Ok(None);
    }
    Ok(self.producer.try_reserve(n))
  }

  /// Writes one record of `n` bytes through `write`. Returns `Ok(false)` when
  /// the maximum capacity was reached and nothing was written.
  pub fn emplace(&mut self, n: usize, write: impl FnOnce(&mut [u8])) -> Result<bool> {
    match self.try_reserve(n)? {
      Some(mut handle) => {
        write(&mut handle);
        handle.commit();
        Ok(true)
      },
      None => Ok(false),
    }
  }

  #[cold]
  fn grow(&mut self, n: usize) -> Result<bool> {
    let mut capacity = self.producer.capacity() * 2;
    while capacity < n {
      capacity *= 2;
    }

    if let Some(max) = self.max_capacity {
      if n > max {
        return Err(Error::allocation(
          n,
          format!("record exceeds the maximum queue capacity of {} bytes", max),
        ));
      }
      if capacity > max {
        return Ok(false);
      }
    }

    let (producer, consumer) = bounded(capacity, self.huge_pages)?;
    let link = Arc::new(Link::default());
    let next = Box::new(NextSegment {
      consumer,
      link: Arc::clone(&link),
    });

    // Everything written to the old segment is already committed
    self.link.next.store(Box::into_raw(next), Ordering::Release);
    self.producer = producer;
    self.link = link;

    Ok(true)
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.producer.capacity()
  }
}

pub struct UnboundedConsumer {
  consumer: BoundedConsumer,
  link: Arc<Link>,
  switch: Option<QueueSwitch>,
}

impl UnboundedConsumer {
  /// Returns the readable window of the head segment, moving to the successor
  /// segment when the head is drained.
  pub fn try_read(&mut self) -> Option<&[u8]> {
    while self.consumer.available() == 0 {
      if self.link.next.load(Ordering::Acquire).is_null() {
        return None;
      }

      // The producer may have committed to the old segment just before linking
      if self.consumer.available() != 0 {
        break;
      }

      let next = self.link.next.swap(ptr::null_mut(), Ordering::Acquire);
      // SAFETY: non-null was observed above and only this consumer swaps it out
      let next = unsafe { Box::from_raw(next) };

      self.consumer.commit_read();
      let previous_capacity = self.consumer.capacity();
      let NextSegment { consumer, link } = *next;
      self.consumer = consumer;
      self.link = link;

      self.switch = Some(QueueSwitch {
        previous_capacity,
        new_capacity: self.consumer.capacity(),
      });
    }

    self.consumer.try_read()
  }

  #[inline]
  pub fn release(&mut self, n: usize) {
    self.consumer.release(n);
  }

  #[inline]
  pub fn commit_read(&mut self) {
    self.consumer.commit_read();
  }

  /// Returns the most recent segment switch, once.
  pub fn take_switch(&mut self) -> Option<QueueSwitch> {
    self.switch.take()
  }

  pub fn is_empty(&self) -> bool {
    self.consumer.is_empty() && self.link.next.load(Ordering::Acquire).is_null()
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.consumer.capacity()
  }
}
