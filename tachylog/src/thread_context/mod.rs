//! # Thread Context
//!
//! Per-thread frontend state and the registry the backend discovers it from.
//!
//! A frontend thread gets its context the first time it logs through an engine:
//! a queue is created according to the engine's [`FrontendOptions`], the
//! producer end stays in a thread-local slot and the consumer end is handed to
//! the backend through the [`ThreadContextManager`]. When the thread exits the
//! context is marked invalid; the backend drops it once its queue is drained.
//!
//! ## Queue policies
//!
//! | queue type           | no room                                   |
//! |----------------------|-------------------------------------------|
//! | `BoundedBlocking`    | retry until there is room                 |
//! | `BoundedDropping`    | drop the record                           |
//! | `UnboundedBlocking`  | grow up to the cap, then retry            |
//! | `UnboundedDropping`  | grow up to the cap, then drop             |
//! | `UnboundedUnlimited` | grow                                      |
//!
//! Drops and blocking episodes are counted per thread and reported by the
//! backend through the error notifier.


use crossbeam_queue::SegQueue;
use crossbeam_utils::Backoff;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::bounded_queue::{bounded, BoundedConsumer, BoundedProducer, WriteHandle};
use crate::error::{Error, Result};
use crate::options::{FrontendOptions, QueueType};
use crate::unbounded_queue::{unbounded, QueueSwitch, UnboundedConsumer, UnboundedProducer};
use crate::utils::current_thread_id;

/// State of one frontend thread shared with the backend.
#[derive(Debug)]
pub struct ThreadContext {
  thread_id: u32,
  thread_name: Arc<str>,
  queue_type: QueueType,
  valid: AtomicBool,
  failure_count: AtomicUsize,
  flush_ack: AtomicU64,
}

impl ThreadContext {
  pub fn new(thread_id: u32, thread_name: impl Into<Arc<str>>, queue_type: QueueType) -> Self {
    Self {
      thread_id,
      thread_name: thread_name.into(),
      queue_type,
      valid: AtomicBool::new(true),
      failure_count: AtomicUsize::new(0),
      flush_ack: AtomicU64::new(0),
    }
  }

  #[inline]
  pub fn thread_id(&self) -> u32 {
    self.thread_id
  }

  #[inline]
  pub fn thread_name(&self) -> &str {
    &self.thread_name
  }

  #[inline]
  pub(crate) fn shared_thread_name(&self) -> &Arc<str> {
    &self.thread_name
  }

  #[inline]
  pub fn queue_type(&self) -> QueueType {
    self.queue_type
  }

  #[inline]
  pub fn is_valid(&self) -> bool {
    self.valid.load(Ordering::Acquire)
  }

  #[inline]
  pub fn invalidate(&self) {
    self.valid.store(false, Ordering::Release);
  }

  #[inline]
  pub(crate) fn record_failure(&self) {
    self.failure_count.fetch_add(1, Ordering::Relaxed);
  }

  /// Returns and resets the number of dropped records or blocking episodes.
  #[inline]
  pub fn take_failures(&self) -> usize {
    self.failure_count.swap(0, Ordering::Relaxed)
  }

  #[inline]
  pub fn flush_ack(&self) -> u64 {
    self.flush_ack.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn acknowledge_flush(&self, sequence: u64) {
    self.flush_ack.fetch_max(sequence, Ordering::Release);
  }
}

pub enum QueueProducer {
  Bounded(BoundedProducer),
  Unbounded(UnboundedProducer),
}

impl QueueProducer {
  /// `Ok(None)` means "no room right now". `Err` means the record can never be
  /// written to this queue.
  #[inline]
  pub fn try_reserve(&mut self, n: usize) -> Result<Option<WriteHandle<'_>>> {
    match self {
      QueueProducer::Bounded(producer) => {
        if n > producer.capacity() {
          return Err(Error::QueueFull);
        }
        Ok(producer.try_reserve(n))
      },
      QueueProducer::Unbounded(producer) => producer.try_reserve(n),
    }
  }

  pub fn capacity(&self) -> usize {
    match self {
      QueueProducer::Bounded(producer) => producer.capacity(),
      QueueProducer::Unbounded(producer) => producer.capacity(),
    }
  }
}

pub enum QueueConsumer {
  Bounded(BoundedConsumer),
  Unbounded(UnboundedConsumer),
}

impl QueueConsumer {
  #[inline]
  pub fn try_read(&mut self) -> Option<&[u8]> {
    match self {
      QueueConsumer::Bounded(consumer) => consumer.try_read(),
      QueueConsumer::Unbounded(consumer) => consumer.try_read(),
    }
  }

  #[inline]
  pub fn release(&mut self, n: usize) {
    match self {
      QueueConsumer::Bounded(consumer) => consumer.release(n),
      QueueConsumer::Unbounded(consumer) => consumer.release(n),
    }
  }

  #[inline]
  pub fn commit_read(&mut self) {
    match self {
      QueueConsumer::Bounded(consumer) => consumer.commit_read(),
      QueueConsumer::Unbounded(consumer) => consumer.commit_read(),
    }
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    match self {
      QueueConsumer::Bounded(consumer) => consumer.is_empty(),
      QueueConsumer::Unbounded(consumer) => consumer.is_empty(),
    }
  }

  pub fn capacity(&self) -> usize {
    match self {
      QueueConsumer::Bounded(consumer) => consumer.capacity(),
      QueueConsumer::Unbounded(consumer) => consumer.capacity(),
    }
  }

  pub fn take_switch(&mut self) -> Option<QueueSwitch> {
    match self {
      QueueConsumer::Bounded(_) => None,
      QueueConsumer::Unbounded(consumer) => consumer.take_switch(),
    }
  }
}

/// Creates the producer/consumer pair for `options.queue_type`.
pub fn create_queue(options: &FrontendOptions) -> Result<(QueueProducer, QueueConsumer)> {
  let capacity = options.initial_queue_capacity;
  if options.queue_type.is_bounded() {
    let (producer, consumer) = bounded(capacity, options.huge_pages)?;
    Ok((QueueProducer::Bounded(producer), QueueConsumer::Bounded(consumer)))
  } else {
    let (producer, consumer) = unbounded(capacity, options.max_capacity(), options.huge_pages)?;
    Ok((QueueProducer::Unbounded(producer), QueueConsumer::Unbounded(consumer)))
  }
}

/// A thread registered with the backend but not yet picked up by it.
pub struct Registration {
  pub context: Arc<ThreadContext>,
  pub consumer: QueueConsumer,
}

/// Hand-over point between registering frontend threads and the backend.
///
/// Registration is the only operation both sides touch and happens once per
/// thread, so a lock-free FIFO is enough. FIFO order is registration order,
/// which the backend uses to break timestamp ties.
#[derive(Default)]
pub struct ThreadContextManager {
  pending: SegQueue<Registration>,
}

impl ThreadContextManager {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, context: Arc<ThreadContext>, consumer: QueueConsumer) {
    self.pending.push(Registration { context, consumer });
  }

  /// Backend only.
  pub fn take_pending(&self) -> Option<Registration> {
    self.pending.pop()
  }

  pub fn has_pending(&self) -> bool {
    !self.pending.is_empty()
  }
}

/// Frontend half of a thread context, owned by the thread-local slot.
pub struct LocalContext {
  engine_id: u64,
  manager: Weak<ThreadContextManager>,
  context: Arc<ThreadContext>,
  producer: QueueProducer,
  flush_sequence: u64,
}

impl LocalContext {
  pub fn new(engine_id: u64, manager: &Arc<ThreadContextManager>, options: &FrontendOptions) -> Result<Self> {
    let (producer, consumer) = create_queue(options)?;
    let current = std::thread::current();
    let context = Arc::new(ThreadContext::new(
      current_thread_id(),
      current.name().unwrap_or(""),
      options.queue_type,
    ));

    manager.register(Arc::clone(&context), consumer);

    Ok(Self {
      engine_id,
      manager: Arc::downgrade(manager),
      context,
      producer,
      flush_sequence: 0,
    })
  }

  #[inline]
  pub fn context(&self) -> &Arc<ThreadContext> {
    &self.context
  }

  pub fn capacity(&self) -> usize {
    self.producer.capacity()
  }

  pub(crate) fn next_flush_sequence(&mut self) -> u64 {
    self.flush_sequence += 1;
    self.flush_sequence
  }

  /// Writes one record of `size` bytes through `write`, applying the queue policy.
  /// `write` returns whether the bytes are complete; an incomplete record is
  /// discarded instead of committed.
  ///
  /// Returns `false` when the record was dropped.
  pub fn write(&mut self, size: usize, options: &FrontendOptions, write: impl FnOnce(&mut [u8]) -> bool) -> bool {
    let queue_type = self.context.queue_type;
    let backoff = Backoff::new();
    let mut blocked = false;

    loop {
      match self.producer.try_reserve(size) {
        Ok(Some(mut handle)) => {
          if write(&mut handle) {
            handle.commit();
            return true;
          }
          self.context.record_failure();
          return false;
        },
        Ok(None) if queue_type.is_blocking() => {
          if !blocked {
            blocked = true;
            self.context.record_failure();
          }
          if options.blocking_queue_retry_interval.is_zero() {
            backoff.snooze();
          } else {
            std::thread::sleep(options.blocking_queue_retry_interval);
          }
        },
        Ok(None) => {
          self.context.record_failure();
          return false;
        },
        Err(err) => {
          tracing::warn!(
            target: "tachylog",
            thread_id = self.context.thread_id,
            size,
            "dropping record: {}",
            err
          );
          self.context.record_failure();
          return false;
        },
      }
    }
  }
}

impl Drop for LocalContext {
  fn drop(&mut self) {
    self.context.invalidate();
  }
}

thread_local! {
  static LOCAL_CONTEXTS: RefCell<SmallVec<[LocalContext; 2]>> = RefCell::new(SmallVec::new());
}

/// Runs `f` with this thread's context for the given engine, creating and
/// registering it on first use.
///
/// Returns `None` when the context cannot be created, when called re-entrantly
/// from inside `f`, or while the thread is shutting down.
#[inline]
pub fn with_local_context<R>(
  engine_id: u64,
  manager: &Arc<ThreadContextManager>,
  options: &FrontendOptions,
  f: impl FnOnce(&mut LocalContext) -> R,
) -> Option<R> {
  LOCAL_CONTEXTS
    .try_with(|slots| {
      let mut slots = slots.try_borrow_mut().ok()?;

      if let Some(local) = slots.iter_mut().find(|local| local.engine_id == engine_id) {
        return Some(f(local));
      }

      // Contexts of engines that are gone only hold dead queues
      slots.retain(|local| local.manager.strong_count() > 0);

      match LocalContext::new(engine_id, manager, options) {
        Ok(local) => {
          slots.push(local);
          slots.last_mut().map(f)
        },
        Err(err) => {
          tracing::warn!(target: "tachylog", "cannot create a frontend queue: {}", err);
          None
        },
      }
    })
    .ok()
    .flatten()
}

/// Drops this thread's context for `engine_id`, marking it invalid for the backend.
pub fn release_local_context(engine_id: u64) {
  let _ = LOCAL_CONTEXTS.try_with(|slots| {
    if let Ok(mut slots) = slots.try_borrow_mut() {
      slots.retain(|local| local.engine_id != engine_id);
    }
  });
}
