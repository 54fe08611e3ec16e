#[cfg(test)]
mod tests {
  use crate::backend::{BackendState, BackendWorker, RunningGuard};
  use crate::clock::ClockSource;
  use crate::level::LogLevel;
  use crate::logger::{Frontend, Logger, LoggerRegistry};
  use crate::options::{BackendOptions, FrontendOptions, QueueType};
  use crate::codec::Encoder;
  use crate::record::{EventKind, Metadata, RecordHeader, HEADER_SIZE};
  use crate::thread_context::ThreadContext;
  use crate::sink::{ChannelSink, LogRecord, OwnedRecord, Sink};
  use crate::utils::current_thread_id;
  use crossbeam_channel::{unbounded, Receiver, Sender};
  use std::fmt;
  use std::panic::{catch_unwind, AssertUnwindSafe};
  use std::sync::{Arc, Mutex};
  use std::thread;

  static MSG: Metadata = Metadata::new("msg {}", "backend.rs", 1, "backend", LogLevel::Info);
  static NAMED: Metadata = Metadata::new("order {id} at {px:.1}", "backend.rs", 2, "backend", LogLevel::Info);
  static BROKEN: Metadata = Metadata::new("{} and {}", "backend.rs", 3, "backend", LogLevel::Info);
  static TRACE: Metadata = Metadata::new("step {}", "backend.rs", 4, "backend", LogLevel::Backtrace);
  static FAILED: Metadata = Metadata::new("failed {}", "backend.rs", 5, "backend", LogLevel::Error);
  static DYNAMIC: Metadata = Metadata::new("dyn {}", "backend.rs", 6, "backend", LogLevel::Dynamic);
  static TEXT: Metadata = Metadata::new("{}", "backend.rs", 7, "backend", LogLevel::Info);

  struct Harness {
    frontend: Arc<Frontend>,
    registry: Arc<LoggerRegistry>,
    worker: BackendWorker,
    notes: Arc<Mutex<Vec<String>>>,
    sender: Sender<OwnedRecord>,
    records: Receiver<OwnedRecord>,
  }

  impl Harness {
    fn new(frontend_options: FrontendOptions, configure: impl FnOnce(&mut BackendOptions)) -> Self {
      let notes = Arc::new(Mutex::new(Vec::new()));
      let notifier_notes = Arc::clone(&notes);
      let mut options = BackendOptions {
        error_notifier: Arc::new(move |message: &str| notifier_notes.lock().unwrap().push(message.to_string())),
        ..BackendOptions::default()
      };
      configure(&mut options);
      options.validate().unwrap();

      let (wakeup_tx, wakeup_rx) = crossbeam_channel::bounded(1);
      let frontend = Arc::new(Frontend::new(frontend_options, wakeup_tx));
      let registry = Arc::new(LoggerRegistry::new());
      let worker = BackendWorker::new(
        options,
        Arc::clone(&frontend),
        Arc::clone(&registry),
        wakeup_rx,
        Vec::new(),
      );
      let (sender, records) = unbounded();

      Self {
        frontend,
        registry,
        worker,
        notes,
        sender,
        records,
      }
    }

    fn logger_with(&self, name: &str, clock: ClockSource, sinks: Vec<Arc<dyn Sink>>) -> Arc<Logger> {
      self
        .registry
        .create_or_get(name, |id| Logger::new(name.to_string(), id, sinks, clock, Arc::clone(&self.frontend)))
    }

    fn logger(&self, name: &str, clock: ClockSource) -> Arc<Logger> {
      let sink: Arc<dyn Sink> = Arc::new(ChannelSink::new(self.sender.clone()));
      self.logger_with(name, clock, vec![sink])
    }

    /// Polls until the backend goes idle.
    fn run(&mut self, now: u64) {
      while self.worker.poll_at(now) {}
    }

    fn messages(&self) -> Vec<String> {
      self.records.try_iter().map(|r| r.message).collect()
    }

    fn notes(&self) -> Vec<String> {
      self.notes.lock().unwrap().clone()
    }
  }

  /// Writes the same record `Logger::flush` enqueues, without waiting for it.
  fn write_flush(h: &Harness, logger: &Logger, timestamp: u64) -> (Arc<ThreadContext>, u64) {
    crate::thread_context::with_local_context(
      h.frontend.engine_id,
      &h.frontend.manager,
      &h.frontend.options,
      |local| {
        let sequence = local.next_flush_sequence();
        let header = RecordHeader {
          timestamp,
          kind: EventKind::Flush,
          metadata_ref: 0,
          logger_ref: logger.id(),
          format_ref: 0,
        };
        assert!(local.write(HEADER_SIZE + 8, &h.frontend.options, |buf| {
          let mut encoder = Encoder::new(buf);
          header.encode(&mut encoder);
          encoder.put_u64(sequence);
          encoder.is_exact()
        }));
        (Arc::clone(local.context()), sequence)
      },
    )
    .unwrap()
  }

  fn log_on_thread(logger: &Arc<Logger>, name: &str, timestamps: &'static [u64]) {
    let logger = Arc::clone(logger);
    thread::Builder::new()
      .name(name.to_string())
      .spawn(move || {
        for &ts in timestamps {
          assert!(logger.log_at(ts, &MSG, (&ts,)));
        }
      })
      .unwrap()
      .join()
      .unwrap();
  }

  #[test]
  fn test_dispatch_merges_threads_by_timestamp() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let logger = h.logger("merge", ClockSource::User);

    log_on_thread(&logger, "a", &[10, 30, 50]);
    log_on_thread(&logger, "b", &[20, 40]);

    h.run(u64::MAX);
    let records: Vec<OwnedRecord> = h.records.try_iter().collect();
    let messages: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(messages, vec!["msg 10", "msg 20", "msg 30", "msg 40", "msg 50"]);

    let threads: Vec<&str> = records.iter().map(|r| r.thread_name.as_str()).collect();
    assert_eq!(threads, vec!["a", "b", "a", "b", "a"]);
  }

  #[test]
  fn test_equal_timestamps_follow_registration_order() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let logger = h.logger("ties", ClockSource::User);

    log_on_thread(&logger, "first", &[100]);
    log_on_thread(&logger, "second", &[100]);

    h.run(u64::MAX);
    let threads: Vec<String> = h.records.try_iter().map(|r| r.thread_name).collect();
    assert_eq!(threads, vec!["first", "second"]);
  }

  #[test]
  fn test_grace_period_holds_back_recent_records() {
    let mut h = Harness::new(FrontendOptions::default(), |options| {
      options.log_timestamp_ordering_grace_period = std::time::Duration::from_nanos(1000);
    });
    let logger = h.logger("grace", ClockSource::System);

    assert!(logger.log_at(1000, &MSG, (&1u32,)));
    assert!(logger.log_at(5000, &MSG, (&2u32,)));

    // cutoff = 1500
    h.run(2500);
    assert_eq!(h.messages(), vec!["msg 1"]);

    h.run(2500);
    assert!(h.messages().is_empty());

    h.run(10_000);
    assert_eq!(h.messages(), vec!["msg 2"]);
  }

  #[test]
  fn test_user_clock_ignores_grace_period() {
    let mut h = Harness::new(FrontendOptions::default(), |options| {
      options.log_timestamp_ordering_grace_period = std::time::Duration::from_secs(1);
    });
    let logger = h.logger("user", ClockSource::User);

    assert!(logger.log_at(u64::MAX - 1, &MSG, (&7u32,)));
    h.run(0);
    assert_eq!(h.messages(), vec!["msg 7"]);
  }

  #[test]
  fn test_named_args_reach_sinks() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let logger = h.logger("named", ClockSource::System);

    assert!(logger.log(&NAMED, (&42u64, &99.26f64)));
    h.run(u64::MAX);

    let record = h.records.try_recv().unwrap();
    assert_eq!(record.message, "order 42 at 99.3");
    assert_eq!(
      record.named_args,
      vec![("id".to_string(), "42".to_string()), ("px".to_string(), "99.3".to_string())]
    );
  }

  #[test]
  fn test_format_failure_is_isolated() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let logger = h.logger("broken", ClockSource::System);

    assert!(logger.log(&BROKEN, (&1u32,)));
    assert!(logger.log(&MSG, (&2u32,)));
    h.run(u64::MAX);

    let messages = h.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].starts_with(
      "[Could not format log statement. message: \"{} and {}\", location: \"backend.rs:3\", error: "
    ));
    assert_eq!(messages[1], "msg 2");

    let notes = h.notes();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0], messages[0]);
  }

  struct PanickingSink;

  impl Sink for PanickingSink {
    fn write_log(&self, record: &LogRecord<'_>) {
      if record.message.contains("boom") {
        panic!("sink failure");
      }
    }
  }

  #[test]
  fn test_sink_panic_is_isolated() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let panicking: Arc<dyn Sink> = Arc::new(PanickingSink);
    let collecting: Arc<dyn Sink> = Arc::new(ChannelSink::new(h.sender.clone()));
    let logger = h.logger_with("panicky", ClockSource::System, vec![panicking, collecting]);

    assert!(logger.log(&TEXT, (&"boom",)));
    assert!(logger.log(&TEXT, (&"fine",)));
    h.run(u64::MAX);

    // The sink after the panicking one still sees both records
    assert_eq!(h.messages(), vec!["boom", "fine"]);
    let notes = h.notes();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("panicked"));
  }

  #[test]
  fn test_backtrace_is_emitted_after_triggering_record() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let logger = h.logger("bt", ClockSource::User);

    assert!(logger.init_backtrace(2, LogLevel::Error));
    h.run(u64::MAX);

    let mut ts = 1u64;
    for step in 1..=3u32 {
      assert!(logger.log_at(ts, &TRACE, (&step,)));
      ts += 1;
    }
    assert!(logger.log_at(ts, &MSG, (&0u32,)));
    h.run(u64::MAX);
    assert_eq!(h.messages(), vec!["msg 0"]);

    assert!(logger.log_at(ts + 1, &FAILED, (&"io",)));
    h.run(u64::MAX);

    let records: Vec<OwnedRecord> = h.records.try_iter().collect();
    let messages: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(messages, vec!["failed io", "step 2", "step 3"]);
    assert_eq!(records[1].level, LogLevel::Backtrace);
  }

  #[test]
  fn test_flush_backtrace_on_request() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let logger = h.logger("bt-flush", ClockSource::System);

    assert!(logger.init_backtrace(8, LogLevel::Critical));
    assert!(logger.log(&TRACE, (&1u32,)));
    assert!(logger.flush_backtrace());
    h.run(u64::MAX);
    assert_eq!(h.messages(), vec!["step 1"]);

    // Emitted records are gone from the ring
    assert!(logger.flush_backtrace());
    h.run(u64::MAX);
    assert!(h.messages().is_empty());
  }

  #[test]
  fn test_backtrace_records_without_storage_are_discarded() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let logger = h.logger("no-bt", ClockSource::System);

    assert!(logger.log(&TRACE, (&1u32,)));
    h.run(u64::MAX);
    assert!(h.messages().is_empty());
  }

  #[test]
  fn test_dynamic_level_is_applied() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let logger = h.logger("dyn", ClockSource::System);

    assert!(logger.log_dynamic(LogLevel::Warning, &DYNAMIC, (&5u8,)));
    h.run(u64::MAX);

    let record = h.records.try_recv().unwrap();
    assert_eq!(record.level, LogLevel::Warning);
    assert_eq!(record.message, "dyn 5");
  }

  #[test]
  fn test_dropped_records_are_reported() {
    let options = FrontendOptions {
      queue_type: QueueType::BoundedDropping,
      initial_queue_capacity: 1024,
      ..FrontendOptions::default()
    };
    let mut h = Harness::new(options, |_| {});
    let logger = h.logger("drops", ClockSource::System);

    let big = "x".repeat(2000);
    assert!(!logger.log(&TEXT, (&big,)));
    h.run(u64::MAX);

    assert_eq!(
      h.notes(),
      vec![format!("Dropped 1 log messages from thread {}", current_thread_id())]
    );
  }

  #[test]
  fn test_queue_growth_is_reported() {
    let options = FrontendOptions {
      queue_type: QueueType::UnboundedUnlimited,
      initial_queue_capacity: 1024,
      ..FrontendOptions::default()
    };
    let mut h = Harness::new(options, |_| {});
    let logger = h.logger("growth", ClockSource::System);

    let big = "y".repeat(1500);
    assert!(logger.log(&TEXT, (&big,)));
    h.run(u64::MAX);

    assert_eq!(h.messages(), vec![big]);
    assert_eq!(
      h.notes(),
      vec![format!(
        "Allocated a new SPSC queue with a capacity of 2 KiB (previously 1 KiB) from thread {}",
        current_thread_id()
      )]
    );
  }

  #[test]
  fn test_flush_record_acknowledges_after_prior_records() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let (flush_tx, flush_rx) = unbounded();
    let sink: Arc<dyn Sink> = Arc::new(ChannelSink::new(h.sender.clone()).with_flush_signal(flush_tx));
    let logger = h.logger_with("flush", ClockSource::System, vec![sink]);

    assert!(logger.log(&MSG, (&1u32,)));
    let (context, sequence) = write_flush(&h, &logger, crate::clock::now_ns());

    assert_eq!(context.flush_ack(), 0);
    h.run(u64::MAX);

    assert_eq!(context.flush_ack(), sequence);
    assert_eq!(h.messages(), vec!["msg 1"]);
    assert!(flush_rx.try_recv().is_ok());
  }

  #[test]
  fn test_finished_threads_are_removed() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let logger = h.logger("exit", ClockSource::User);

    log_on_thread(&logger, "worker", &[1, 2]);
    assert!(h.worker.poll_at(u64::MAX));
    assert_eq!(h.worker.thread_count(), 1);

    h.run(u64::MAX);
    assert_eq!(h.messages().len(), 2);
    assert_eq!(h.worker.thread_count(), 0);
    assert_eq!(h.worker.state(), BackendState::Idle);
  }

  #[test]
  fn test_removed_logger_is_dropped_after_drain() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let (flush_tx, flush_rx) = unbounded();
    let sink: Arc<dyn Sink> = Arc::new(ChannelSink::new(h.sender.clone()).with_flush_signal(flush_tx));
    let logger = h.logger_with("gone", ClockSource::System, vec![sink]);

    assert!(logger.log(&MSG, (&1u32,)));
    logger.invalidate();
    h.run(u64::MAX);

    // The record logged before removal is still delivered
    assert_eq!(h.messages(), vec!["msg 1"]);
    assert!(h.registry.is_empty());
    assert!(flush_rx.try_recv().is_ok());
  }

  #[test]
  fn test_two_threads_keep_per_thread_order() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let logger = h.logger("pairs", ClockSource::System);

    let handles: Vec<_> = (0..2)
      .map(|t| {
        let logger = Arc::clone(&logger);
        thread::Builder::new()
          .name(format!("producer-{}", t))
          .spawn(move || {
            for i in 0..1000u32 {
              assert!(logger.log(&MSG, (&i,)));
            }
          })
          .unwrap()
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    h.run(u64::MAX);
    let records: Vec<OwnedRecord> = h.records.try_iter().collect();
    assert_eq!(records.len(), 2000);

    for t in 0..2 {
      let name = format!("producer-{}", t);
      let seen: Vec<String> = records
        .iter()
        .filter(|r| r.thread_name == name)
        .map(|r| r.message.clone())
        .collect();
      let expected: Vec<String> = (0..1000).map(|i| format!("msg {}", i)).collect();
      assert_eq!(seen, expected);
    }

    let timestamps: Vec<u64> = records.iter().map(|r| r.timestamp).collect();
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
  }

  #[derive(crate::Codec)]
  struct Volatile(u32);

  impl fmt::Display for Volatile {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
      panic!("volatile value {}", self.0)
    }
  }

  #[test]
  fn test_panicking_argument_is_isolated() {
    let mut h = Harness::new(FrontendOptions::default(), |_| {});
    let logger = h.logger("volatile", ClockSource::System);

    assert!(logger.log(&TEXT, (&Volatile(1),)));
    assert!(logger.log(&MSG, (&2u32,)));

    let polled = catch_unwind(AssertUnwindSafe(|| h.run(u64::MAX)));
    assert!(polled.is_ok());

    let messages = h.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].starts_with(
      "[Could not format log statement. message: \"{}\", location: \"backend.rs:7\", error: "
    ));
    assert!(messages[0].contains("volatile value 1"));
    assert_eq!(messages[1], "msg 2");

    let notes = h.notes();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0], messages[0]);
  }

  #[test]
  fn test_unwinding_worker_clears_running_flag() {
    let (wakeup_tx, _wakeup_rx) = crossbeam_channel::bounded(1);
    let frontend = Arc::new(Frontend::new(FrontendOptions::default(), wakeup_tx));
    frontend.backend_running.store(true, std::sync::atomic::Ordering::Release);

    let guarded = Arc::clone(&frontend);
    let joined = thread::spawn(move || {
      let _running = RunningGuard(guarded);
      panic!("worker failure");
    })
    .join();

    assert!(joined.is_err());
    assert!(!frontend.is_backend_running());
  }

  #[test]
  fn test_running_flag_survives_normal_exit() {
    let (wakeup_tx, _wakeup_rx) = crossbeam_channel::bounded(1);
    let frontend = Arc::new(Frontend::new(FrontendOptions::default(), wakeup_tx));
    frontend.backend_running.store(true, std::sync::atomic::Ordering::Release);

    drop(RunningGuard(Arc::clone(&frontend)));
    assert!(frontend.is_backend_running());
  }

  /// Records everything a sink sees, flushes included, in one sequence.
  struct Journal(Mutex<Vec<String>>);

  impl Sink for Journal {
    fn write_log(&self, record: &LogRecord<'_>) {
      self.0.lock().unwrap().push(record.message.to_string());
    }

    fn flush(&self) {
      self.0.lock().unwrap().push("<flush>".to_string());
    }
  }

  #[test]
  fn test_flush_drains_unread_records_of_other_threads() {
    let mut h = Harness::new(FrontendOptions::default(), |options| {
      options.transit_events_soft_limit = 1;
      options.transit_events_hard_limit = 2;
      options.sink_min_flush_interval = std::time::Duration::from_secs(3600);
    });
    let journal = Arc::new(Journal(Mutex::new(Vec::new())));
    let sink: Arc<dyn Sink> = journal.clone();
    let logger = h.logger_with("journal", ClockSource::User, vec![sink]);

    // Only two of these fit the transit buffer per poll
    log_on_thread(&logger, "busy", &[10, 20, 25]);
    let (context, sequence) = write_flush(&h, &logger, 30);

    h.run(u64::MAX);

    assert_eq!(context.flush_ack(), sequence);
    let seen = journal.0.lock().unwrap().clone();
    assert_eq!(seen, vec!["msg 10", "msg 20", "msg 25", "<flush>"]);
  }
}
