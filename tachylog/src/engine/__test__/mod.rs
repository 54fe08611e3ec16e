#[cfg(test)]
mod tests {
  use crate::clock::now_ns;
  use crate::engine::Engine;
  use crate::error::Error;
  use crate::level::LogLevel;
  use crate::options::{BackendOptions, FrontendOptions, QueueType};
  use crate::record::Metadata;
  use crate::sink::{ChannelSink, OwnedRecord, Sink};
  use crossbeam_channel::{unbounded, Receiver};
  use std::sync::{Arc, Mutex};
  use std::thread;
  use std::time::Duration;

  static MSG: Metadata = Metadata::new("msg {}", "engine.rs", 1, "engine", LogLevel::Info);

  fn channel_sink() -> (Arc<dyn Sink>, Receiver<OwnedRecord>) {
    let (tx, rx) = unbounded();
    (Arc::new(ChannelSink::new(tx)), rx)
  }

  fn quiet_options(notes: &Arc<Mutex<Vec<String>>>) -> BackendOptions {
    let notes = Arc::clone(notes);
    BackendOptions {
      error_notifier: Arc::new(move |message: &str| notes.lock().unwrap().push(message.to_string())),
      ..BackendOptions::default()
    }
  }

  #[test]
  fn test_start_and_stop_backend() {
    let engine = Engine::new(FrontendOptions::default()).unwrap();
    assert!(!engine.is_backend_running());

    engine.start_backend(BackendOptions::default()).unwrap();
    assert!(engine.is_backend_running());
    assert!(matches!(
      engine.start_backend(BackendOptions::default()),
      Err(Error::Configuration(_))
    ));

    engine.stop_backend();
    assert!(!engine.is_backend_running());
    engine.stop_backend();
  }

  #[test]
  fn test_invalid_options_are_rejected() {
    let frontend = FrontendOptions {
      initial_queue_capacity: 1000,
      ..FrontendOptions::default()
    };
    assert!(matches!(Engine::new(frontend), Err(Error::Configuration(_))));

    let engine = Engine::new(FrontendOptions::default()).unwrap();
    let backend = BackendOptions {
      transit_events_soft_limit: 4096,
      transit_events_hard_limit: 1024,
      ..BackendOptions::default()
    };
    assert!(matches!(engine.start_backend(backend), Err(Error::Configuration(_))));
    assert!(!engine.is_backend_running());
  }

  #[test]
  fn test_flush_waits_for_prior_records() {
    let engine = Engine::new(FrontendOptions::default()).unwrap();
    engine.start_backend(BackendOptions::default()).unwrap();
    let (sink, records) = channel_sink();
    let logger = engine.create_or_get_logger("flushing", vec![sink]);

    for i in 0..100u32 {
      assert!(logger.log(&MSG, (&i,)));
    }
    assert!(logger.flush());

    let messages: Vec<String> = records.try_iter().map(|r| r.message).collect();
    let expected: Vec<String> = (0..100).map(|i| format!("msg {}", i)).collect();
    assert_eq!(messages, expected);
  }

  #[test]
  fn test_tsc_timestamps_are_wall_clock() {
    let engine = Engine::new(FrontendOptions::default()).unwrap();
    engine.start_backend(BackendOptions::default()).unwrap();
    let (sink, records) = channel_sink();
    let logger = engine.create_or_get_logger("tsc", vec![sink]);

    let before = now_ns();
    assert!(logger.log(&MSG, (&1u8,)));
    assert!(logger.flush());

    let record = records.try_recv().unwrap();
    let drift = record.timestamp.abs_diff(before);
    assert!(drift < Duration::from_secs(1).as_nanos() as u64, "drift {}ns", drift);
  }

  #[test]
  fn test_stop_drains_queues() {
    let engine = Engine::new(FrontendOptions::default()).unwrap();
    engine.start_backend(BackendOptions::default()).unwrap();
    let (sink, records) = channel_sink();
    let logger = engine.create_or_get_logger("drain", vec![sink]);

    for i in 0..500u32 {
      assert!(logger.log(&MSG, (&i,)));
    }
    engine.stop_backend();
    assert_eq!(records.try_iter().count(), 500);
  }

  #[test]
  fn test_restart_keeps_thread_queues() {
    let engine = Engine::new(FrontendOptions::default()).unwrap();
    let (sink, records) = channel_sink();
    let logger = engine.create_or_get_logger("restart", vec![sink]);

    engine.start_backend(BackendOptions::default()).unwrap();
    assert!(logger.log(&MSG, (&1u32,)));
    engine.stop_backend();

    assert!(logger.log(&MSG, (&2u32,)));
    engine.start_backend(BackendOptions::default()).unwrap();
    assert!(logger.flush());

    let messages: Vec<String> = records.try_iter().map(|r| r.message).collect();
    assert_eq!(messages, vec!["msg 1", "msg 2"]);
  }

  #[test]
  fn test_logger_lifecycle() {
    let engine = Engine::new(FrontendOptions::default()).unwrap();
    let (sink, _records) = channel_sink();

    let logger = engine.create_or_get_logger("lifecycle", vec![Arc::clone(&sink)]);
    let same = engine.create_or_get_logger("lifecycle", Vec::new());
    assert!(Arc::ptr_eq(&logger, &same));
    assert_eq!(same.sinks().len(), 1);
    assert_eq!(engine.loggers().len(), 1);

    engine.remove_logger(&logger);
    assert!(engine.get_logger("lifecycle").is_none());
    assert!(engine.loggers().is_empty());

    let replacement = engine.create_or_get_logger("lifecycle", vec![sink]);
    assert_ne!(replacement.id(), logger.id());
  }

  #[test]
  fn test_two_bounded_producers_lose_nothing() {
    let engine = Engine::new(FrontendOptions {
      queue_type: QueueType::BoundedBlocking,
      initial_queue_capacity: 4096,
      ..FrontendOptions::default()
    })
    .unwrap();
    engine
      .start_backend(BackendOptions {
        log_timestamp_ordering_grace_period: Duration::from_millis(1),
        ..BackendOptions::default()
      })
      .unwrap();

    let (sink, records) = channel_sink();
    let logger = engine.create_or_get_logger("pair", vec![sink]);

    let producers: Vec<_> = (0..2)
      .map(|t| {
        let logger = Arc::clone(&logger);
        thread::Builder::new()
          .name(format!("producer-{}", t))
          .spawn(move || {
            for i in 0..1000u32 {
              assert!(logger.log(&MSG, (&i,)));
            }
            assert!(logger.flush());
          })
          .unwrap()
      })
      .collect();
    for producer in producers {
      producer.join().unwrap();
    }

    let received: Vec<OwnedRecord> = records.try_iter().collect();
    assert_eq!(received.len(), 2000);
    for t in 0..2 {
      let name = format!("producer-{}", t);
      let seen: Vec<String> = received
        .iter()
        .filter(|r| r.thread_name == name)
        .map(|r| r.message.clone())
        .collect();
      let expected: Vec<String> = (0..1000).map(|i| format!("msg {}", i)).collect();
      assert_eq!(seen, expected);
    }
  }

  #[test]
  fn test_affinity_failure_degrades() {
    let notes = Arc::new(Mutex::new(Vec::new()));
    let engine = Engine::new(FrontendOptions::default()).unwrap();
    engine
      .start_backend(BackendOptions {
        cpu_affinity: Some(u16::MAX),
        ..quiet_options(&notes)
      })
      .unwrap();

    let (sink, records) = channel_sink();
    let logger = engine.create_or_get_logger("unpinned", vec![sink]);
    assert!(logger.log(&MSG, (&1u32,)));
    assert!(logger.flush());

    assert_eq!(records.try_iter().count(), 1);
    let notes = notes.lock().unwrap();
    assert!(notes.iter().any(|n| n.starts_with("Failed to set cpu affinity 65535")));
  }

  #[test]
  fn test_notify_wakes_a_sleeping_backend() {
    let engine = Engine::new(FrontendOptions::default()).unwrap();
    engine
      .start_backend(BackendOptions {
        sleep_duration: Duration::from_secs(3600),
        ..BackendOptions::default()
      })
      .unwrap();

    let (sink, records) = channel_sink();
    let logger = engine.create_or_get_logger("sleepy", vec![sink]);
    assert!(logger.log(&MSG, (&1u32,)));

    // `flush` notifies the backend itself
    assert!(logger.flush());
    assert_eq!(records.try_iter().count(), 1);
  }

  #[test]
  fn test_preallocate_registers_thread() {
    let engine = Engine::new(FrontendOptions::default()).unwrap();
    assert!(engine.preallocate());
    engine.release_thread();
  }
}
