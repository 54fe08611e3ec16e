#[cfg(test)]
mod tests {
  use crate::error::Error;
  use crate::options::{BackendOptions, FrontendOptions, QueueType};
  use std::io::Write;
  use std::time::Duration;

  #[test]
  fn test_backend_defaults() {
    let options = BackendOptions::default();
    assert_eq!(options.sleep_duration, Duration::from_nanos(500));
    assert_eq!(options.transit_event_buffer_initial_capacity, 64);
    assert_eq!(options.transit_events_soft_limit, 1024);
    assert_eq!(options.transit_events_hard_limit, 131_072);
    assert_eq!(options.log_timestamp_ordering_grace_period, Duration::from_micros(1));
    assert!(options.wait_for_queues_to_empty_before_exit);
    assert_eq!(options.cpu_affinity, None);
    assert_eq!(options.log_level_descriptions[4], "INFO");
    assert_eq!(options.log_level_short_codes[6], "W");
    assert!(options.check_printable_char.is_some());
  }

  #[test]
  fn test_frontend_defaults() {
    let options = FrontendOptions::default();
    assert_eq!(options.queue_type, QueueType::UnboundedBlocking);
    assert_eq!(options.initial_queue_capacity, 131_072);
    assert!(options.validate().is_ok());
    assert_eq!(options.max_capacity(), Some(2 * 1024 * 1024 * 1024));

    let unlimited = FrontendOptions {
      queue_type: QueueType::UnboundedUnlimited,
      ..FrontendOptions::default()
    };
    assert_eq!(unlimited.max_capacity(), None);
  }

  #[test]
  fn test_queue_type_predicates() {
    assert!(QueueType::BoundedDropping.is_bounded());
    assert!(QueueType::BoundedDropping.is_dropping());
    assert!(!QueueType::UnboundedUnlimited.is_blocking());
    assert!(!QueueType::UnboundedUnlimited.is_dropping());
    assert!(QueueType::UnboundedBlocking.is_blocking());
  }

  #[test]
  fn test_zero_limits_become_one() {
    let mut options = BackendOptions {
      transit_events_soft_limit: 0,
      transit_events_hard_limit: 0,
      ..BackendOptions::default()
    };
    options.validate().unwrap();
    assert_eq!(options.transit_events_soft_limit, 1);
    assert_eq!(options.transit_events_hard_limit, 1);
  }

  #[test]
  fn test_invalid_backend_limits() {
    let mut soft_above_hard = BackendOptions {
      transit_events_soft_limit: 4096,
      transit_events_hard_limit: 1024,
      ..BackendOptions::default()
    };
    assert!(matches!(soft_above_hard.validate(), Err(Error::Configuration(_))));

    let mut not_power_of_two = BackendOptions {
      transit_events_hard_limit: 100_000,
      ..BackendOptions::default()
    };
    assert!(matches!(not_power_of_two.validate(), Err(Error::Configuration(_))));

    let mut bad_capacity = BackendOptions {
      transit_event_buffer_initial_capacity: 3,
      ..BackendOptions::default()
    };
    assert!(bad_capacity.validate().is_err());
  }

  #[test]
  fn test_invalid_frontend_capacity() {
    let options = FrontendOptions {
      initial_queue_capacity: 1000,
      ..FrontendOptions::default()
    };
    assert!(matches!(options.validate(), Err(Error::Configuration(msg)) if msg.contains("initial_queue_capacity")));

    let options = FrontendOptions {
      initial_queue_capacity: 4096,
      unbounded_queue_max_capacity: 2048,
      ..FrontendOptions::default()
    };
    assert!(options.validate().is_err());
  }

  #[test]
  fn test_json_partial_options() {
    let options = FrontendOptions::from_json(
      r#"{ "queue_type": "BoundedDropping", "initial_queue_capacity": 4096, "blocking_queue_retry_interval": 2000 }"#,
    )
    .unwrap();
    assert_eq!(options.queue_type, QueueType::BoundedDropping);
    assert_eq!(options.initial_queue_capacity, 4096);
    assert_eq!(options.blocking_queue_retry_interval, Duration::from_nanos(2000));
    assert!(!options.huge_pages);

    let backend = BackendOptions::from_json(r#"{ "sleep_duration": 1000000, "transit_events_soft_limit": 0 }"#).unwrap();
    assert_eq!(backend.sleep_duration, Duration::from_millis(1));
    assert_eq!(backend.transit_events_soft_limit, 1);
  }

  #[test]
  fn test_json_errors() {
    assert!(matches!(
      BackendOptions::from_json("{ not json"),
      Err(Error::Configuration(_))
    ));
    assert!(FrontendOptions::from_json(r#"{ "initial_queue_capacity": 12 }"#).is_err());
  }

  #[test]
  fn test_json_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "thread_name": "from-file", "enable_yield_when_idle": true }}"#).unwrap();

    let options = BackendOptions::from_json_file(file.path()).unwrap();
    assert_eq!(options.thread_name, "from-file");
    assert!(options.enable_yield_when_idle);

    assert!(BackendOptions::from_json_file("/definitely/not/here.json").is_err());
  }

  #[test]
  fn test_serialized_options_round_trip_through_json() {
    let options = BackendOptions {
      cpu_affinity: Some(3),
      ..BackendOptions::default()
    };
    let json = serde_json::to_string(&options).unwrap();
    let back = BackendOptions::from_json(&json).unwrap();
    assert_eq!(back.cpu_affinity, Some(3));
    assert_eq!(back.sink_min_flush_interval, options.sink_min_flush_interval);
  }
}
