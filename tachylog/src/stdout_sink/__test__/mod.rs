#[cfg(test)]
mod tests {
  use crate::level::LogLevel;
  use crate::record::Metadata;
  use crate::sink::LogRecord;
  use crate::stdout_sink::{format_timestamp, StdoutSink};

  static SITE: Metadata = Metadata::new("order {id} done", "src/app/orders.rs", 42, "app::orders", LogLevel::Info);

  fn record<'a>(message: &'a str, named_args: &'a [(String, String)]) -> LogRecord<'a> {
    LogRecord {
      metadata: &SITE,
      timestamp: 1_700_000_000_123_456_789,
      thread_id: 77,
      thread_name: "worker",
      process_id: 1,
      logger_name: "root",
      level: LogLevel::Info,
      level_description: "INFO",
      level_short_code: "I",
      named_args,
      message,
    }
  }

  #[test]
  fn test_timestamp_format() {
    assert_eq!(format_timestamp(0), "1970-01-01T00:00:00.000000000Z");
    assert_eq!(
      format_timestamp(1_700_000_000_123_456_789),
      "2023-11-14T22:13:20.123456789Z"
    );
  }

  #[test]
  fn test_text_line() {
    let sink = StdoutSink::text();
    let mut out = String::new();
    sink.format_into(&record("order 5 done\n", &[]), &mut out);

    assert!(out.starts_with("2023-11-14T22:13:20.123456789Z [77] orders.rs:42"));
    assert!(out.ends_with("INFO      root         order 5 done\n"));
    assert_eq!(out.matches('\n').count(), 1, "trailing newline of the message is dropped");
  }

  #[test]
  fn test_json_line() {
    let sink = StdoutSink::json();
    let named = vec![("id".to_string(), "5".to_string())];
    let mut out = String::new();
    sink.format_into(&record("order 5 done", &named), &mut out);

    assert!(out.ends_with('\n'));
    let value: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
    assert_eq!(value["message"], "order 5 done");
    assert_eq!(value["log_level"], "INFO");
    assert_eq!(value["thread_id"], 77);
    assert_eq!(value["line"], 42);
    assert_eq!(value["file_name"], "orders.rs");
    assert_eq!(value["id"], "5");
  }

  #[test]
  fn test_named_args_do_not_override_builtin_fields() {
    let sink = StdoutSink::json();
    let named = vec![("message".to_string(), "spoofed".to_string())];
    let mut out = String::new();
    sink.format_into(&record("real", &named), &mut out);

    let value: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
    assert_eq!(value["message"], "real");
  }
}
