//! # Logging Macros
//!
//! Each macro declares a `static` [`Metadata`](crate::Metadata) for its call
//! site and hands the arguments to the logger by reference, so only the raw
//! bytes of the arguments are copied on the hot path. Formatting happens on
//! the backend thread.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let logger = engine.create_or_get_logger("orders", vec![Arc::new(StdoutSink::text())]);
//!
//! tachylog::info!(logger, "order {id} filled at {px:.2}", order.id, order.price);
//! tachylog::log_dynamic!(logger, level_from_config, "config reloaded");
//! ```


/// Logs at an explicit, constant level.
#[macro_export]
macro_rules! log {
  ($logger:expr, $level:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
    static __TACHYLOG_METADATA: $crate::Metadata =
      $crate::Metadata::new($fmt, ::core::file!(), ::core::line!(), ::core::module_path!(), $level);
    $logger.log(&__TACHYLOG_METADATA, ($(&$arg,)*))
  }};
}

#[macro_export]
macro_rules! trace_l3 {
  ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
    $crate::log!($logger, $crate::LogLevel::TraceL3, $fmt $(, $arg)*)
  };
}

#[macro_export]
macro_rules! trace_l2 {
  ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
    $crate::log!($logger, $crate::LogLevel::TraceL2, $fmt $(, $arg)*)
  };
}

#[macro_export]
macro_rules! trace_l1 {
  ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
    $crate::log!($logger, $crate::LogLevel::TraceL1, $fmt $(, $arg)*)
  };
}

#[macro_export]
macro_rules! debug {
  ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
    $crate::log!($logger, $crate::LogLevel::Debug, $fmt $(, $arg)*)
  };
}

#[macro_export]
macro_rules! info {
  ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
    $crate::log!($logger, $crate::LogLevel::Info, $fmt $(, $arg)*)
  };
}

#[macro_export]
macro_rules! notice {
  ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
    $crate::log!($logger, $crate::LogLevel::Notice, $fmt $(, $arg)*)
  };
}

#[macro_export]
macro_rules! warn {
  ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
    $crate::log!($logger, $crate::LogLevel::Warning, $fmt $(, $arg)*)
  };
}

#[macro_export]
macro_rules! error {
  ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
    $crate::log!($logger, $crate::LogLevel::Error, $fmt $(, $arg)*)
  };
}

#[macro_export]
macro_rules! critical {
  ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
    $crate::log!($logger, $crate::LogLevel::Critical, $fmt $(, $arg)*)
  };
}

/// Stores the record in the logger's backtrace ring instead of emitting it.
/// Requires a prior `Logger::init_backtrace`, otherwise the record is dropped.
#[macro_export]
macro_rules! backtrace {
  ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
    $crate::log!($logger, $crate::LogLevel::Backtrace, $fmt $(, $arg)*)
  };
}

/// Logs at a level chosen at runtime.
#[macro_export]
macro_rules! log_dynamic {
  ($logger:expr, $level:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
    static __TACHYLOG_METADATA: $crate::Metadata = $crate::Metadata::new(
      $fmt,
      ::core::file!(),
      ::core::line!(),
      ::core::module_path!(),
      $crate::LogLevel::Dynamic,
    );
    $logger.log_dynamic($level, &__TACHYLOG_METADATA, ($(&$arg,)*))
  }};
}
