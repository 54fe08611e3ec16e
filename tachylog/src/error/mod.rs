mod __test__;

/// Every failure the engine can surface.
///
/// Only setup paths return these. The frontend hot path reports failure as a
/// plain `bool` and the backend routes per-record errors to the error notifier.
#[derive(thiserror::Error, Debug)]
pub enum Error {
  /// Ring storage or a new unbounded segment could not be created.
  #[error("failed to allocate {size} bytes of queue storage: {reason}")]
  AllocationFailure { size: usize, reason: String },

  /// A bounded queue had no room for the record.
  #[error("queue is full")]
  QueueFull,

  /// A record could not be decoded or its message could not be formatted.
  #[error("{0}")]
  DecodeFormat(String),

  /// Invalid capacity, size or backend thread setting.
  #[error("invalid configuration: {0}")]
  Configuration(String),
}

impl Error {
  pub(crate) fn allocation(size: usize, reason: impl Into<String>) -> Self {
    Error::AllocationFailure {
      size,
      reason: reason.into(),
    }
  }

  pub(crate) fn decode(reason: impl Into<String>) -> Self {
    Error::DecodeFormat(reason.into())
  }

  pub(crate) fn config(reason: impl Into<String>) -> Self {
    Error::Configuration(reason.into())
  }
}

impl From<std::fmt::Error> for Error {
  fn from(_: std::fmt::Error) -> Self {
    Error::DecodeFormat("an argument failed to format".to_string())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
