#[cfg(test)]
mod tests {
  use crate::error::Error;

  #[test]
  fn test_display_messages() {
    let err = Error::allocation(4096, "mmap failed");
    assert_eq!(
      err.to_string(),
      "failed to allocate 4096 bytes of queue storage: mmap failed"
    );
    assert_eq!(Error::QueueFull.to_string(), "queue is full");
    assert_eq!(
      Error::config("capacity 1000 is not a power of two").to_string(),
      "invalid configuration: capacity 1000 is not a power of two"
    );
    assert_eq!(Error::decode("truncated").to_string(), "truncated");
  }

  #[test]
  fn test_from_fmt_error() {
    let err: Error = std::fmt::Error.into();
    assert!(matches!(err, Error::DecodeFormat(_)));
  }
}
