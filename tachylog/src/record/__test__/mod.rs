#[cfg(test)]
mod tests {
  use crate::codec::{Decoder, Encoder};
  use crate::level::LogLevel;
  use crate::record::{EventKind, Metadata, RecordHeader, HEADER_SIZE};

  #[test]
  fn test_header_layout() {
    let header = RecordHeader {
      timestamp: 0x0102_0304_0506_0708,
      kind: EventKind::Flush,
      metadata_ref: 11,
      logger_ref: 22,
      format_ref: 33,
    };

    let mut buf = [0u8; HEADER_SIZE];
    let mut encoder = Encoder::new(&mut buf);
    header.encode(&mut encoder);
    assert!(encoder.is_exact());

    assert_eq!(&buf[..8], &header.timestamp.to_ne_bytes());
    assert_eq!(buf[8], 3);
    assert_eq!(&buf[9..13], &11u32.to_ne_bytes());
    assert_eq!(RecordHeader::peek_timestamp(&buf), Some(header.timestamp));

    let mut decoder = Decoder::new(&buf);
    assert_eq!(RecordHeader::decode(&mut decoder).unwrap(), header);
    assert_eq!(decoder.remaining(), 0);
  }

  #[test]
  fn test_unknown_kind_is_rejected() {
    let mut buf = [0u8; HEADER_SIZE];
    buf[8] = 9;
    assert!(RecordHeader::decode(&mut Decoder::new(&buf)).is_err());
    assert!(EventKind::from_u8(9).is_err());
  }

  #[test]
  fn test_peek_needs_eight_bytes() {
    assert_eq!(RecordHeader::peek_timestamp(&[1, 2, 3]), None);
  }

  static SITE_A: Metadata = Metadata::new("a {}", "src/net/conn.rs", 10, "app::net", LogLevel::Info);
  static SITE_B: Metadata = Metadata::new("b", "C:\\app\\main.rs", 20, "app", LogLevel::Error);

  #[test]
  fn test_metadata_ids_are_stable_and_distinct() {
    let a = SITE_A.id();
    let b = SITE_B.id();
    assert_ne!(a, 0);
    assert_ne!(b, 0);
    assert_ne!(a, b);
    assert_eq!(SITE_A.id(), a);
  }

  #[test]
  fn test_metadata_location() {
    assert_eq!(SITE_A.location(), "src/net/conn.rs:10");
    assert_eq!(SITE_A.short_file(), "conn.rs");
    assert_eq!(SITE_B.short_file(), "main.rs");
  }
}
