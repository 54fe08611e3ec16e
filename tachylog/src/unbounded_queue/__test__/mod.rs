#[cfg(test)]
mod tests {
  use crate::error::Error;
  use crate::unbounded_queue::{unbounded, QueueSwitch, UnboundedConsumer};
  use rand::Rng;
  use std::thread;

  fn fill(seq: u32, buf: &mut [u8]) {
    let len = (buf.len() - 8) as u32;
    buf[..4].copy_from_slice(&seq.to_ne_bytes());
    buf[4..8].copy_from_slice(&len.to_ne_bytes());
    for (i, byte) in buf[8..].iter_mut().enumerate() {
      *byte = (seq as usize + i) as u8;
    }
  }

  fn read(consumer: &mut UnboundedConsumer) -> Option<(u32, usize)> {
    let window = consumer.try_read()?;
    let seq = u32::from_ne_bytes(window[..4].try_into().unwrap());
    let len = u32::from_ne_bytes(window[4..8].try_into().unwrap()) as usize;
    for (i, byte) in window[8..8 + len].iter().enumerate() {
      assert_eq!(*byte, (seq as usize + i) as u8);
    }
    consumer.release(8 + len);
    Some((seq, len))
  }

  #[test]
  fn test_emplace_never_fails_when_unlimited() {
    let (mut producer, mut consumer) = unbounded(1024, None, false).unwrap();
    let mut rng = rand::rng();
    let mut sizes = Vec::new();

    // Nothing is read while writing, so the queue must keep growing
    for seq in 0..2000u32 {
      let len = rng.random_range(0..=512);
      assert!(producer.emplace(8 + len, |buf| fill(seq, buf)).unwrap());
      sizes.push(len);
    }
    assert!(producer.capacity() > 1024);

    for (seq, len) in sizes.into_iter().enumerate() {
      assert_eq!(read(&mut consumer), Some((seq as u32, len)));
    }
    assert_eq!(read(&mut consumer), None);
    assert!(consumer.is_empty());
  }

  #[test]
  fn test_switch_is_reported_once() {
    let (mut producer, mut consumer) = unbounded(1024, None, false).unwrap();
    assert!(producer.emplace(1000, |buf| fill(0, buf)).unwrap());
    assert!(producer.emplace(1000, |buf| fill(1, buf)).unwrap());
    assert_eq!(producer.capacity(), 2048);

    assert_eq!(read(&mut consumer), Some((0, 992)));
    assert_eq!(consumer.take_switch(), None);

    assert_eq!(read(&mut consumer), Some((1, 992)));
    assert_eq!(
      consumer.take_switch(),
      Some(QueueSwitch {
        previous_capacity: 1024,
        new_capacity: 2048
      })
    );
    assert_eq!(consumer.take_switch(), None);
    assert_eq!(consumer.capacity(), 2048);
  }

  #[test]
  fn test_growth_fits_large_record() {
    let (mut producer, mut consumer) = unbounded(1024, None, false).unwrap();
    assert!(producer.emplace(10_000, |buf| fill(7, buf)).unwrap());
    assert_eq!(producer.capacity(), 16_384);
    assert_eq!(read(&mut consumer), Some((7, 9_992)));
  }

  #[test]
  fn test_max_capacity_stops_growth() {
    let (mut producer, _consumer) = unbounded(1024, Some(2048), false).unwrap();
    assert!(producer.emplace(1000, |buf| fill(0, buf)).unwrap());
    assert!(producer.emplace(1000, |buf| fill(1, buf)).unwrap());
    assert!(producer.emplace(1000, |buf| fill(2, buf)).unwrap());

    // Doubling again would exceed the limit
    assert!(!producer.emplace(1000, |buf| fill(3, buf)).unwrap());
    assert_eq!(producer.capacity(), 2048);
  }

  #[test]
  fn test_record_larger_than_max_is_an_error() {
    let (mut producer, _consumer) = unbounded(1024, Some(4096), false).unwrap();
    assert!(matches!(
      producer.emplace(5000, |_| {}),
      Err(Error::AllocationFailure { .. })
    ));
  }

  #[test]
  fn test_not_empty_while_successor_pending() {
    let (mut producer, mut consumer) = unbounded(1024, None, false).unwrap();
    assert!(producer.emplace(1020, |buf| fill(0, buf)).unwrap());
    assert_eq!(read(&mut consumer), Some((0, 1012)));
    assert!(consumer.is_empty());

    assert!(producer.emplace(8, |buf| fill(1, buf)).unwrap());
    assert!(producer.emplace(1020, |buf| fill(2, buf)).unwrap());
    assert!(!consumer.is_empty());
    assert_eq!(read(&mut consumer), Some((1, 0)));
    assert_eq!(read(&mut consumer), Some((2, 1012)));
    assert!(consumer.is_empty());
  }

  #[test]
  fn test_concurrent_growth_keeps_order() {
    const RECORDS: u32 = 50_000;
    let (mut producer, mut consumer) = unbounded(1024, None, false).unwrap();

    let writer = thread::spawn(move || {
      let mut rng = rand::rng();
      for seq in 0..RECORDS {
        let len = rng.random_range(0..=200);
        assert!(producer.emplace(8 + len, |buf| fill(seq, buf)).unwrap());
      }
    });

    let mut next = 0u32;
    while next < RECORDS {
      match read(&mut consumer) {
        Some((seq, _)) => {
          assert_eq!(seq, next);
          next += 1;
        },
        None => {
          consumer.commit_read();
          std::hint::spin_loop();
        },
      }
    }

    writer.join().unwrap();
    assert_eq!(read(&mut consumer), None);
  }
}
