use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use tachylog::bounded_queue::bounded;
use tachylog::unbounded_queue::unbounded;
use tachylog::{BackendOptions, Engine, FrontendOptions, LogRecord, QueueType, Sink};

struct NullSink;

impl Sink for NullSink {
  fn write_log(&self, record: &LogRecord<'_>) {
    black_box(record.message.len());
  }
}

fn configure_criterion() -> Criterion {
  Criterion::default()
    .sample_size(30)
    .measurement_time(Duration::from_secs(5))
    .warm_up_time(Duration::from_secs(2))
}

// ============================================================================
// Queue round trips, single thread
// ============================================================================

fn bench_queues(c: &mut Criterion) {
  let mut group = c.benchmark_group("queue");
  group.throughput(Throughput::Elements(1));

  for size in [16usize, 64, 256] {
    group.bench_with_input(BenchmarkId::new("bounded", size), &size, |b, &size| {
      let (mut producer, mut consumer) = bounded(1 << 16, false).expect("queue");
      b.iter(|| {
        if let Some(mut handle) = producer.try_reserve(size) {
          handle[0] = size as u8;
          handle.commit();
        }
        if let Some(window) = consumer.try_read() {
          black_box(window[0]);
          consumer.release(size);
          consumer.commit_read();
        }
      });
    });

    group.bench_with_input(BenchmarkId::new("unbounded", size), &size, |b, &size| {
      let (mut producer, mut consumer) = unbounded(1 << 16, None, false).expect("queue");
      b.iter(|| {
        let _ = producer.emplace(size, |buf| buf[0] = size as u8);
        if let Some(window) = consumer.try_read() {
          black_box(window[0]);
          consumer.release(size);
          consumer.commit_read();
        }
      });
    });
  }

  group.finish();
}

// ============================================================================
// Frontend call cost with a live backend
// ============================================================================

fn bench_frontend(c: &mut Criterion) {
  let mut group = c.benchmark_group("frontend");
  group.throughput(Throughput::Elements(1));

  for queue_type in [QueueType::UnboundedBlocking, QueueType::BoundedDropping] {
    let engine = Engine::new(FrontendOptions {
      queue_type,
      ..FrontendOptions::default()
    })
    .expect("engine");
    engine.start_backend(BackendOptions::default()).expect("backend");
    let logger = engine.create_or_get_logger("bench", vec![Arc::new(NullSink)]);
    engine.preallocate();

    group.bench_function(BenchmarkId::new("int_and_double", format!("{:?}", queue_type)), |b| {
      let mut i = 0u64;
      b.iter(|| {
        i += 1;
        black_box(tachylog::info!(logger, "order {} filled at {:.2}", i, 101.25f64))
      });
    });

    group.bench_function(BenchmarkId::new("str", format!("{:?}", queue_type)), |b| {
      let venue = "XNAS-primary-listing";
      b.iter(|| black_box(tachylog::info!(logger, "routed to {}", venue)));
    });

    group.bench_function(BenchmarkId::new("filtered", format!("{:?}", queue_type)), |b| {
      b.iter(|| black_box(tachylog::debug!(logger, "never encoded {}", 1u32)));
    });

    logger.flush();
    engine.stop_backend();
  }

  group.finish();
}

criterion_group! {
  name = benches;
  config = configure_criterion();
  targets = bench_queues, bench_frontend
}
criterion_main!(benches);
