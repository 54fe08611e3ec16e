use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tachylog::{BackendOptions, Engine, FrontendOptions, LogRecord, QueueType, Sink};

const RECORDS_PER_THREAD: u64 = 1_000_000;

#[derive(Default)]
struct CountingSink {
  records: AtomicU64,
}

impl Sink for CountingSink {
  fn write_log(&self, _record: &LogRecord<'_>) {
    self.records.fetch_add(1, Ordering::Relaxed);
  }
}

fn main() {
  println!("tachylog throughput");
  println!("===================");
  println!();

  for queue_type in [QueueType::UnboundedBlocking, QueueType::BoundedBlocking, QueueType::BoundedDropping] {
    for threads in [1usize, 2, 4] {
      run(queue_type, threads);
    }
  }
}

fn run(queue_type: QueueType, threads: usize) {
  let engine = Engine::new(FrontendOptions {
    queue_type,
    ..FrontendOptions::default()
  })
  .expect("engine");
  engine.start_backend(BackendOptions::default()).expect("backend");

  let sink = Arc::new(CountingSink::default());
  let shared: Arc<dyn Sink> = sink.clone();
  let logger = engine.create_or_get_logger("throughput", vec![shared]);

  let start = Instant::now();
  let producers: Vec<_> = (0..threads)
    .map(|t| {
      let logger = Arc::clone(&logger);
      thread::spawn(move || {
        for i in 0..RECORDS_PER_THREAD {
          tachylog::info!(logger, "worker {} record {} px {:.3}", t as u32, i, i as f64 * 0.5);
        }
      })
    })
    .collect();
  for producer in producers {
    producer.join().expect("producer");
  }
  let produced = start.elapsed();

  logger.flush();
  let drained = start.elapsed();
  engine.stop_backend();

  let total = RECORDS_PER_THREAD * threads as u64;
  println!(
    "  {:?} x{}: frontend {:.2} M/s, end to end {:.2} M/s, delivered {}/{}",
    queue_type,
    threads,
    total as f64 / produced.as_secs_f64() / 1e6,
    total as f64 / drained.as_secs_f64() / 1e6,
    sink.records.load(Ordering::Relaxed),
    total,
  );
}
