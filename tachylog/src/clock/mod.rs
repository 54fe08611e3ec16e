//! # Clock
//!
//! Timestamp sources for log records.
//!
//! - [`ClockSource::Tsc`]: the frontend stores the raw cycle counter, the cheapest
//!   thing it can read. The backend converts it with [`RdtscClock`].
//! - [`ClockSource::System`]: nanoseconds since the Unix epoch, read on the frontend.
//! - [`ClockSource::User`]: the caller supplies the timestamp. These records are
//!   never held back by the grace period.
//!
//! On targets without a cycle counter, [`rdtsc`] falls back to a monotonic
//! nanosecond count, so the conversion still works with a tick of ~1ns.


use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClockSource {
  #[default]
  Tsc,
  System,
  User,
}

/// Nanoseconds since the Unix epoch.
#[inline]
pub fn now_ns() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos() as u64)
    .unwrap_or(0)
}

/// Raw cycle counter.
#[inline]
#[cfg(target_arch = "x86_64")]
pub fn rdtsc() -> u64 {
  // SAFETY: rdtsc is available on every x86_64 CPU
  unsafe { core::arch::x86_64::_rdtsc() }
}

#[inline]
#[cfg(not(target_arch = "x86_64"))]
pub fn rdtsc() -> u64 {
  static ANCHOR: OnceLock<Instant> = OnceLock::new();
  ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64 + 1
}

const SPIN_DURATION: Duration = Duration::from_millis(10);
const MIN_TRIALS: usize = 3;
const MAX_TRIALS: usize = 15;
const CONVERGENCE_THRESHOLD: f64 = 0.01;

/// Nanoseconds per tick, measured once per process.
///
/// Takes the median of 10ms calibration spins, stopping early once the median
/// of an odd number of trials moves by less than 1%.
pub fn ns_per_tick() -> f64 {
  static NS_PER_TICK: OnceLock<f64> = OnceLock::new();
  *NS_PER_TICK.get_or_init(calibrate)
}

fn calibrate() -> f64 {
  let mut rates: Vec<f64> = Vec::with_capacity(MAX_TRIALS);
  let mut previous_median = 0.0;

  for trial in 1..=MAX_TRIALS {
    let begin = Instant::now();
    let begin_tsc = rdtsc();
    let (elapsed, end_tsc) = loop {
      let elapsed = begin.elapsed();
      let end_tsc = rdtsc();
      if elapsed >= SPIN_DURATION {
        break (elapsed, end_tsc);
      }
    };

    rates.push(end_tsc.wrapping_sub(begin_tsc) as f64 / elapsed.as_nanos() as f64);

    if trial >= MIN_TRIALS && trial % 2 != 0 {
      let median = median(&mut rates);
      if (median - previous_median).abs() / median < CONVERGENCE_THRESHOLD {
        break;
      }
      previous_median = median;
    }
  }

  let ticks_per_ns = median(&mut rates);
  if ticks_per_ns > 0.0 {
    1.0 / ticks_per_ns
  } else {
    1.0
  }
}

fn median(values: &mut [f64]) -> f64 {
  let mid = values.len() / 2;
  values.select_nth_unstable_by(mid, f64::total_cmp);
  values[mid]
}

#[derive(Debug, Clone, Copy, Default)]
struct Base {
  time: i64,
  tsc: u64,
}

/// Converts cycle counter values to wall-clock nanoseconds.
///
/// Owned by the backend thread. The tick-to-wall-clock anchor is refreshed
/// whenever a converted value lies more than `resync_interval` past it.
pub struct RdtscClock {
  base: Base,
  ns_per_tick: f64,
  resync_interval_ticks: i64,
  resync_interval_original: i64,
}

impl RdtscClock {
  /// Allowed tick distance between the two counter reads around a wall-clock read.
  pub const RESYNC_LAG: u64 = 2500;

  pub fn new(resync_interval: Duration) -> Self {
    let ns_per_tick = ns_per_tick();
    let ticks = (resync_interval.as_nanos() as f64 / ns_per_tick) as i64;

    let mut clock = Self {
      base: Base::default(),
      ns_per_tick,
      resync_interval_ticks: ticks,
      resync_interval_original: ticks,
    };

    if !clock.resync(Self::RESYNC_LAG) && !clock.resync(Self::RESYNC_LAG * 4) {
      tracing::warn!(target: "tachylog", "failed to sync the tsc clock, timestamps may drift");
    }
    clock
  }

  #[inline]
  pub fn time_since_epoch(&mut self, tsc: u64) -> u64 {
    let mut diff = tsc.wrapping_sub(self.base.tsc) as i64;

    if diff > self.resync_interval_ticks {
      self.resync(Self::RESYNC_LAG);
      diff = tsc.wrapping_sub(self.base.tsc) as i64;
    }

    (self.base.time + (diff as f64 * self.ns_per_tick) as i64) as u64
  }

  /// Re-anchors the clock. Gives up after four attempts whose counter reads are
  /// further apart than `lag`, and then doubles the resync interval so the next
  /// attempt is postponed.
  pub fn resync(&mut self, lag: u64) -> bool {
    for _ in 0..4 {
      let begin = rdtsc();
      let wall = now_ns() as i64;
      let end = rdtsc();

      if end.wrapping_sub(begin) <= lag {
        self.base = Base {
          time: wall,
          tsc: (begin & end) + ((begin ^ end) >> 1),
        };
        self.resync_interval_ticks = self.resync_interval_original;
        return true;
      }
    }

    self.resync_interval_ticks = self.resync_interval_ticks.saturating_mul(2);
    false
  }

  #[inline]
  pub fn nanoseconds_per_tick(&self) -> f64 {
    self.ns_per_tick
  }
}
