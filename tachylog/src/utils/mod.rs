
use std::cell::Cell;

thread_local! {
  static THREAD_ID: Cell<u32> = const { Cell::new(0) };
}

/// OS thread id of the calling thread, cached after the first call.
#[inline]
pub fn current_thread_id() -> u32 {
  THREAD_ID
    .try_with(|cached| {
      if cached.get() == 0 {
        cached.set(os_thread_id());
      }
      cached.get()
    })
    .unwrap_or_else(|_| os_thread_id())
}

#[cfg(target_os = "linux")]
fn os_thread_id() -> u32 {
  // SAFETY: gettid has no preconditions
  unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(not(target_os = "linux"))]
fn os_thread_id() -> u32 {
  use std::collections::hash_map::DefaultHasher;
  use std::hash::{Hash, Hasher};
  let mut hasher = DefaultHasher::new();
  std::thread::current().id().hash(&mut hasher);
  (hasher.finish() as u32).max(1)
}

/// Process id, as reported to sinks.
#[inline]
pub fn process_id() -> u32 {
  std::process::id()
}
