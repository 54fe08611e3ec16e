//! # Ring Storage
//!
//! Fixed-capacity byte storage for the SPSC queues. The capacity `C` is a power
//! of two and the storage exposes `2 * C` addressable bytes so that any region
//! starting inside `[0, C)` with a length of at most `C` can be handled as one
//! flat slice, even when it logically wraps past the end of the ring.
//!
//! ## Backings
//!
//! - [`MirroredRing`] (Linux): one `memfd` region mapped twice back to back, so
//!   the second half *is* the first half. Wraparound costs nothing.
//! - [`HeapRing`] (everywhere): a plain `2 * C` allocation. The part of a write
//!   that spills past `C` is copied to the front on publish, and the front is
//!   copied to the shadow half before a read that wraps. Callers cannot tell the
//!   two apart.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let storage = RingStorage::reserve(4096, false)?;
//! unsafe { storage.as_mut_slice(4090, 12) }.copy_from_slice(&[7u8; 12]);
//! storage.publish_write(4090, 12);
//! storage.prepare_read(4090, 12);
//! assert_eq!(unsafe { storage.as_slice(4090, 12) }, &[7u8; 12]);
//! ```


use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{Error, Result};

pub const CACHE_LINE_SIZE: usize = 64;

/// Platform capability behind [`RingStorage`].
///
/// `base_ptr()` must address `2 * capacity()` bytes that stay valid for the
/// lifetime of the ring. Offsets passed to the hooks are `< capacity()` and
/// lengths are `<= capacity()`.
pub trait ContiguousRing: Send + Sync {
  fn capacity(&self) -> usize;

  fn base_ptr(&self) -> *mut u8;

  /// Called after `[offset, offset + len)` was written and before it is published.
  fn publish_write(&self, _offset: usize, _len: usize) {}

  /// Called after `[offset, offset + len)` was observed as readable and before it is read.
  fn prepare_read(&self, _offset: usize, _len: usize) {}

  fn is_mirrored(&self) -> bool {
    false
  }
}

/// Portable backing: `2 * C` heap bytes with explicit copies at the wrap boundary.
pub struct HeapRing {
  base: NonNull<u8>,
  capacity: usize,
}

// SAFETY: the allocation is owned and only accessed through the queue protocol
unsafe impl Send for HeapRing {}
unsafe impl Sync for HeapRing {}

impl HeapRing {
  pub fn reserve(capacity: usize) -> Result<Self> {
    check_capacity(capacity)?;
    let size = capacity
      .checked_mul(2)
      .ok_or_else(|| Error::allocation(capacity, "size overflow"))?;
    let layout = Layout::from_size_align(size, CACHE_LINE_SIZE)
      .map_err(|e| Error::allocation(size, e.to_string()))?;

    // SAFETY: layout has a non-zero size
    let raw = unsafe { alloc::alloc_zeroed(layout) };
    let base = NonNull::new(raw).ok_or_else(|| Error::allocation(size, "allocator returned null"))?;

    Ok(Self { base, capacity })
  }

  fn layout(&self) -> Layout {
    // Validated in `reserve`
    Layout::from_size_align(self.capacity * 2, CACHE_LINE_SIZE).unwrap_or_else(|_| Layout::new::<u8>())
  }
}

impl ContiguousRing for HeapRing {
  #[inline]
  fn capacity(&self) -> usize {
    self.capacity
  }

  #[inline]
  fn base_ptr(&self) -> *mut u8 {
    self.base.as_ptr()
  }

  #[inline]
  fn publish_write(&self, offset: usize, len: usize) {
    let end = offset + len;
    if end > self.capacity {
      // SAFETY: [capacity, end) and [0, end - capacity) are disjoint halves of the allocation
      unsafe {
        let base = self.base.as_ptr();
        std::ptr::copy_nonoverlapping(base.add(self.capacity), base, end - self.capacity);
      }
    }
  }

  #[inline]
  fn prepare_read(&self, offset: usize, len: usize) {
    let end = offset + len;
    if end > self.capacity {
      // SAFETY: see `publish_write`; the readable bytes are not touched by the producer
      unsafe {
        let base = self.base.as_ptr();
        std::ptr::copy_nonoverlapping(base, base.add(self.capacity), end - self.capacity);
      }
    }
  }
}

impl Drop for HeapRing {
  fn drop(&mut self) {
    // SAFETY: allocated in `reserve` with the same layout
    unsafe { alloc::dealloc(self.base.as_ptr(), self.layout()) }
  }
}

/// Double-mapped backing: one physical region visible at `[0, C)` and `[C, 2C)`.
#[cfg(target_os = "linux")]
pub struct MirroredRing {
  base: NonNull<u8>,
  capacity: usize,
}

#[cfg(target_os = "linux")]
unsafe impl Send for MirroredRing {}
#[cfg(target_os = "linux")]
unsafe impl Sync for MirroredRing {}

#[cfg(target_os = "linux")]
impl MirroredRing {
  /// Maps `capacity` bytes twice. `capacity` must be a power of two and a
  /// multiple of the page size. Huge pages and sequential access are only
  /// advised; refusal by the kernel is ignored.
  pub fn reserve(capacity: usize, huge_pages: bool) -> Result<Self> {
    check_capacity(capacity)?;
    let page = page_size();
    if capacity % page != 0 {
      return Err(Error::allocation(
        capacity,
        format!("capacity is not a multiple of the page size ({})", page),
      ));
    }

    let size = capacity * 2;
    let os_error = |what: &str| Error::allocation(size, format!("{}: {}", what, std::io::Error::last_os_error()));

    // SAFETY: plain libc calls, every failure path unwinds what was created
    unsafe {
      let fd = libc::memfd_create(c"tachylog-ring".as_ptr(), libc::MFD_CLOEXEC);
      if fd < 0 {
        return Err(os_error("memfd_create"));
      }

      if libc::ftruncate(fd, capacity as libc::off_t) != 0 {
        let err = os_error("ftruncate");
        libc::close(fd);
        return Err(err);
      }

      let reservation = libc::mmap(
        std::ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      );
      if reservation == libc::MAP_FAILED {
        let err = os_error("mmap reservation");
        libc::close(fd);
        return Err(err);
      }

      let halves = [reservation, reservation.cast::<u8>().add(capacity).cast()];
      for half in halves {
        let mapped = libc::mmap(
          half,
          capacity,
          libc::PROT_READ | libc::PROT_WRITE,
          libc::MAP_SHARED | libc::MAP_FIXED,
          fd,
          0,
        );
        if mapped != half {
          let err = os_error("mmap mirror");
          libc::munmap(reservation, size);
          libc::close(fd);
          return Err(err);
        }
      }

      // The mappings keep the region alive
      libc::close(fd);

      libc::madvise(reservation, size, libc::MADV_SEQUENTIAL);
      if huge_pages {
        libc::madvise(reservation, size, libc::MADV_HUGEPAGE);
      }

      let base = NonNull::new(reservation.cast::<u8>()).ok_or_else(|| Error::allocation(size, "mmap returned null"))?;
      Ok(Self { base, capacity })
    }
  }
}

#[cfg(target_os = "linux")]
impl ContiguousRing for MirroredRing {
  #[inline]
  fn capacity(&self) -> usize {
    self.capacity
  }

  #[inline]
  fn base_ptr(&self) -> *mut u8 {
    self.base.as_ptr()
  }

  fn is_mirrored(&self) -> bool {
    true
  }
}

#[cfg(target_os = "linux")]
impl Drop for MirroredRing {
  fn drop(&mut self) {
    // SAFETY: both halves were mapped in `reserve`
    unsafe {
      libc::munmap(self.base.as_ptr().cast(), self.capacity * 2);
    }
  }
}

/// Byte ring used by the bounded queue.
pub struct RingStorage {
  ring: Box<dyn ContiguousRing>,
  base: *mut u8,
  capacity: usize,
  mask: usize,
}

unsafe impl Send for RingStorage {}
unsafe impl Sync for RingStorage {}

impl RingStorage {
  /// Reserves a ring of `capacity` bytes, preferring the double mapping and
  /// falling back to [`HeapRing`] when it is unavailable.
  pub fn reserve(capacity: usize, huge_pages: bool) -> Result<Self> {
    check_capacity(capacity)?;

    #[cfg(target_os = "linux")]
    if capacity % page_size() == 0 {
      match MirroredRing::reserve(capacity, huge_pages) {
        Ok(ring) => return Ok(Self::with_ring(Box::new(ring))),
        Err(e) => {
          tracing::debug!(target: "tachylog", "double mapping unavailable, using heap ring: {}", e);
        },
      }
    }

    let _ = huge_pages;
    Ok(Self::with_ring(Box::new(HeapRing::reserve(capacity)?)))
  }

  pub fn with_ring(ring: Box<dyn ContiguousRing>) -> Self {
    let capacity = ring.capacity();
    let base = ring.base_ptr();
    Self {
      ring,
      base,
      capacity,
      mask: capacity - 1,
    }
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  #[inline]
  pub fn mask(&self) -> usize {
    self.mask
  }

  pub fn is_mirrored(&self) -> bool {
    self.ring.is_mirrored()
  }

  /// Flat view of `[offset, offset + len)`.
  ///
  /// # Safety
  /// The caller must own the region under the queue protocol: no concurrent
  /// writer may touch it while the slice is alive.
  #[inline]
  pub unsafe fn as_slice(&self, offset: usize, len: usize) -> &[u8] {
    debug_assert!(offset < self.capacity && len <= self.capacity);
    std::slice::from_raw_parts(self.base.add(offset), len)
  }

  /// Mutable flat view of `[offset, offset + len)`.
  ///
  /// # Safety
  /// Same as [`RingStorage::as_slice`], and the region must not be aliased.
  #[inline]
  #[allow(clippy::mut_from_ref)]
  pub unsafe fn as_mut_slice(&self, offset: usize, len: usize) -> &mut [u8] {
    debug_assert!(offset < self.capacity && len <= self.capacity);
    std::slice::from_raw_parts_mut(self.base.add(offset), len)
  }

  #[inline]
  pub fn publish_write(&self, offset: usize, len: usize) {
    self.ring.publish_write(offset, len);
  }

  #[inline]
  pub fn prepare_read(&self, offset: usize, len: usize) {
    self.ring.prepare_read(offset, len);
  }
}

fn check_capacity(capacity: usize) -> Result<()> {
  if capacity == 0 || !capacity.is_power_of_two() {
    return Err(Error::allocation(
      capacity,
      format!("capacity {} is not a power of two", capacity),
    ));
  }
  Ok(())
}

pub fn page_size() -> usize {
  #[cfg(unix)]
  {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
      return size as usize;
    }
  }
  4096
}
