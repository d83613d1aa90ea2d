//! Heap sources: where the managed region's bytes come from.
//!
//! A source behaves like `sbrk`: every grant is contiguous with the previous
//! one, zero-filled, and the base never moves once handed out.

use crate::ALIGNMENT;
use crate::error::Error;

/// Growable, contiguous backing store for a [`Heap`](crate::Heap).
///
/// The region must start on an [`ALIGNMENT`] boundary and keep that start
/// for as long as the source lives: payload alignment is computed from
/// offsets alone.
pub trait HeapSource {
  /// Extends the region by `bytes` and returns the offset at which the new
  /// bytes start, i.e. the previous length.
  ///
  /// On failure the region is left exactly as it was.
  fn grow(&mut self, bytes: usize) -> Result<usize, Error>;

  /// The bytes granted so far.
  fn as_slice(&self) -> &[u8];

  fn as_mut_slice(&mut self) -> &mut [u8];
}

// =============================================================================
// VecHeap
// =============================================================================

/// A bounded heap carved out of one up-front `Vec` reservation.
///
/// The buffer is never reallocated, so payload addresses stay stable for the
/// life of the source.
pub struct VecHeap {
  buf: Vec<u8>,
  /// Leading bytes skipped so that offset 0 is `ALIGNMENT`-aligned.
  skew: usize,
  limit: usize,
}

impl VecHeap {
  pub fn with_limit(limit: usize) -> Self {
    let buf: Vec<u8> = Vec::with_capacity(limit + ALIGNMENT);
    let skew = buf.as_ptr().align_offset(ALIGNMENT);
    let mut heap = Self { buf, skew, limit };
    heap.buf.resize(skew, 0);
    heap
  }

  /// Bytes this source will still hand out.
  pub fn remaining(&self) -> usize {
    self.limit - self.as_slice().len()
  }
}

impl HeapSource for VecHeap {
  fn grow(&mut self, bytes: usize) -> Result<usize, Error> {
    let old = self.as_slice().len();
    if bytes > self.remaining() {
      return Err(Error::Exhausted {
        requested: bytes,
        available: self.remaining(),
      });
    }
    self.buf.resize(self.skew + old + bytes, 0);
    debug_assert_eq!(self.buf.as_ptr().align_offset(ALIGNMENT), self.skew);
    Ok(old)
  }

  fn as_slice(&self) -> &[u8] {
    &self.buf[self.skew..]
  }

  fn as_mut_slice(&mut self) -> &mut [u8] {
    &mut self.buf[self.skew..]
  }
}

// =============================================================================
// MmapHeap
// =============================================================================

#[cfg(all(unix, feature = "mmap"))]
pub use self::mmap::MmapHeap;

#[cfg(all(unix, feature = "mmap"))]
mod mmap {
  use core::ptr::null_mut;
  use core::slice;
  use std::io;

  use super::HeapSource;
  use crate::align_up;
  use crate::error::Error;

  /// Address space reserved by [`MmapHeap::new`].
  pub const DEFAULT_RESERVE: usize = 1 << 30; // 1GB

  /// A heap inside one reserved, initially inaccessible mapping.
  ///
  /// Growing moves the break and makes the pages under it readable and
  /// writable; the reservation itself never moves.
  pub struct MmapHeap {
    base: *mut u8,
    reserved: usize,
    /// Bytes made accessible so far (page multiple).
    committed: usize,
    brk: usize,
  }

  // The mapping is owned exclusively by this value.
  unsafe impl Send for MmapHeap {}

  impl MmapHeap {
    pub fn new() -> Result<Self, Error> {
      Self::with_reserve(DEFAULT_RESERVE)
    }

    /// Reserves `reserve` bytes (rounded up to whole pages) of address space.
    pub fn with_reserve(reserve: usize) -> Result<Self, Error> {
      let reserved = align_up(reserve.max(1), page_size());
      let base = unsafe { os_reserve(reserved) }?;
      if crate::logging_allowed() {
        log::debug!("reserved {reserved:#x} bytes of heap address space at {base:p}");
      }
      Ok(Self {
        base,
        reserved,
        committed: 0,
        brk: 0,
      })
    }

    pub fn reserved(&self) -> usize {
      self.reserved
    }
  }

  impl HeapSource for MmapHeap {
    fn grow(&mut self, bytes: usize) -> Result<usize, Error> {
      let available = self.reserved - self.brk;
      if bytes > available {
        return Err(Error::Exhausted {
          requested: bytes,
          available,
        });
      }

      let old = self.brk;
      let end = old + bytes;
      if end > self.committed {
        let commit_end = align_up(end, page_size()).min(self.reserved);
        unsafe { os_commit(self.base.add(self.committed), commit_end - self.committed) }?;
        self.committed = commit_end;
      }
      self.brk = end;
      Ok(old)
    }

    fn as_slice(&self) -> &[u8] {
      unsafe { slice::from_raw_parts(self.base, self.brk) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
      unsafe { slice::from_raw_parts_mut(self.base, self.brk) }
    }
  }

  impl Drop for MmapHeap {
    fn drop(&mut self) {
      unsafe { os_munmap(self.base, self.reserved) };
    }
  }

  unsafe fn os_reserve(size: usize) -> Result<*mut u8, Error> {
    let ptr = unsafe {
      libc::mmap(
        null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
      )
    };

    if ptr == libc::MAP_FAILED {
      Err(Error::Map(io::Error::last_os_error()))
    } else {
      Ok(ptr as *mut u8)
    }
  }

  unsafe fn os_commit(ptr: *mut u8, size: usize) -> Result<(), Error> {
    let rc = unsafe { libc::mprotect(ptr.cast(), size, libc::PROT_READ | libc::PROT_WRITE) };
    if rc == 0 {
      Ok(())
    } else {
      Err(Error::Map(io::Error::last_os_error()))
    }
  }

  unsafe fn os_munmap(ptr: *mut u8, size: usize) {
    unsafe { libc::munmap(ptr.cast(), size) };
  }

  fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
      size if size > 0 => size as usize,
      _ => 4096,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn vec_heap_grows_contiguously() {
    let mut heap = VecHeap::with_limit(256);
    assert_eq!(heap.grow(32).unwrap(), 0);
    assert_eq!(heap.grow(64).unwrap(), 32);
    assert_eq!(heap.as_slice().len(), 96);
    assert_eq!(heap.remaining(), 160);
    assert!(heap.as_slice().iter().all(|&b| b == 0));
    assert_eq!(heap.as_slice().as_ptr().align_offset(ALIGNMENT), 0);
  }

  #[test]
  fn vec_heap_refuses_past_limit_without_moving() {
    let mut heap = VecHeap::with_limit(64);
    heap.grow(48).unwrap();
    let base = heap.as_slice().as_ptr();
    match heap.grow(32) {
      Err(Error::Exhausted {
        requested,
        available,
      }) => {
        assert_eq!(requested, 32);
        assert_eq!(available, 16);
      }
      other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(heap.as_slice().len(), 48);
    assert_eq!(heap.as_slice().as_ptr(), base);
  }

  #[cfg(all(unix, feature = "mmap"))]
  #[test]
  fn mmap_heap_commits_on_demand() {
    let mut heap = MmapHeap::with_reserve(1 << 20).unwrap();
    assert_eq!(heap.grow(100).unwrap(), 0);
    heap.as_mut_slice()[99] = 7;
    assert_eq!(heap.grow(10_000).unwrap(), 100);
    let bytes = heap.as_slice();
    assert_eq!(bytes.len(), 10_100);
    assert_eq!(bytes[99], 7);
    assert_eq!(bytes[10_099], 0);
    assert!(heap.grow(heap.reserved()).is_err());
    assert_eq!(heap.as_slice().len(), 10_100);
  }
}
