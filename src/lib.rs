#![allow(clippy::missing_safety_doc)]

//! Segregated free-list allocator with boundary-tag coalescing.
//!
//! A [`Heap`] manages one contiguous region obtained from a [`HeapSource`].
//! Free blocks are kept on [`CLASS_COUNT`] size-class lists: narrow linear
//! classes below 256 bytes, power-of-two classes above, and a single overflow
//! class for everything past `1 << 18`. Freed blocks merge with free
//! neighbors immediately, found in O(1) through the header/footer tags.
//!
//! ```
//! use segfit::{Heap, VecHeap};
//!
//! let mut heap = Heap::new(VecHeap::with_limit(1 << 20)).unwrap();
//! let p = heap.allocate(100).unwrap().unwrap();
//! heap.payload_mut(p)[..5].copy_from_slice(b"hello");
//! let p = heap.resize(Some(p), 400).unwrap().unwrap();
//! assert_eq!(&heap.payload(p)[..5], b"hello");
//! heap.free(p);
//! ```

mod arena;
mod check;
mod class;
mod error;
mod heap;
mod source;

pub use crate::class::{
  CLASS_BOUNDARY, CLASS_COUNT, DENSE_CLASSES, DENSE_STEP, MAX_DEGREE, OVERFLOW_CLASS, class_of,
  class_size,
};
pub use crate::error::{CheckError, Error};
pub use crate::heap::{Heap, HeapStats, Payload};
#[cfg(all(unix, feature = "mmap"))]
pub use crate::source::MmapHeap;
pub use crate::source::{HeapSource, VecHeap};

// =============================================================================
// Constants
// =============================================================================

/// Boundary tag and free-list link size.
pub const WSIZE: usize = 8;
/// Per-block overhead: header plus footer.
pub const DSIZE: usize = 2 * WSIZE;
/// Payload alignment.
pub const ALIGNMENT: usize = 16;
/// Header, two links and footer. Also the smallest remainder worth splitting
/// off, on every path.
pub const MIN_BLOCK_SIZE: usize = 4 * WSIZE;
/// Smallest heap extension.
pub const CHUNK_SIZE: usize = 1 << 12; // 4KB

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(ALIGNMENT >= 8);
const _: () = assert!(ALIGNMENT % WSIZE == 0);
const _: () = assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);
const _: () = assert!(CHUNK_SIZE >= MIN_BLOCK_SIZE);

// =============================================================================
// Utils
// =============================================================================

#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Thread Heap
// =============================================================================

#[cfg(all(unix, feature = "mmap"))]
pub use self::global::{Allocator, MAX_THREAD_HEAPS, thread_stats, usable_size};

/// False while the calling thread is inside the global allocator, where a
/// logger that allocates would re-enter it.
#[inline]
pub(crate) fn logging_allowed() -> bool {
  #[cfg(all(unix, feature = "mmap"))]
  {
    !global::in_alloc()
  }
  #[cfg(not(all(unix, feature = "mmap")))]
  {
    true
  }
}

#[cfg(all(unix, feature = "mmap"))]
mod global {
  use core::{
    alloc::{GlobalAlloc, Layout},
    cell::{Cell, UnsafeCell},
    ptr::{self, NonNull, null_mut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
  };

  use crate::arena::Tag;
  use crate::source::HeapSource;
  use crate::{DSIZE, Heap, HeapStats, MmapHeap, WSIZE};

  /// Thread heaps that can exist at once. A heap outlives the thread that
  /// created it and is adopted by the next thread in need of one.
  pub const MAX_THREAD_HEAPS: usize = 512;

  // ---------------------------------------------------------------------------
  // Slots
  // ---------------------------------------------------------------------------

  /// A heap and the state other threads may touch.
  struct Slot {
    /// Set while a live thread owns `heap`.
    claimed: AtomicBool,
    /// Reserved address range; `start` is 0 until the heap exists.
    start: AtomicUsize,
    end: AtomicUsize,
    /// Treiber stack of payloads freed by other threads, linked through
    /// their first word. 0 is empty.
    remote: AtomicUsize,
    heap: UnsafeCell<Option<Heap<MmapHeap>>>,
  }

  // `heap` is only reached by the thread holding `claimed`.
  unsafe impl Sync for Slot {}

  impl Slot {
    const fn new() -> Self {
      Self {
        claimed: AtomicBool::new(false),
        start: AtomicUsize::new(0),
        end: AtomicUsize::new(0),
        remote: AtomicUsize::new(0),
        heap: UnsafeCell::new(None),
      }
    }

    fn try_claim(&self) -> bool {
      self
        .claimed
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    }

    fn release(&self) {
      self.claimed.store(false, Ordering::Release);
    }

    #[inline]
    fn contains(&self, addr: usize) -> bool {
      let start = self.start.load(Ordering::Acquire);
      start != 0 && start <= addr && addr < self.end.load(Ordering::Acquire)
    }

    /// Hands a block to the owning thread. `ptr` must be a live payload of
    /// this slot's heap.
    unsafe fn push_remote(&self, ptr: *mut u8) {
      let mut head = self.remote.load(Ordering::Relaxed);
      loop {
        unsafe { ptr.cast::<usize>().write(head) };
        match self
          .remote
          .compare_exchange_weak(head, ptr as usize, Ordering::Release, Ordering::Relaxed)
        {
          Ok(_) => return,
          Err(current) => head = current,
        }
      }
    }

    /// Frees every block queued by other threads. Owner only.
    fn drain_remote(&self, heap: &mut Heap<MmapHeap>) {
      if self.remote.load(Ordering::Relaxed) == 0 {
        return;
      }
      let mut cursor = self.remote.swap(0, Ordering::Acquire);
      while cursor != 0 {
        let ptr = cursor as *mut u8;
        let next = unsafe { ptr.cast::<usize>().read() };
        if let Some(payload) = heap.payload_from_ptr(ptr) {
          heap.free(payload);
        }
        cursor = next;
      }
    }
  }

  static SLOTS: [Slot; MAX_THREAD_HEAPS] = [const { Slot::new() }; MAX_THREAD_HEAPS];
  /// One past the highest slot that ever held a heap.
  static OPENED: AtomicUsize = AtomicUsize::new(0);

  /// Claims a slot for the calling thread, adopting an orphaned heap before
  /// mapping a new one.
  fn acquire() -> Option<&'static Slot> {
    let orphans = SLOTS
      .iter()
      .enumerate()
      .filter(|(_, slot)| slot.start.load(Ordering::Acquire) != 0);
    let (index, slot) = orphans
      .chain(SLOTS.iter().enumerate())
      .find(|(_, slot)| slot.try_claim())?;

    let cell = unsafe { &mut *slot.heap.get() };
    if cell.is_none() {
      let Ok(heap) = MmapHeap::new().and_then(Heap::new) else {
        slot.release();
        return None;
      };
      let start = heap.source().as_slice().as_ptr() as usize;
      slot.end.store(start + heap.source().reserved(), Ordering::Release);
      slot.start.store(start, Ordering::Release);
      *cell = Some(heap);
      OPENED.fetch_max(index + 1, Ordering::AcqRel);
    }
    Some(slot)
  }

  /// The slot whose reservation holds `ptr`.
  fn owner_of(ptr: *const u8) -> Option<&'static Slot> {
    let addr = ptr as usize;
    SLOTS[..OPENED.load(Ordering::Acquire)]
      .iter()
      .find(|slot| slot.contains(addr))
  }

  // ---------------------------------------------------------------------------
  // Thread-local state
  // ---------------------------------------------------------------------------

  /// Puts the thread's heap up for adoption when the thread exits.
  ///
  /// Kept apart from `LEASE` so that the slot itself lives in plain,
  /// destructor-free TLS that stays readable through teardown.
  struct ExitGuard;

  impl Drop for ExitGuard {
    fn drop(&mut self) {
      if let Ok(Some(slot)) = LEASE.try_with(Cell::take) {
        slot.release();
      }
    }
  }

  thread_local! {
    static LEASE: Cell<Option<&'static Slot>> = const { Cell::new(None) };
    static EXIT_GUARD: ExitGuard = const { ExitGuard };
    static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
  }

  pub(crate) fn in_alloc() -> bool {
    IN_ALLOC.try_with(Cell::get).unwrap_or(true)
  }

  fn leased() -> Option<&'static Slot> {
    LEASE.try_with(Cell::get).ok().flatten()
  }

  /// Runs `f` on this thread's heap, claiming one on first use and first
  /// applying frees queued by other threads.
  ///
  /// `None` on re-entry (the heap's own setup allocating) or when no slot or
  /// mapping is left.
  fn with_heap<R>(f: impl FnOnce(&mut Heap<MmapHeap>) -> R) -> Option<R> {
    if IN_ALLOC.try_with(|flag| flag.replace(true)).ok()? {
      return None;
    }

    let mut fresh = false;
    let result = LEASE
      .try_with(|lease| {
        let slot = match lease.get() {
          Some(slot) => slot,
          None => {
            let slot = acquire()?;
            lease.set(Some(slot));
            fresh = true;
            slot
          }
        };
        let heap = unsafe { &mut *slot.heap.get() }.as_mut()?;
        slot.drain_remote(heap);
        Some(f(heap))
      })
      .ok()
      .flatten();

    let _ = IN_ALLOC.try_with(|flag| flag.set(false));

    // Arming the guard may allocate, so it happens outside the heap. Once
    // the guard is gone (thread teardown) a fresh slot is only borrowed for
    // this one call.
    if fresh && EXIT_GUARD.try_with(|_| ()).is_err() {
      if let Ok(Some(slot)) = LEASE.try_with(Cell::take) {
        slot.release();
      }
    }
    result
  }

  /// Usable bytes of a payload owned by any thread heap, read off its header.
  fn block_usable(ptr: *mut u8) -> Option<usize> {
    owner_of(ptr)?;
    let word = unsafe { ptr.sub(WSIZE).cast::<u64>().read() };
    Some(Tag::unpack(word).size - DSIZE)
  }

  /// Frees `ptr` on this thread's heap, or queues it for the heap that owns
  /// it.
  unsafe fn release(ptr: *mut u8) {
    let addr = ptr as usize;
    if let Some(slot) = leased().filter(|slot| slot.contains(addr)) {
      let freed = with_heap(|heap| {
        if let Some(payload) = heap.payload_from_ptr(ptr) {
          heap.free(payload);
        }
      });
      if freed.is_none() {
        unsafe { slot.push_remote(ptr) };
      }
      return;
    }
    if let Some(owner) = owner_of(ptr) {
      unsafe { owner.push_remote(ptr) };
    }
  }

  // ---------------------------------------------------------------------------
  // GlobalAlloc
  // ---------------------------------------------------------------------------

  /// `GlobalAlloc` over one segregated-fit heap per thread.
  ///
  /// Blocks freed on a thread other than their owner's are queued on the
  /// owning heap and released on its next operation. A heap whose thread
  /// has exited keeps its blocks valid and passes to the next new thread.
  /// At most [`MAX_THREAD_HEAPS`] threads can hold a heap at once; past
  /// that, allocation fails.
  pub struct Allocator;

  unsafe impl GlobalAlloc for Allocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
      let size = layout.size().max(1);
      with_heap(|heap| {
        let payload = heap.allocate_aligned(size, layout.align()).ok().flatten()?;
        Some(heap.as_ptr(payload))
      })
      .flatten()
      .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
      if !ptr.is_null() {
        unsafe { release(ptr) }
      }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
      if ptr.is_null() {
        return unsafe {
          self.alloc(Layout::from_size_align_unchecked(
            new_size.max(1),
            layout.align(),
          ))
        };
      }

      if new_size == 0 {
        unsafe { self.dealloc(ptr, layout) };
        return null_mut();
      }

      let addr = ptr as usize;
      if layout.align() <= crate::ALIGNMENT && leased().is_some_and(|slot| slot.contains(addr)) {
        let resized = with_heap(|heap| {
          let payload = heap.payload_from_ptr(ptr)?;
          let resized = heap.resize(Some(payload), new_size).ok().flatten()?;
          Some(heap.as_ptr(resized))
        });
        if let Some(resized) = resized {
          return resized.map_or(null_mut(), NonNull::as_ptr);
        }
      }

      // Over-aligned, or owned by another thread: move it here.
      let Some(old) = block_usable(ptr) else {
        return null_mut();
      };
      let moved = unsafe {
        self.alloc(Layout::from_size_align_unchecked(
          new_size,
          layout.align(),
        ))
      };
      if !moved.is_null() {
        unsafe {
          ptr::copy_nonoverlapping(ptr, moved, old.min(new_size));
          self.dealloc(ptr, layout);
        }
      }
      moved
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
      let ptr = unsafe { self.alloc(layout) };
      if !ptr.is_null() {
        unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
      }
      ptr
    }
  }

  /// Usable bytes behind `ptr`, or 0 for pointers no thread heap owns.
  pub fn usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
      return 0;
    }
    block_usable(ptr).unwrap_or(0)
  }

  /// Stats of the calling thread's heap, after applying frees queued by
  /// other threads.
  pub fn thread_stats() -> Option<HeapStats> {
    with_heap(|heap| heap.stats())
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(all(unix, feature = "c_api"))]
mod c_api {
  use core::alloc::{GlobalAlloc, Layout};
  use core::ptr::{self, null_mut};

  use super::{Allocator, usable_size};
  use crate::ALIGNMENT;

  static A: Allocator = Allocator;

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    unsafe { A.alloc(Layout::from_size_align_unchecked(size.max(1), ALIGNMENT)) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut u8) {
    unsafe { A.dealloc(ptr, Layout::from_size_align_unchecked(1, 1)) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let Some(total) = nmemb.checked_mul(size) else {
      return null_mut();
    };
    unsafe { A.alloc_zeroed(Layout::from_size_align_unchecked(total.max(1), ALIGNMENT)) }
  }

  /// The heap knows the old block size, so unlike a size-blind `realloc` this
  /// copies exactly the old usable bytes.
  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { A.realloc(ptr, Layout::from_size_align_unchecked(1, ALIGNMENT), size) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut u8,
    alignment: usize,
    size: usize,
  ) -> i32 {
    if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
      return libc::EINVAL;
    }
    let Ok(layout) = Layout::from_size_align(size.max(1), alignment) else {
      return libc::ENOMEM;
    };

    let ptr = unsafe { A.alloc(layout) };
    if ptr.is_null() {
      return libc::ENOMEM;
    }

    unsafe { ptr::write(memptr, ptr) };
    0
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
    usable_size(ptr)
  }

}

#[cfg(all(test, unix, feature = "mmap"))]
mod tests {
  use super::*;
  use core::alloc::{GlobalAlloc, Layout};
  use std::thread;

  #[test]
  fn allocator_round_trips_through_thread_heap() {
    let a = Allocator;
    unsafe {
      let layout = Layout::from_size_align(100, 8).unwrap();
      let p = a.alloc(layout);
      assert!(!p.is_null());
      assert_eq!(p as usize % ALIGNMENT, 0);
      assert!(usable_size(p) >= 100);
      p.write_bytes(0x5A, 100);

      let q = a.realloc(p, layout, 1000);
      assert!(!q.is_null());
      assert!(core::slice::from_raw_parts(q, 100).iter().all(|&b| b == 0x5A));
      a.dealloc(q, Layout::from_size_align(1000, 8).unwrap());

      let z = a.alloc_zeroed(Layout::from_size_align(64, 16).unwrap());
      assert!(core::slice::from_raw_parts(z, 64).iter().all(|&b| b == 0));
      a.dealloc(z, layout);
    }
  }

  #[test]
  fn allocator_honors_large_alignments() {
    let a = Allocator;
    for align in [32, 64, 256, 4096] {
      unsafe {
        let layout = Layout::from_size_align(100, align).unwrap();
        let p = a.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % align, 0);
        p.write_bytes(0x7E, 100);

        let q = a.realloc(p, layout, 3000);
        assert_eq!(q as usize % align, 0);
        assert!(core::slice::from_raw_parts(q, 100).iter().all(|&b| b == 0x7E));
        a.dealloc(q, Layout::from_size_align(3000, align).unwrap());
      }
    }
  }

  #[test]
  fn foreign_frees_are_ignored() {
    let a = Allocator;
    let mut local = [0u8; 32];
    unsafe { a.dealloc(local.as_mut_ptr(), Layout::from_size_align(32, 1).unwrap()) };
    assert_eq!(usable_size(local.as_mut_ptr()), 0);
    assert_eq!(usable_size(core::ptr::null_mut()), 0);
  }

  #[test]
  fn frees_from_other_threads_return_to_the_owner() {
    let a = Allocator;
    let layout = Layout::from_size_align(64, 16).unwrap();
    let p = unsafe { a.alloc(layout) };
    assert!(!p.is_null());
    let held = thread_stats().unwrap().allocated_blocks;

    let addr = p as usize;
    thread::spawn(move || unsafe { Allocator.dealloc(addr as *mut u8, layout) })
      .join()
      .unwrap();
    assert!(thread_stats().unwrap().allocated_blocks < held);
  }

  #[test]
  fn blocks_outlive_their_thread() {
    let a = Allocator;
    let layout = Layout::from_size_align(300, 16).unwrap();
    let addr = thread::spawn(move || unsafe {
      let p = Allocator.alloc(layout);
      p.write_bytes(0x11, 300);
      p as usize
    })
    .join()
    .unwrap();

    let p = addr as *mut u8;
    assert!(usable_size(p) >= 300);
    unsafe {
      assert!(core::slice::from_raw_parts(p, 300).iter().all(|&b| b == 0x11));
      let q = a.realloc(p, layout, 600);
      assert!(!q.is_null());
      assert!(core::slice::from_raw_parts(q, 300).iter().all(|&b| b == 0x11));
      a.dealloc(q, Layout::from_size_align(600, 16).unwrap());
    }
  }
}
