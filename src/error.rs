//! Error types for heap growth and heap consistency checking.

use std::io;

use thiserror::Error;

/// Failures surfaced by the allocator.
///
/// A zero-size request is not an error; `allocate(0)` returns `Ok(None)`.
#[derive(Debug, Error)]
pub enum Error {
  /// The heap source refused to grow.
  #[error("heap exhausted: cannot grow by {requested} bytes ({available} bytes left)")]
  Exhausted { requested: usize, available: usize },

  /// The request cannot be expressed as a block size.
  #[error("request of {requested} bytes overflows the block size")]
  Overflow { requested: usize },

  /// An aligned request named an alignment that is not a power of two.
  #[error("alignment {align} is not a power of two")]
  Alignment { align: usize },

  /// `Heap::new` was handed a source that already holds bytes.
  #[error("heap source already holds {len} bytes")]
  SourceNotEmpty { len: usize },

  /// The operating system rejected a mapping or protection change.
  #[error("failed to map heap region")]
  Map(#[source] io::Error),
}

/// The first invariant breach found by [`Heap::check`](crate::Heap::check).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
  #[error("prologue or epilogue at {offset:#x} is damaged")]
  Sentinel { offset: usize },

  #[error("block at {offset:#x}: header ({header_size}, {header_alloc}) differs from footer ({footer_size}, {footer_alloc})")]
  TagMismatch {
    offset: usize,
    header_size: usize,
    header_alloc: bool,
    footer_size: usize,
    footer_alloc: bool,
  },

  #[error("payload at {offset:#x} is not aligned to the payload alignment")]
  Misaligned { offset: usize },

  #[error("block at {offset:#x} has size {size}, below the minimum block size")]
  Undersized { offset: usize, size: usize },

  #[error("block at {offset:#x} runs past the end of the heap")]
  Overrun { offset: usize },

  #[error("free blocks at {first:#x} and {second:#x} are physically adjacent")]
  AdjacentFree { first: usize, second: usize },

  #[error("block at {offset:#x} is listed in class {class} but is allocated")]
  ListedAllocated { offset: usize, class: usize },

  #[error("free block at {offset:#x} (size {size}) sits in class {found}, expected {expected}")]
  WrongClass {
    offset: usize,
    size: usize,
    found: usize,
    expected: usize,
  },

  #[error("free block at {offset:#x} has a broken back link")]
  BrokenLink { offset: usize },

  #[error("free block at {offset:#x} is reachable more than once")]
  Duplicate { offset: usize },

  #[error("{listed} blocks are listed but the heap holds {free} free blocks")]
  Unlisted { listed: usize, free: usize },
}
