//! Size classes and the root table of free-list heads.
//!
//! Blocks below [`CLASS_BOUNDARY`] are bucketed linearly every [`DENSE_STEP`]
//! bytes. From the boundary upwards a block lands in the class of its
//! power-of-two degree, `ceil(log2(size))`; every degree past [`MAX_DEGREE`]
//! shares the single overflow class.

use crate::align_up;
use crate::arena::Block;

/// Dense/sparse boundary.
pub const CLASS_BOUNDARY: usize = 256;
/// Spacing of the dense classes.
pub const DENSE_STEP: usize = 32;

/// Number of dense classes: (0,32], (32,64] ... (192,224].
pub const DENSE_CLASSES: usize = CLASS_BOUNDARY / DENSE_STEP - 1;

/// Degree of the first sparse class, `log2(CLASS_BOUNDARY)`.
pub const MIN_DEGREE: u32 = CLASS_BOUNDARY.trailing_zeros();
/// Largest degree with a class of its own.
pub const MAX_DEGREE: u32 = 18;
pub const SPARSE_CLASSES: usize = (MAX_DEGREE - MIN_DEGREE + 1) as usize;

/// Catch-all class for blocks larger than `1 << MAX_DEGREE`.
pub const OVERFLOW_CLASS: usize = DENSE_CLASSES + SPARSE_CLASSES;
/// Total number of classes.
pub const CLASS_COUNT: usize = OVERFLOW_CLASS + 1;

const _: () = assert!(CLASS_BOUNDARY.is_power_of_two());
const _: () = assert!(DENSE_STEP.is_power_of_two());
const _: () = assert!(CLASS_BOUNDARY % DENSE_STEP == 0);
const _: () = assert!(MAX_DEGREE > MIN_DEGREE);
const _: () = assert!(CLASS_COUNT == 19);

/// Maps a block size to its class index.
#[inline(always)]
pub const fn class_of(size: usize) -> usize {
  if size < CLASS_BOUNDARY {
    // Sizes in (224, 256) round up onto the boundary and share degree 8's slot.
    let rounded = align_up(if size == 0 { 1 } else { size }, DENSE_STEP);
    return rounded / DENSE_STEP - 1;
  }

  let degree = ceil_log2(size);
  if degree > MAX_DEGREE {
    OVERFLOW_CLASS
  } else {
    DENSE_CLASSES + (degree - MIN_DEGREE) as usize
  }
}

/// Largest block size that maps to `class` (inverse of [`class_of`]).
///
/// The overflow class is unbounded and reports `usize::MAX`.
#[inline(always)]
pub const fn class_size(class: usize) -> usize {
  if class < DENSE_CLASSES {
    (class + 1) * DENSE_STEP
  } else if class < OVERFLOW_CLASS {
    1 << (MIN_DEGREE as usize + class - DENSE_CLASSES)
  } else {
    usize::MAX
  }
}

/// `ceil(log2(size))` for `size >= 1`.
#[inline(always)]
const fn ceil_log2(size: usize) -> u32 {
  if size <= 1 {
    0
  } else {
    usize::BITS - (size - 1).leading_zeros()
  }
}

// =============================================================================
// Root Table
// =============================================================================

/// Free-list heads, one per class.
#[derive(Debug, Clone)]
pub(crate) struct RootTable {
  heads: [Option<Block>; CLASS_COUNT],
}

impl RootTable {
  pub(crate) const fn new() -> Self {
    Self {
      heads: [None; CLASS_COUNT],
    }
  }

  #[inline]
  pub(crate) fn head(&self, class: usize) -> Option<Block> {
    self.heads[class]
  }

  #[inline]
  pub(crate) fn set_head(&mut self, class: usize, head: Option<Block>) {
    self.heads[class] = head;
  }

  /// Head of the list a block of `size` belongs to.
  #[inline]
  pub(crate) fn head_for(&self, size: usize) -> Option<Block> {
    self.head(class_of(size))
  }

  #[inline]
  pub(crate) fn set_head_for(&mut self, size: usize, head: Option<Block>) {
    self.set_head(class_of(size), head);
  }
}

// =============================================================================
// Class Scan
// =============================================================================

/// Walks the classes a request of a given size may be served from.
///
/// Starts at the request's own class and climbs one class at a time: through
/// the remaining dense classes, across the boundary into the sparse degrees,
/// and finally into the overflow class.
#[derive(Debug, Clone)]
pub(crate) struct ClassScan {
  next: usize,
}

impl ClassScan {
  pub(crate) const fn from_size(size: usize) -> Self {
    Self {
      next: class_of(size),
    }
  }
}

impl Iterator for ClassScan {
  type Item = usize;

  fn next(&mut self) -> Option<usize> {
    if self.next >= CLASS_COUNT {
      return None;
    }
    let class = self.next;
    self.next += 1;
    Some(class)
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    let left = CLASS_COUNT.saturating_sub(self.next);
    (left, Some(left))
  }
}

impl ExactSizeIterator for ClassScan {}
