//! The segregated-fit heap.
//!
//! Free blocks hang off one of [`CLASS_COUNT`](crate::CLASS_COUNT) doubly
//! linked lists. Allocation scans from the request's class upwards, splits
//! the first block that fits and grows the heap on a miss. Every block that
//! turns free is merged with free physical neighbors straight away, so no two
//! free blocks ever touch.

use core::num::NonZeroUsize;
use core::ptr::NonNull;

use log::{debug, warn};

use crate::arena::{Arena, Block, FreeNode, Tag};
use crate::class::{ClassScan, RootTable};
use crate::error::Error;
use crate::source::HeapSource;
use crate::{ALIGNMENT, CHUNK_SIZE, DSIZE, MIN_BLOCK_SIZE, WSIZE, align_up};

/// Offset of the prologue block's payload.
const PROLOGUE: usize = 2 * WSIZE;
/// Bytes laid down by initialization: pad, prologue header/footer, epilogue.
const PRELUDE_SIZE: usize = 4 * WSIZE;
/// Payload offset of the first real block.
pub(crate) const FIRST_BLOCK: usize = PRELUDE_SIZE;

const _: () = assert!(FIRST_BLOCK % ALIGNMENT == 0);
const _: () = assert!(CHUNK_SIZE % DSIZE == 0);

/// A payload handed out by [`Heap::allocate`], as an offset from the heap base.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Payload(NonZeroUsize);

impl Payload {
  /// Offset of the payload from the start of the heap.
  #[inline]
  pub fn offset(self) -> usize {
    self.0.get()
  }

  #[inline]
  fn block(self) -> Block {
    Block::new(self.offset())
  }

  #[inline]
  fn from_block(block: Block) -> Self {
    match NonZeroUsize::new(block.offset()) {
      Some(offset) => Self(offset),
      None => unreachable!("offset 0 is never a payload"),
    }
  }
}

/// Aggregate view of the heap, gathered by a full walk.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HeapStats {
  /// Bytes obtained from the source, sentinels included.
  pub heap_size: usize,
  pub free_bytes: usize,
  pub free_blocks: usize,
  pub allocated_bytes: usize,
  pub allocated_blocks: usize,
  /// Largest single free block.
  pub largest_free: usize,
  /// Successful heap extensions, the initial one included.
  pub extensions: usize,
}

/// Segregated free-list allocator over one growable region.
///
/// All state lives here: the root table and the heap image. Mutation takes
/// `&mut self`, which is the whole of the single-caller contract.
pub struct Heap<S: HeapSource> {
  pub(crate) arena: Arena<S>,
  pub(crate) roots: RootTable,
  extensions: usize,
}

impl<S: HeapSource> Heap<S> {
  /// Lays out the sentinels in an empty `source` and primes the heap with one
  /// chunk of free space.
  pub fn new(mut source: S) -> Result<Self, Error> {
    let len = source.as_slice().len();
    if len != 0 {
      return Err(Error::SourceNotEmpty { len });
    }
    source.grow(PRELUDE_SIZE)?;
    debug_assert_eq!(
      source.as_slice().as_ptr() as usize % ALIGNMENT,
      0,
      "heap source base must be ALIGNMENT-aligned"
    );

    let mut heap = Self {
      arena: Arena::new(source),
      roots: RootTable::new(),
      extensions: 0,
    };
    heap.arena.set_word(0, 0);
    heap.arena.set_tags(Block::new(PROLOGUE), DSIZE, true);
    heap.arena.set_tag_at(PRELUDE_SIZE - WSIZE, Tag::new(0, true));

    heap.extend(CHUNK_SIZE)?;
    if crate::logging_allowed() {
      debug!("heap initialized with {} bytes", heap.heap_size());
    }
    heap.tripwire();
    Ok(heap)
  }

  // ===========================================================================
  // Public API
  // ===========================================================================

  /// Allocates at least `size` bytes.
  ///
  /// Returns `Ok(None)` for a zero-size request.
  pub fn allocate(&mut self, size: usize) -> Result<Option<Payload>, Error> {
    if size == 0 {
      return Ok(None);
    }
    let asize = adjust_size(size)?;

    let block = match self.find_fit(asize) {
      Some(block) => block,
      None => self.extend(asize.max(CHUNK_SIZE))?,
    };
    self.place(block, asize);

    self.tripwire();
    Ok(Some(Payload::from_block(block)))
  }

  /// Allocates at least `size` bytes at an address that is a multiple of
  /// `align`.
  ///
  /// Alignments up to [`ALIGNMENT`] take the plain [`allocate`](Self::allocate)
  /// path. Larger ones over-ask by `align` plus a minimum block, then give the
  /// bytes in front of the aligned payload back as a free block of their own.
  pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<Option<Payload>, Error> {
    if !align.is_power_of_two() {
      return Err(Error::Alignment { align });
    }
    if align <= ALIGNMENT {
      return self.allocate(size);
    }
    if size == 0 {
      return Ok(None);
    }
    let asize = adjust_size(size)?;
    let padded = asize
      .checked_add(align + MIN_BLOCK_SIZE)
      .ok_or(Error::Overflow { requested: size })?;

    let block = match self.find_fit(padded) {
      Some(block) => block,
      None => self.extend(padded.max(CHUNK_SIZE))?,
    };

    let base = self.arena.bytes().as_ptr() as usize;
    let mut offset = align_up(base + block.offset(), align) - base;
    let gap = offset - block.offset();
    if gap != 0 && gap < MIN_BLOCK_SIZE {
      offset += align;
    }

    let block = if offset == block.offset() {
      block
    } else {
      // The predecessor is allocated, so the leading gap cannot touch free
      // space and is listed as is.
      let csize = self.arena.size(block);
      let gap = offset - block.offset();
      self.disconnect(block);
      self.arena.set_tags(block, gap, false);
      self.insert(block);

      let aligned = Block::new(offset);
      self.arena.set_tags(aligned, csize - gap, false);
      self.insert(aligned);
      aligned
    };
    self.place(block, asize);

    self.tripwire();
    Ok(Some(Payload::from_block(block)))
  }

  /// Returns a payload to the heap.
  ///
  /// `payload` must come from this heap and must not have been freed since.
  pub fn free(&mut self, payload: Payload) {
    let block = payload.block();
    let size = self.arena.size(block);
    debug_assert!(self.arena.is_allocated(block), "double free of {payload:?}");

    self.arena.set_tags(block, size, false);
    self.coalesce(block);
    self.tripwire();
  }

  /// Resizes `payload` to hold `size` bytes, in place where possible.
  ///
  /// `None` allocates; a zero `size` frees and returns `Ok(None)`. If a
  /// moving resize cannot get memory, the old payload is left untouched and
  /// the error returned.
  pub fn resize(&mut self, payload: Option<Payload>, size: usize) -> Result<Option<Payload>, Error> {
    let Some(payload) = payload else {
      return self.allocate(size);
    };
    if size == 0 {
      self.free(payload);
      return Ok(None);
    }

    let block = payload.block();
    let asize = adjust_size(size)?;
    let old = self.arena.size(block);

    if asize == old {
      return Ok(Some(payload));
    }

    if asize < old {
      self.shrink(block, asize);
      self.tripwire();
      return Ok(Some(payload));
    }

    if self.grow_in_place(block, asize) {
      self.tripwire();
      return Ok(Some(payload));
    }

    let Some(moved) = self.allocate(size)? else {
      unreachable!("non-zero request yields a payload");
    };
    let usable = old - DSIZE;
    let (src, dst) = (block.offset(), moved.offset());
    self.arena.bytes_mut().copy_within(src..src + usable, dst);
    self.free(payload);
    Ok(Some(moved))
  }

  // ===========================================================================
  // Payload access
  // ===========================================================================

  /// Bytes the caller may use in `payload` (block size minus tags).
  pub fn usable_size(&self, payload: Payload) -> usize {
    self.arena.size(payload.block()) - DSIZE
  }

  pub fn payload(&self, payload: Payload) -> &[u8] {
    let start = payload.offset();
    &self.arena.bytes()[start..start + self.usable_size(payload)]
  }

  pub fn payload_mut(&mut self, payload: Payload) -> &mut [u8] {
    let start = payload.offset();
    let end = start + self.usable_size(payload);
    &mut self.arena.bytes_mut()[start..end]
  }

  /// Address of `payload` in memory. Stable for the life of the heap.
  pub fn as_ptr(&mut self, payload: Payload) -> NonNull<u8> {
    let base = self.arena.bytes_mut().as_mut_ptr();
    match NonNull::new(base.wrapping_add(payload.offset())) {
      Some(ptr) => ptr,
      None => unreachable!("heap base is never null"),
    }
  }

  /// Maps an address back to the payload it names, if it points at the
  /// start of a payload-aligned spot inside this heap's blocks.
  pub fn payload_from_ptr(&self, ptr: *const u8) -> Option<Payload> {
    let base = self.arena.bytes().as_ptr() as usize;
    let offset = (ptr as usize).checked_sub(base)?;
    if offset < FIRST_BLOCK || offset >= self.arena.len() || offset % ALIGNMENT != 0 {
      return None;
    }
    NonZeroUsize::new(offset).map(Payload)
  }

  /// Bytes obtained from the source so far.
  pub fn heap_size(&self) -> usize {
    self.arena.len()
  }

  pub fn source(&self) -> &S {
    self.arena.source()
  }

  /// Walks every block and sums up free and allocated space.
  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      heap_size: self.heap_size(),
      extensions: self.extensions,
      ..HeapStats::default()
    };
    for (_, tag) in self.blocks() {
      if tag.allocated {
        stats.allocated_blocks += 1;
        stats.allocated_bytes += tag.size;
      } else {
        stats.free_blocks += 1;
        stats.free_bytes += tag.size;
        stats.largest_free = stats.largest_free.max(tag.size);
      }
    }
    stats
  }

  /// Physical walk from the first block up to the epilogue.
  pub(crate) fn blocks(&self) -> Blocks<'_, S> {
    Blocks {
      arena: &self.arena,
      next: FIRST_BLOCK,
    }
  }

  // ===========================================================================
  // Fit search
  // ===========================================================================

  /// First free block of at least `asize` bytes, scanning from the request's
  /// class upwards across dense, sparse and overflow classes.
  fn find_fit(&self, asize: usize) -> Option<Block> {
    for class in ClassScan::from_size(asize) {
      let mut cursor = self.roots.head(class);
      while let Some(block) = cursor {
        if asize <= self.arena.size(block) {
          return Some(block);
        }
        cursor = self.arena.node(block).next;
      }
    }
    None
  }

  // ===========================================================================
  // Free lists
  // ===========================================================================

  /// LIFO insert at the head of the block's class list.
  fn insert(&mut self, block: Block) {
    let size = self.arena.size(block);
    let head = self.roots.head_for(size);
    self.arena.set_node(block, FreeNode { next: head, prev: None });
    if let Some(head) = head {
      self.arena.set_prev(head, Some(block));
    }
    self.roots.set_head_for(size, Some(block));
  }

  /// Unlinks a free block. Must run before its tags change size.
  fn disconnect(&mut self, block: Block) {
    let size = self.arena.size(block);
    let FreeNode { next, prev } = self.arena.node(block);
    match prev {
      Some(prev) => self.arena.set_next(prev, next),
      None => self.roots.set_head_for(size, next),
    }
    if let Some(next) = next {
      self.arena.set_prev(next, prev);
    }
  }

  // ===========================================================================
  // Place / Coalesce / Extend
  // ===========================================================================

  /// Allocates `asize` bytes out of the free `block`, returning any usable
  /// tail to the free lists.
  fn place(&mut self, block: Block, asize: usize) {
    let csize = self.arena.size(block);
    debug_assert!(asize <= csize);
    self.disconnect(block);

    let rest = csize - asize;
    if rest >= MIN_BLOCK_SIZE {
      self.arena.set_tags(block, asize, true);
      let tail = self.arena.next_block(block);
      self.arena.set_tags(tail, rest, false);
      self.insert(tail);
    } else {
      self.arena.set_tags(block, csize, true);
    }
  }

  /// Merges the newly free `block` with free neighbors and lists the result.
  fn coalesce(&mut self, block: Block) -> Block {
    let prev_free = !self.arena.prev_tag(block).allocated;
    let next = self.arena.next_block(block);
    let next_free = !self.arena.is_allocated(next);
    let mut size = self.arena.size(block);

    let merged = match (prev_free, next_free) {
      (false, false) => block,
      (false, true) => {
        self.disconnect(next);
        size += self.arena.size(next);
        self.arena.set_tags(block, size, false);
        block
      }
      (true, false) => {
        let prev = self.arena.prev_block(block);
        self.disconnect(prev);
        size += self.arena.size(prev);
        self.arena.set_tags(prev, size, false);
        prev
      }
      (true, true) => {
        let prev = self.arena.prev_block(block);
        self.disconnect(prev);
        self.disconnect(next);
        size += self.arena.size(prev) + self.arena.size(next);
        self.arena.set_tags(prev, size, false);
        prev
      }
    };
    self.insert(merged);
    merged
  }

  /// Grows the heap by at least `bytes` and returns the (coalesced) free
  /// block that now ends at the epilogue.
  fn extend(&mut self, bytes: usize) -> Result<Block, Error> {
    let size = align_up(bytes, DSIZE);
    let start = match self.arena.source_mut().grow(size) {
      Ok(start) => start,
      Err(err) => {
        if crate::logging_allowed() {
          warn!("heap extension by {size} bytes failed: {err}");
        }
        return Err(err);
      }
    };
    self.extensions += 1;

    // The old epilogue header becomes the new block's header.
    let block = Block::new(start);
    self.arena.set_tags(block, size, false);
    let epilogue = self.arena.next_block(block).offset() - WSIZE;
    self.arena.set_tag_at(epilogue, Tag::new(0, true));
    if crate::logging_allowed() {
      debug!("heap extended by {size} bytes to {}", self.heap_size());
    }

    Ok(self.coalesce(block))
  }

  // ===========================================================================
  // Resize helpers
  // ===========================================================================

  /// Trims an allocated block to `asize` when the cut-off tail can stand as
  /// a block of its own.
  fn shrink(&mut self, block: Block, asize: usize) {
    let old = self.arena.size(block);
    let rest = old - asize;
    if rest < MIN_BLOCK_SIZE {
      return;
    }
    self.arena.set_tags(block, asize, true);
    let tail = self.arena.next_block(block);
    self.arena.set_tags(tail, rest, false);
    // The tail may now touch a free neighbor.
    self.coalesce(tail);
  }

  /// Extends an allocated block into a free successor.
  fn grow_in_place(&mut self, block: Block, asize: usize) -> bool {
    let old = self.arena.size(block);
    let next = self.arena.next_block(block);
    let next_tag = self.arena.header(next);
    if next_tag.allocated || old + next_tag.size < asize {
      return false;
    }

    self.disconnect(next);
    let total = old + next_tag.size;
    let rest = total - asize;
    if rest >= MIN_BLOCK_SIZE {
      self.arena.set_tags(block, asize, true);
      let tail = self.arena.next_block(block);
      self.arena.set_tags(tail, rest, false);
      self.insert(tail);
    } else {
      self.arena.set_tags(block, total, true);
    }
    true
  }

  #[inline(always)]
  fn tripwire(&self) {
    #[cfg(feature = "debug-tripwire")]
    if let Err(err) = self.check() {
      panic!("heap invariant broken: {err}");
    }
  }
}

/// Iterator over `(block, header)` in address order.
pub(crate) struct Blocks<'a, S> {
  arena: &'a Arena<S>,
  next: usize,
}

impl<S: HeapSource> Iterator for Blocks<'_, S> {
  type Item = (Block, Tag);

  fn next(&mut self) -> Option<Self::Item> {
    if self.next > self.arena.len() {
      return None;
    }
    let block = Block::new(self.next);
    let tag = self.arena.header(block);
    if tag.size == 0 {
      // Epilogue.
      return None;
    }
    self.next += tag.size;
    Some((block, tag))
  }
}

/// Block size for a request: payload plus tags, aligned, never below the
/// minimum block size.
#[inline]
fn adjust_size(size: usize) -> Result<usize, Error> {
  let padded = size
    .checked_add(DSIZE + ALIGNMENT - 1)
    .ok_or(Error::Overflow { requested: size })?;
  Ok((padded & !(ALIGNMENT - 1)).max(MIN_BLOCK_SIZE))
}
