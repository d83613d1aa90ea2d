//! Heap consistency checker.
//!
//! Walks the heap twice: once in address order over the boundary tags, once
//! along every free list. Reports the first invariant breach it meets.

use std::collections::HashSet;

use crate::arena::Block;
use crate::class::{CLASS_COUNT, class_of};
use crate::error::CheckError;
use crate::heap::{FIRST_BLOCK, Heap};
use crate::source::HeapSource;
use crate::{ALIGNMENT, DSIZE, MIN_BLOCK_SIZE, WSIZE};

impl<S: HeapSource> Heap<S> {
  /// Verifies every structural invariant of the heap.
  ///
  /// - header and footer of each block agree,
  /// - payloads are aligned and blocks are at least the minimum size,
  /// - no two free blocks are physical neighbors,
  /// - each free block sits on exactly one list, the one for its size,
  /// - list links agree in both directions.
  pub fn check(&self) -> Result<(), CheckError> {
    let free = self.check_blocks()?;
    self.check_lists(free)
  }

  /// Address-order walk. Returns the number of free blocks seen.
  fn check_blocks(&self) -> Result<usize, CheckError> {
    let arena = &self.arena;
    let len = arena.len();

    let prologue = arena.tag_at(WSIZE);
    if prologue.size != DSIZE || !prologue.allocated || arena.tag_at(2 * WSIZE) != prologue {
      return Err(CheckError::Sentinel { offset: WSIZE });
    }

    let mut offset = FIRST_BLOCK;
    let mut prev_free: Option<usize> = None;
    let mut free = 0;
    loop {
      if offset > len {
        return Err(CheckError::Overrun { offset });
      }
      let block = Block::new(offset);
      let header = arena.header(block);
      if header.size == 0 {
        if !header.allocated || offset != len {
          return Err(CheckError::Sentinel { offset: offset - WSIZE });
        }
        return Ok(free);
      }

      if offset % ALIGNMENT != 0 {
        return Err(CheckError::Misaligned { offset });
      }
      if header.size < MIN_BLOCK_SIZE {
        return Err(CheckError::Undersized {
          offset,
          size: header.size,
        });
      }
      if offset + header.size > len {
        return Err(CheckError::Overrun { offset });
      }

      let footer = arena.footer(block);
      if footer != header {
        return Err(CheckError::TagMismatch {
          offset,
          header_size: header.size,
          header_alloc: header.allocated,
          footer_size: footer.size,
          footer_alloc: footer.allocated,
        });
      }

      if header.allocated {
        prev_free = None;
      } else {
        if let Some(first) = prev_free {
          return Err(CheckError::AdjacentFree {
            first,
            second: offset,
          });
        }
        prev_free = Some(offset);
        free += 1;
      }
      offset += header.size;
    }
  }

  /// List walk. `free` is the number of free blocks found in address order.
  fn check_lists(&self, free: usize) -> Result<(), CheckError> {
    let arena = &self.arena;
    let mut seen = HashSet::with_capacity(free);

    for class in 0..CLASS_COUNT {
      let mut prev: Option<Block> = None;
      let mut cursor = self.roots.head(class);
      while let Some(block) = cursor {
        let offset = block.offset();
        if offset < FIRST_BLOCK || offset + DSIZE > arena.len() {
          return Err(CheckError::Overrun { offset });
        }
        if !seen.insert(block) {
          return Err(CheckError::Duplicate { offset });
        }

        let header = arena.header(block);
        if header.allocated {
          return Err(CheckError::ListedAllocated { offset, class });
        }
        let expected = class_of(header.size);
        if expected != class {
          return Err(CheckError::WrongClass {
            offset,
            size: header.size,
            found: class,
            expected,
          });
        }

        let node = arena.node(block);
        if node.prev != prev {
          return Err(CheckError::BrokenLink { offset });
        }
        prev = Some(block);
        cursor = node.next;
      }
    }

    if seen.len() != free {
      return Err(CheckError::Unlisted {
        listed: seen.len(),
        free,
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arena::Tag;
  use crate::source::VecHeap;

  fn heap() -> Heap<VecHeap> {
    Heap::new(VecHeap::with_limit(1 << 16)).unwrap()
  }

  #[test]
  fn fresh_heap_is_consistent() {
    assert_eq!(heap().check(), Ok(()));
  }

  #[test]
  fn detects_tag_mismatch() {
    let mut heap = heap();
    let p = heap.allocate(40).unwrap().unwrap();
    let footer = p.offset() + 64 - DSIZE;
    heap.arena.set_tag_at(footer, Tag::new(64, false));
    assert!(matches!(heap.check(), Err(CheckError::TagMismatch { .. })));
  }

  #[test]
  fn detects_adjacent_free_blocks() {
    let mut heap = heap();
    let p = heap.allocate(40).unwrap().unwrap();
    // Flip the tags behind the allocator's back; the tail chunk is free too.
    heap.arena.set_tags(Block::new(p.offset()), 64, false);
    assert_eq!(
      heap.check(),
      Err(CheckError::AdjacentFree {
        first: p.offset(),
        second: p.offset() + 64,
      })
    );
  }

  #[test]
  fn detects_unlisted_free_block() {
    let mut heap = heap();
    let p = heap.allocate(40).unwrap().unwrap();
    let _guard = heap.allocate(40).unwrap().unwrap();
    heap.arena.set_tags(Block::new(p.offset()), 64, false);
    assert_eq!(heap.check(), Err(CheckError::Unlisted { listed: 1, free: 2 }));
  }

  #[test]
  fn detects_wrong_class_and_broken_links() {
    let mut heap = heap();
    let head = heap.roots.head(class_of(heap.stats().largest_free)).unwrap();
    heap.roots.set_head(0, Some(head));
    assert!(matches!(heap.check(), Err(CheckError::WrongClass { found: 0, .. })));

    let mut heap = self::heap();
    let head = heap.roots.head(class_of(heap.stats().largest_free)).unwrap();
    heap.arena.set_prev(head, Some(Block::new(FIRST_BLOCK + 512)));
    assert_eq!(
      heap.check(),
      Err(CheckError::BrokenLink {
        offset: head.offset()
      })
    );
  }

  #[test]
  fn detects_allocated_block_on_a_list() {
    let mut heap = heap();
    let p = heap.allocate(40).unwrap().unwrap();
    heap.roots.set_head(class_of(64), Some(Block::new(p.offset())));
    assert!(matches!(heap.check(), Err(CheckError::ListedAllocated { .. })));
  }

  #[test]
  fn detects_damaged_epilogue() {
    let mut heap = heap();
    let end = heap.heap_size() - WSIZE;
    heap.arena.set_tag_at(end, Tag::new(0, false));
    assert!(matches!(heap.check(), Err(CheckError::Sentinel { .. })));
  }
}
