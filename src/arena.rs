//! Byte-addressed view of the managed heap.
//!
//! Blocks are named by the offset of their payload from the heap base. The
//! header word sits just below the payload and the footer word closes the
//! block, so both neighbors of any block are one tag read away.

use crate::source::HeapSource;
use crate::{DSIZE, WSIZE};

/// A block, identified by its payload offset.
///
/// Offset 0 is the alignment pad at the very start of the heap and is never
/// a payload, so it doubles as the "no link" encoding in free-list nodes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub(crate) struct Block(usize);

impl Block {
  #[inline(always)]
  pub(crate) const fn new(offset: usize) -> Self {
    debug_assert!(offset != 0);
    Self(offset)
  }

  #[inline(always)]
  pub(crate) const fn offset(self) -> usize {
    self.0
  }

  #[inline(always)]
  const fn header(self) -> usize {
    self.0 - WSIZE
  }

  #[inline(always)]
  const fn link(word: u64) -> Option<Block> {
    if word == 0 {
      None
    } else {
      Some(Block(word as usize))
    }
  }

  #[inline(always)]
  const fn word(link: Option<Block>) -> u64 {
    match link {
      Some(Block(offset)) => offset as u64,
      None => 0,
    }
  }
}

/// Boundary tag: block size with the allocated flag in bit 0.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Tag {
  pub(crate) size: usize,
  pub(crate) allocated: bool,
}

impl Tag {
  const ALLOCATED: u64 = 0x1;
  const FLAGS: u64 = 0xF;

  #[inline(always)]
  pub(crate) const fn new(size: usize, allocated: bool) -> Self {
    Self { size, allocated }
  }

  #[inline(always)]
  const fn pack(self) -> u64 {
    debug_assert!((self.size as u64) & Self::FLAGS == 0);
    self.size as u64 | if self.allocated { Self::ALLOCATED } else { 0 }
  }

  #[inline(always)]
  pub(crate) const fn unpack(word: u64) -> Self {
    Self {
      size: (word & !Self::FLAGS) as usize,
      allocated: (word & Self::ALLOCATED) != 0,
    }
  }
}

/// Links of a free block, stored in the first two payload words.
///
/// Only meaningful while the block is free; allocation hands those words
/// back to the caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) struct FreeNode {
  pub(crate) next: Option<Block>,
  pub(crate) prev: Option<Block>,
}

/// The heap image, backed by a [`HeapSource`].
pub(crate) struct Arena<S> {
  source: S,
}

impl<S: HeapSource> Arena<S> {
  pub(crate) fn new(source: S) -> Self {
    Self { source }
  }

  pub(crate) fn source(&self) -> &S {
    &self.source
  }

  pub(crate) fn source_mut(&mut self) -> &mut S {
    &mut self.source
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.source.as_slice().len()
  }

  #[inline]
  pub(crate) fn bytes(&self) -> &[u8] {
    self.source.as_slice()
  }

  #[inline]
  pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
    self.source.as_mut_slice()
  }

  // === Words ===

  #[inline]
  pub(crate) fn word(&self, offset: usize) -> u64 {
    debug_assert!(offset % WSIZE == 0, "unaligned word read at {offset:#x}");
    debug_assert!(offset + WSIZE <= self.len(), "word read at {offset:#x} past the break");
    let mut bytes = [0; WSIZE];
    bytes.copy_from_slice(&self.bytes()[offset..offset + WSIZE]);
    u64::from_ne_bytes(bytes)
  }

  #[inline]
  pub(crate) fn set_word(&mut self, offset: usize, value: u64) {
    debug_assert!(offset % WSIZE == 0, "unaligned word write at {offset:#x}");
    debug_assert!(offset + WSIZE <= self.len(), "word write at {offset:#x} past the break");
    self.bytes_mut()[offset..offset + WSIZE].copy_from_slice(&value.to_ne_bytes());
  }

  // === Tags ===

  #[inline]
  pub(crate) fn tag_at(&self, offset: usize) -> Tag {
    Tag::unpack(self.word(offset))
  }

  #[inline]
  pub(crate) fn set_tag_at(&mut self, offset: usize, tag: Tag) {
    self.set_word(offset, tag.pack());
  }

  #[inline]
  pub(crate) fn header(&self, block: Block) -> Tag {
    self.tag_at(block.header())
  }

  #[inline]
  pub(crate) fn footer(&self, block: Block) -> Tag {
    let size = self.header(block).size;
    self.tag_at(block.offset() + size - DSIZE)
  }

  #[inline]
  pub(crate) fn size(&self, block: Block) -> usize {
    self.header(block).size
  }

  #[inline]
  pub(crate) fn is_allocated(&self, block: Block) -> bool {
    self.header(block).allocated
  }

  /// Writes identical header and footer tags.
  #[inline]
  pub(crate) fn set_tags(&mut self, block: Block, size: usize, allocated: bool) {
    let tag = Tag::new(size, allocated);
    self.set_tag_at(block.header(), tag);
    self.set_tag_at(block.offset() + size - DSIZE, tag);
  }

  // === Neighbors ===

  #[inline]
  pub(crate) fn next_block(&self, block: Block) -> Block {
    Block::new(block.offset() + self.size(block))
  }

  /// Tag of the block physically before `block`, read from its footer.
  #[inline]
  pub(crate) fn prev_tag(&self, block: Block) -> Tag {
    self.tag_at(block.offset() - DSIZE)
  }

  #[inline]
  pub(crate) fn prev_block(&self, block: Block) -> Block {
    Block::new(block.offset() - self.prev_tag(block).size)
  }

  // === Free-list nodes ===

  #[inline]
  pub(crate) fn node(&self, block: Block) -> FreeNode {
    debug_assert!(!self.is_allocated(block), "node read on allocated block {block:?}");
    FreeNode {
      next: Block::link(self.word(block.offset())),
      prev: Block::link(self.word(block.offset() + WSIZE)),
    }
  }

  #[inline]
  pub(crate) fn set_node(&mut self, block: Block, node: FreeNode) {
    self.set_next(block, node.next);
    self.set_prev(block, node.prev);
  }

  #[inline]
  pub(crate) fn set_next(&mut self, block: Block, next: Option<Block>) {
    self.set_word(block.offset(), Block::word(next));
  }

  #[inline]
  pub(crate) fn set_prev(&mut self, block: Block, prev: Option<Block>) {
    self.set_word(block.offset() + WSIZE, Block::word(prev));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::VecHeap;

  fn arena(len: usize) -> Arena<VecHeap> {
    let mut source = VecHeap::with_limit(len);
    source.grow(len).unwrap();
    Arena::new(source)
  }

  #[test]
  fn tag_packs_size_and_flag() {
    let tag = Tag::new(96, true);
    assert_eq!(tag.pack(), 97);
    assert_eq!(Tag::unpack(97), tag);
    assert_eq!(Tag::unpack(96), Tag::new(96, false));
  }

  #[test]
  fn tags_and_neighbors() {
    let mut arena = arena(256);
    let first = Block::new(32);
    arena.set_tags(first, 64, true);
    let second = arena.next_block(first);
    assert_eq!(second.offset(), 96);
    arena.set_tags(second, 48, false);

    assert_eq!(arena.header(first), arena.footer(first));
    assert_eq!(arena.header(second), Tag::new(48, false));
    assert_eq!(arena.prev_tag(second), Tag::new(64, true));
    assert_eq!(arena.prev_block(second), first);
  }

  #[test]
  fn node_links_round_trip_through_payload() {
    let mut arena = arena(256);
    let block = Block::new(32);
    arena.set_tags(block, 64, false);
    assert_eq!(arena.node(block), FreeNode::default());

    let node = FreeNode {
      next: Some(Block::new(160)),
      prev: None,
    };
    arena.set_node(block, node);
    assert_eq!(arena.node(block), node);
    assert_eq!(arena.word(32), 160);
    assert_eq!(arena.word(40), 0);
  }
}
