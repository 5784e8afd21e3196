//! In-band block metadata.
//!
//! ```text
//!   Allocated block                      Free block
//!   ┌──────────┬──────────┬─────────┐    ┌──────────┬──────────┬──────────┬──────────┬─────────┐
//!   │ size u32 │ tag  u32 │ payload │    │ size u32 │ tag = 0  │ prev u64 │ next u64 │  spare  │
//!   └──────────┴──────────┴─────────┘    └──────────┴──────────┴──────────┴──────────┴─────────┘
//!   ◄──── HEADER_SIZE ───►                ◄─────────────── NODE_SIZE ────────────────►
//! ```
//!
//! Both layouts start with the same `size`/`tag` pair, so a released block
//! keeps a zero tag where its header used to be.

use crate::region::Region;

/// Allocation granularity and minimum alignment of every payload.
pub const ALIGN: usize = 8;

/// Bytes of metadata in front of every allocated payload.
pub const HEADER_SIZE: usize = 8;

/// Bytes of metadata at the start of every free block.
pub const NODE_SIZE: usize = 24;

/// Smallest payload handed out, so a released block can hold a free node.
pub const MIN_PAYLOAD: usize = NODE_SIZE - HEADER_SIZE;

/// A free block whose span exceeds the request by no more than this is handed
/// out whole instead of being split.
pub const TIGHT_FIT_SLACK: usize = NODE_SIZE;

/// Upper bound on the managed region. Keeps every block size within the
/// 32-bit size field.
pub const MAX_HEAP_SIZE: usize = 1 << 31;

/// Tag written into the header of every allocated block.
pub(crate) const MAGIC: u32 = 0x5AFE_B10C;

/// Tag left behind by a release.
pub(crate) const RELEASED: u32 = 0;

const NIL: u64 = u64::MAX;

const SIZE_FIELD: usize = 0;
const TAG_FIELD: usize = 4;
const PREV_FIELD: usize = 8;
const NEXT_FIELD: usize = 16;

/// Header of an allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
  /// Payload bytes granted to the caller.
  pub(crate) size: usize,
  pub(crate) tag: u32,
}

impl Header {
  pub(crate) fn read(
    region: &Region,
    block: usize,
  ) -> Self {
    Self {
      size: region.read_u32(block + SIZE_FIELD) as usize,
      tag: region.read_u32(block + TAG_FIELD),
    }
  }

  /// Marks `block` as allocated with a payload of `size` bytes.
  pub(crate) fn write(
    region: &mut Region,
    block: usize,
    size: usize,
  ) {
    region.write_u32(block + SIZE_FIELD, to_u32(size));
    region.write_u32(block + TAG_FIELD, MAGIC);
  }

  pub(crate) fn clear_tag(
    region: &mut Region,
    block: usize,
  ) {
    region.write_u32(block + TAG_FIELD, RELEASED);
  }
}

/// A free block, identified by its offset in the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct FreeNode(usize);

impl FreeNode {
  /// Writes a fresh, unlinked node of `size` spare bytes at `offset`.
  pub(crate) fn create(
    region: &mut Region,
    offset: usize,
    size: usize,
  ) -> Self {
    let node = Self(offset);
    node.set_size(region, size);
    region.write_u32(offset + TAG_FIELD, RELEASED);
    node.set_prev(region, None);
    node.set_next(region, None);
    node
  }

  pub(crate) fn offset(self) -> usize {
    self.0
  }

  /// Bytes available after the node metadata.
  pub(crate) fn size(
    self,
    region: &Region,
  ) -> usize {
    region.read_u32(self.0 + SIZE_FIELD) as usize
  }

  pub(crate) fn set_size(
    self,
    region: &mut Region,
    size: usize,
  ) {
    region.write_u32(self.0 + SIZE_FIELD, to_u32(size));
  }

  /// Total bytes covered by the block, metadata included.
  pub(crate) fn span(
    self,
    region: &Region,
  ) -> usize {
    NODE_SIZE + self.size(region)
  }

  /// Offset one past the last byte of the block.
  pub(crate) fn end(
    self,
    region: &Region,
  ) -> usize {
    self.0 + self.span(region)
  }

  pub(crate) fn prev(
    self,
    region: &Region,
  ) -> Option<Self> {
    read_link(region, self.0 + PREV_FIELD)
  }

  pub(crate) fn set_prev(
    self,
    region: &mut Region,
    prev: Option<Self>,
  ) {
    write_link(region, self.0 + PREV_FIELD, prev);
  }

  pub(crate) fn next(
    self,
    region: &Region,
  ) -> Option<Self> {
    read_link(region, self.0 + NEXT_FIELD)
  }

  pub(crate) fn set_next(
    self,
    region: &mut Region,
    next: Option<Self>,
  ) {
    write_link(region, self.0 + NEXT_FIELD, next);
  }
}

fn read_link(
  region: &Region,
  field: usize,
) -> Option<FreeNode> {
  match region.read_u64(field) {
    NIL => None,
    offset => Some(FreeNode(offset as usize)),
  }
}

fn write_link(
  region: &mut Region,
  field: usize,
  node: Option<FreeNode>,
) {
  region.write_u64(field, node.map_or(NIL, |node| node.0 as u64));
}

fn to_u32(size: usize) -> u32 {
  u32::try_from(size).unwrap_or_else(|_| panic!("block size {size:#x} exceeds the size field"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::region::tests::with_region;

  #[test]
  fn test_header_round_trip() {
    with_region(64, |region| {
      Header::write(region, 16, 40);
      assert_eq!(Header::read(region, 16), Header { size: 40, tag: MAGIC });

      Header::clear_tag(region, 16);
      assert_eq!(Header::read(region, 16).tag, RELEASED);
    });
  }

  #[test]
  fn test_released_header_reads_as_free_node() {
    with_region(64, |region| {
      Header::write(region, 0, 40);
      Header::clear_tag(region, 0);

      let node = FreeNode::create(region, 0, 40 + HEADER_SIZE - NODE_SIZE);
      assert_eq!(node.span(region), HEADER_SIZE + 40);
      assert_eq!(Header::read(region, 0).tag, RELEASED);
      assert_eq!(node.prev(region), None);
      assert_eq!(node.next(region), None);
    });
  }

  #[test]
  fn test_links() {
    with_region(96, |region| {
      let a = FreeNode::create(region, 0, 8);
      let b = FreeNode::create(region, 48, 24);
      a.set_next(region, Some(b));
      b.set_prev(region, Some(a));

      assert_eq!(a.end(region), 32);
      assert_eq!(b.end(region), 96);
      assert_eq!(a.next(region), Some(b));
      assert_eq!(b.prev(region), Some(a));
      assert_eq!(b.next(region), None);
    });
  }
}
