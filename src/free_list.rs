//! Address-ordered, doubly-linked list of free blocks.
//!
//! The nodes live inside the free blocks themselves; the list only remembers
//! the offset of the lowest one. Two invariants hold between operations:
//!
//! - nodes appear in strictly ascending address order, and
//! - no node ends exactly where its successor begins (such pairs are merged on
//!   insertion).

use std::iter;

use crate::{
  block::{HEADER_SIZE, NODE_SIZE, TIGHT_FIT_SLACK},
  region::Region,
};

pub(crate) use crate::block::FreeNode;

/// Where a best-fit search placed an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Grant {
  /// Offset of the block, i.e. of its header.
  pub(crate) block: usize,
  /// Payload bytes available to the caller.
  pub(crate) payload: usize,
}

#[derive(Debug, Default)]
pub(crate) struct FreeList {
  head: Option<FreeNode>,
}

impl FreeList {
  pub(crate) const fn new() -> Self {
    Self { head: None }
  }

  pub(crate) fn iter<'a>(
    &self,
    region: &'a Region,
  ) -> impl Iterator<Item = FreeNode> + 'a {
    iter::successors(self.head, move |node| node.next(region))
  }

  /// The free block with the highest address.
  pub(crate) fn last(
    &self,
    region: &Region,
  ) -> Option<FreeNode> {
    self.iter(region).last()
  }

  /// Inserts `block` at its address-ordered position, merging it with the
  /// neighbours it touches.
  ///
  /// `block` must already carry its size; its links are overwritten.
  pub(crate) fn insert(
    &mut self,
    region: &mut Region,
    block: FreeNode,
  ) {
    if self.head.is_none() {
      block.set_prev(region, None);
      block.set_next(region, None);
      self.head = Some(block);
      return;
    }

    let mut left = None;
    let mut right = self.head;
    while let Some(node) = right {
      if node > block {
        break;
      }
      assert_ne!(node, block, "block {:#x} is already free", block.offset());
      left = Some(node);
      right = node.next(region);
    }

    if let Some(left) = left {
      assert!(
        left.end(region) <= block.offset(),
        "block {:#x} overlaps free block {:#x}",
        block.offset(),
        left.offset()
      );
    }
    if let Some(right) = right {
      assert!(
        block.end(region) <= right.offset(),
        "block {:#x} overlaps free block {:#x}",
        block.offset(),
        right.offset()
      );
    }

    let joins_left = left.filter(|left| left.end(region) == block.offset());
    let joins_right = right.filter(|right| block.end(region) == right.offset());

    match (joins_left, joins_right) {
      (Some(left), Some(right)) => {
        let size = left.size(region) + block.span(region) + right.span(region);
        left.set_size(region, size);
        self.splice(region, Some(left), right.next(region));
      }
      (Some(left), None) => {
        let size = left.size(region) + block.span(region);
        left.set_size(region, size);
      }
      (None, Some(right)) => {
        let size = block.size(region) + right.span(region);
        block.set_size(region, size);
        self.splice(region, left, Some(block));
        self.splice(region, Some(block), right.next(region));
      }
      (None, None) => {
        self.splice(region, left, Some(block));
        self.splice(region, Some(block), right);
      }
    }
  }

  /// Best-fit search for a block spanning at least `size_required` bytes.
  ///
  /// A tight fit is taken out of the list whole and ends the scan early.
  /// Otherwise the smallest block with room to spare gives up its tail, which
  /// leaves its position in the list untouched.
  pub(crate) fn find(
    &mut self,
    region: &mut Region,
    size_required: usize,
  ) -> Option<Grant> {
    let mut best: Option<(FreeNode, usize)> = None;

    let mut cursor = self.head;
    while let Some(node) = cursor {
      let span = node.span(region);
      if span >= size_required && span - size_required <= TIGHT_FIT_SLACK {
        self.unlink(region, node);
        return Some(Grant {
          block: node.offset(),
          payload: span - HEADER_SIZE,
        });
      }

      let size = node.size(region);
      if size > size_required {
        let slack = size - size_required;
        if best.is_none_or(|(_, best_slack)| slack < best_slack) {
          best = Some((node, slack));
        }
      }
      cursor = node.next(region);
    }

    let (node, slack) = best?;
    node.set_size(region, slack);
    Some(Grant {
      block: node.end(region),
      payload: size_required - HEADER_SIZE,
    })
  }

  fn unlink(
    &mut self,
    region: &mut Region,
    node: FreeNode,
  ) {
    self.splice(region, node.prev(region), node.next(region));
  }

  /// Makes `right` follow `left`, either end standing for the list boundary.
  fn splice(
    &mut self,
    region: &mut Region,
    left: Option<FreeNode>,
    right: Option<FreeNode>,
  ) {
    match left {
      Some(left) => left.set_next(region, right),
      None => self.head = right,
    }
    if let Some(right) = right {
      right.set_prev(region, left);
    }
  }
}

const _: () = assert!(TIGHT_FIT_SLACK >= NODE_SIZE);
