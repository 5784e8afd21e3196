//! The single-threaded allocator core.
//!
//! [`Heap`] owns the managed region, the free list and the extender that grows
//! the region. [`Allocator`](crate::Allocator) adds the lock around it.

use std::ptr::NonNull;

use log::{debug, error, info, trace, warn};
use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
  ALIGN, align, align_to,
  block::{HEADER_SIZE, Header, MAGIC, MAX_HEAP_SIZE, MIN_PAYLOAD, NODE_SIZE, RELEASED},
  config::Config,
  error::{
    AllocError, BrokenLinkSnafu, CheckError, CorruptedSnafu, DoubleReleaseSnafu, ExhaustedSnafu,
    ExtendError, ExtensionSnafu, ForeignSnafu, InitError, InitialExtensionSnafu,
    LimitExceededSnafu, NonContiguousSnafu, NullPointerSnafu, OverrunSnafu, ReleaseError,
    StraySnafu, TooLargeSnafu, UnknownBlockSnafu, UnmergedSnafu, UnorderedSnafu,
  },
  extender::HeapExtender,
  free_list::{FreeList, FreeNode, Grant},
  region::Region,
};

/// A free block as seen from outside the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
  /// Offset of the block from the start of the managed region.
  pub offset: usize,
  /// Total bytes covered by the block, metadata included.
  pub span: usize,
}

/// A snapshot of heap usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Size of the managed region. It only grows, so this is also its peak.
  pub heap_size: usize,
  /// Calls made to the extender, the initial one included.
  pub extensions: usize,
  pub allocated_blocks: usize,
  pub free_blocks: usize,
  /// Total span of all free blocks.
  pub free_bytes: usize,
  /// Span of the largest free block.
  pub largest_free: usize,
}

/// A best-fit heap over a region grown by `E`.
///
/// `Heap` is not synchronized; share it through
/// [`Allocator`](crate::Allocator).
pub struct Heap<E> {
  extender: E,
  config: Config,
  region: Region,
  free_list: FreeList,
  extensions: usize,
  allocated_blocks: usize,
}

unsafe impl<E> Send for Heap<E> where E: Send {}

impl<E> Heap<E>
where
  E: HeapExtender,
{
  /// Requests the initial pages from `extender` and makes them one free block.
  pub fn new(
    mut extender: E,
    config: Config,
  ) -> Result<Self, InitError> {
    let n_bytes = config.initial_size(extender.page_size())?;
    let base = extender
      .extend(n_bytes)
      .context(InitialExtensionSnafu { n_bytes })?;

    let mut heap = Self {
      extender,
      config,
      region: Region::new(base, n_bytes),
      free_list: FreeList::new(),
      extensions: 1,
      allocated_blocks: 0,
    };
    let node = FreeNode::create(&mut heap.region, 0, n_bytes - NODE_SIZE);
    heap.free_list.insert(&mut heap.region, node);

    info!("heap initialized at {base:p} with {n_bytes} bytes");
    Ok(heap)
  }

  /// Allocates at least `size` bytes, aligned to [`ALIGN`].
  ///
  /// The heap grows at most once per call. Its last free block is counted
  /// towards the request when it reaches the current end of the region.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let size_required = Self::size_required(size)?;

    if let Some(ptr) = self.grant(size_required) {
      return Ok(ptr);
    }

    self.extend_for(size_required).context(ExtensionSnafu { size })?;
    self.grant(size_required).context(ExhaustedSnafu { size })
  }

  /// Returns a block obtained from [`allocate`](Self::allocate) to the heap.
  ///
  /// The pointer is validated before anything is modified; a rejected pointer
  /// leaves the heap untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must not be used after a successful release. Releasing a pointer
  /// into the middle of a live block whose contents mimic a block header
  /// corrupts the heap.
  pub unsafe fn release(
    &mut self,
    ptr: *mut u8,
  ) -> Result<(), ReleaseError> {
    let ptr = NonNull::new(ptr).context(NullPointerSnafu)?;
    let addr = ptr.addr().get();

    let payload = self
      .region
      .offset_of(ptr)
      .filter(|offset| *offset >= HEADER_SIZE && offset.is_multiple_of(ALIGN));
    let Some(payload) = payload else {
      warn!("rejected release of foreign pointer {ptr:p}");
      return ForeignSnafu { addr }.fail();
    };

    let block = payload - HEADER_SIZE;
    let header = Header::read(&self.region, block);
    match header.tag {
      MAGIC => {}
      RELEASED => {
        warn!("rejected release of {ptr:p}: already released");
        return DoubleReleaseSnafu { addr }.fail();
      }
      tag => {
        error!("rejected release of {ptr:p}: corrupted header tag {tag:#010x}");
        return CorruptedSnafu { addr, tag, size: header.size }.fail();
      }
    }
    if header.size < MIN_PAYLOAD || header.size > self.region.len() - payload {
      error!("rejected release of {ptr:p}: corrupted header size {}", header.size);
      return CorruptedSnafu {
        addr,
        tag: header.tag,
        size: header.size,
      }
      .fail();
    }

    Header::clear_tag(&mut self.region, block);
    let node = FreeNode::create(&mut self.region, block, HEADER_SIZE + header.size - NODE_SIZE);
    self.free_list.insert(&mut self.region, node);
    self.allocated_blocks -= 1;

    trace!("released {} bytes at {ptr:p}", header.size);
    Ok(())
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn extender(&self) -> &E {
    &self.extender
  }

  /// Free blocks in ascending address order.
  pub fn free_blocks(&self) -> impl Iterator<Item = FreeBlock> + '_ {
    self.free_list.iter(&self.region).map(|node| FreeBlock {
      offset: node.offset(),
      span: node.span(&self.region),
    })
  }

  /// Offset of `ptr` from the start of the managed region.
  pub fn offset_of(
    &self,
    ptr: NonNull<u8>,
  ) -> Option<usize> {
    self.region.offset_of(ptr)
  }

  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      heap_size: self.region.len(),
      extensions: self.extensions,
      allocated_blocks: self.allocated_blocks,
      ..HeapStats::default()
    };
    for block in self.free_blocks() {
      stats.free_blocks += 1;
      stats.free_bytes += block.span;
      stats.largest_free = stats.largest_free.max(block.span);
    }
    stats
  }

  /// Walks the whole region and verifies the block partition.
  ///
  /// Every byte must belong to exactly one block, free blocks must be listed
  /// in ascending order with consistent back links, no two free blocks may
  /// touch, and every other block must carry a live header.
  pub fn check(&self) -> Result<(), CheckError> {
    let len = self.region.len();
    let mut free = self.free_list.iter(&self.region).peekable();
    let mut prev_free: Option<FreeNode> = None;
    let mut last_was_free = false;
    let mut offset = 0;

    while offset < len {
      let span = match free.next_if(|node| node.offset() == offset) {
        Some(node) => {
          ensure!(node.prev(&self.region) == prev_free, BrokenLinkSnafu { offset });
          if last_was_free {
            let left = prev_free.map_or(0, FreeNode::offset);
            return UnmergedSnafu { left, right: offset }.fail();
          }
          prev_free = Some(node);
          last_was_free = true;
          node.span(&self.region)
        }
        None => {
          if let Some(next_free) = free.peek().filter(|node| node.offset() < offset) {
            let next = next_free.offset();
            return match prev_free {
              Some(prev) if next <= prev.offset() => UnorderedSnafu {
                offset: next,
                prev: prev.offset(),
              }
              .fail(),
              _ => StraySnafu { offset: next }.fail(),
            };
          }
          let header = Header::read(&self.region, offset);
          ensure!(
            header.tag == MAGIC && header.size.is_multiple_of(ALIGN),
            UnknownBlockSnafu {
              offset,
              tag: header.tag,
            }
          );
          last_was_free = false;
          HEADER_SIZE + header.size
        }
      };

      let end = offset + span;
      ensure!(end <= len, OverrunSnafu { offset, end, len });
      offset = end;
    }

    if let Some(node) = free.next() {
      return StraySnafu {
        offset: node.offset(),
      }
      .fail();
    }
    Ok(())
  }

  /// Payload rounding and header accounting for a request of `size` bytes.
  fn size_required(size: usize) -> Result<usize, AllocError> {
    ensure!(size <= MAX_HEAP_SIZE, TooLargeSnafu { size });
    let payload = align!(size.max(MIN_PAYLOAD));
    Ok(payload + HEADER_SIZE)
  }

  fn grant(
    &mut self,
    size_required: usize,
  ) -> Option<NonNull<u8>> {
    let Grant { block, payload } = self.free_list.find(&mut self.region, size_required)?;
    Header::write(&mut self.region, block, payload);
    self.allocated_blocks += 1;

    let ptr = self.region.pointer(block + HEADER_SIZE);
    trace!("granted {payload} bytes at {ptr:p}");
    Some(ptr)
  }

  /// Grows the region so that a block of `size_required` bytes fits, then
  /// hands the new memory to the free list.
  fn extend_for(
    &mut self,
    size_required: usize,
  ) -> Result<(), ExtendError> {
    let len = self.region.len();
    let page_size = self.extender.page_size();

    let tail = self
      .free_list
      .last(&self.region)
      .filter(|node| node.end(&self.region) == len)
      .map_or(0, |node| node.span(&self.region));
    let needed = size_required.saturating_sub(tail).max(1);
    let n_bytes = align_to!(needed, page_size);

    let limit = self.config.heap_limit();
    ensure!(
      n_bytes <= limit.saturating_sub(len),
      LimitExceededSnafu { n_bytes, limit }
    );

    let old_end = self.extender.extend(n_bytes)?;
    self.extensions += 1;
    let expected = self.region.end();
    ensure!(
      old_end == expected,
      NonContiguousSnafu {
        expected: expected.addr().get(),
        found: old_end.addr().get(),
      }
    );

    self.region.grow(n_bytes);
    let node = FreeNode::create(&mut self.region, len, n_bytes - NODE_SIZE);
    self.free_list.insert(&mut self.region, node);

    debug!(
      "extended heap by {n_bytes} bytes for {size_required} (tail of {tail} absorbed), now {} bytes",
      self.region.len()
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::extender::{Arena, DEFAULT_PAGE_SIZE};

  const PAGE: usize = DEFAULT_PAGE_SIZE;

  fn with_test_heap<F>(
    pages: usize,
    test_fn: F,
  ) where
    F: FnOnce(&mut Heap<Arena>),
  {
    let mut heap = Heap::new(Arena::new(pages * PAGE), Config::default()).unwrap();
    test_fn(&mut heap);
    heap.check().unwrap();
  }

  fn spans(heap: &Heap<Arena>) -> Vec<(usize, usize)> {
    heap
      .free_blocks()
      .map(|block| (block.offset, block.span))
      .collect()
  }

  #[test]
  fn test_initial_state() {
    with_test_heap(1, |heap| {
      assert_eq!(spans(heap), [(0, PAGE)]);
      assert_eq!(
        heap.stats(),
        HeapStats {
          heap_size: PAGE,
          extensions: 1,
          allocated_blocks: 0,
          free_blocks: 1,
          free_bytes: PAGE,
          largest_free: PAGE,
        }
      );
    });
  }

  #[test]
  fn test_size_rounding() {
    assert_eq!(Heap::<Arena>::size_required(0).unwrap(), 24);
    assert_eq!(Heap::<Arena>::size_required(10).unwrap(), 24);
    assert_eq!(Heap::<Arena>::size_required(16).unwrap(), 24);
    assert_eq!(Heap::<Arena>::size_required(17).unwrap(), 32);
    assert_eq!(Heap::<Arena>::size_required(8000).unwrap(), 8008);
    assert!(matches!(
      Heap::<Arena>::size_required(usize::MAX),
      Err(AllocError::TooLarge { .. })
    ));
  }

  #[test]
  fn test_allocation_comes_from_tail() {
    with_test_heap(1, |heap| {
      let ptr = heap.allocate(10).unwrap();
      assert_eq!(heap.offset_of(ptr), Some(PAGE - 16));
      assert_eq!(spans(heap), [(0, PAGE - 24)]);
      assert_eq!(heap.stats().allocated_blocks, 1);
    });
  }

  #[test]
  fn test_release_then_reuse_same_address() {
    with_test_heap(1, |heap| unsafe {
      let first = heap.allocate(10).unwrap();
      heap.release(first.as_ptr()).unwrap();
      assert_eq!(spans(heap), [(0, PAGE)]);

      let second = heap.allocate(10).unwrap();
      assert_eq!(first, second);
    });
  }

  #[test]
  fn test_tail_absorbed_before_extending() {
    with_test_heap(2, |heap| {
      let ptr = heap.allocate(8000).unwrap();

      let stats = heap.stats();
      assert_eq!(stats.extensions, 2);
      assert_eq!(stats.heap_size, 2 * PAGE);
      assert_eq!(heap.offset_of(ptr), Some(2 * PAGE - 8000));
      assert_eq!(spans(heap), [(0, 2 * PAGE - 8008)]);
    });
  }

  #[test]
  fn test_extension_without_free_tail() {
    with_test_heap(4, |heap| {
      // Fill the first page exactly so nothing free touches the end.
      let filler = heap.allocate(PAGE - HEADER_SIZE).unwrap();
      assert_eq!(heap.offset_of(filler), Some(HEADER_SIZE));
      assert_eq!(heap.free_blocks().count(), 0);

      heap.allocate(PAGE).unwrap();
      let stats = heap.stats();
      assert_eq!(stats.extensions, 2);
      assert_eq!(stats.heap_size, 3 * PAGE);
    });
  }

  #[test]
  fn test_middle_gap_is_reused() {
    with_test_heap(1, |heap| unsafe {
      let first = heap.allocate(1000).unwrap();
      let middle = heap.allocate(2000).unwrap();
      let last = heap.allocate(1000).unwrap();
      assert!(last < middle && middle < first);

      heap.release(middle.as_ptr()).unwrap();
      let gap = heap.offset_of(middle).unwrap() - HEADER_SIZE;
      assert_eq!(spans(heap), [(0, 72), (gap, 2008)]);

      let ptr = heap.allocate(1500).unwrap();
      let offset = heap.offset_of(ptr).unwrap();
      assert!(offset > gap && offset + 1500 <= gap + 2008);
      assert_eq!(heap.stats().extensions, 1);
    });
  }

  #[test]
  fn test_release_null() {
    with_test_heap(1, |heap| unsafe {
      let err = heap.release(std::ptr::null_mut()).unwrap_err();
      assert!(matches!(err, ReleaseError::NullPointer { .. }));
      assert_eq!(spans(heap), [(0, PAGE)]);
    });
  }

  #[test]
  fn test_double_release() {
    with_test_heap(1, |heap| unsafe {
      let ptr = heap.allocate(100).unwrap();
      heap.release(ptr.as_ptr()).unwrap();

      let err = heap.release(ptr.as_ptr()).unwrap_err();
      assert!(matches!(err, ReleaseError::DoubleRelease { .. }));
      assert!(!err.is_corruption());
      heap.check().unwrap();

      // The whole page is still one block.
      let ptr = heap.allocate(PAGE - HEADER_SIZE).unwrap();
      assert_eq!(heap.offset_of(ptr), Some(HEADER_SIZE));
      assert_eq!(heap.stats().extensions, 1);
    });
  }

  #[test]
  fn test_release_foreign_pointer() {
    with_test_heap(1, |heap| unsafe {
      let mut local = 0u64;
      let err = heap.release((&raw mut local).cast()).unwrap_err();
      assert!(matches!(err, ReleaseError::Foreign { .. }));

      let ptr = heap.allocate(64).unwrap();
      let err = heap.release(ptr.as_ptr().add(3)).unwrap_err();
      assert!(matches!(err, ReleaseError::Foreign { .. }));
    });
  }

  #[test]
  fn test_release_garbage_header() {
    with_test_heap(1, |heap| unsafe {
      let ptr = heap.allocate(64).unwrap();
      ptr.as_ptr().write_bytes(0xAB, 64);

      let err = heap.release(ptr.as_ptr().add(16)).unwrap_err();
      assert!(matches!(err, ReleaseError::Corrupted { tag: 0xABAB_ABAB, .. }));
      assert!(err.is_corruption());

      heap.release(ptr.as_ptr()).unwrap();
    });
  }

  #[test]
  fn test_extension_failure_leaves_heap_usable() {
    with_test_heap(1, |heap| unsafe {
      let ptr = heap.allocate(100).unwrap();

      let err = heap.allocate(2 * PAGE).unwrap_err();
      assert!(matches!(
        err,
        AllocError::Extension {
          source: ExtendError::LimitExceeded { .. },
          ..
        }
      ));
      assert_eq!(heap.stats().extensions, 1);

      heap.release(ptr.as_ptr()).unwrap();
      heap.allocate(100).unwrap();
    });
  }

  #[test]
  fn test_heap_limit_from_config() {
    let config = Config::default().max_heap_size(2 * PAGE);
    let mut heap = Heap::new(Arena::new(8 * PAGE), config).unwrap();

    heap.allocate(PAGE).unwrap();
    let err = heap.allocate(PAGE).unwrap_err();
    assert!(matches!(
      err,
      AllocError::Extension {
        source: ExtendError::LimitExceeded { limit, .. },
        ..
      } if limit == 2 * PAGE
    ));
    heap.check().unwrap();
  }

  #[test]
  fn test_check_detects_unmerged_blocks() {
    with_test_heap(1, |heap| {
      heap.allocate(40).unwrap();
      let block = heap.free_list.find(&mut heap.region, 48).unwrap();
      // Put the block back without coalescing.
      let node = FreeNode::create(&mut heap.region, block.block, 24);
      let tail = heap.free_list.last(&heap.region).unwrap();
      tail.set_next(&mut heap.region, Some(node));
      node.set_prev(&mut heap.region, Some(tail));

      assert_eq!(
        heap.check(),
        Err(CheckError::Unmerged {
          left: tail.offset(),
          right: block.block,
        })
      );

      // Restore a consistent heap for the closing check.
      tail.set_next(&mut heap.region, None);
      Header::write(&mut heap.region, block.block, block.payload);
    });
  }

  #[test]
  fn test_check_detects_stale_header() {
    with_test_heap(1, |heap| {
      let ptr = heap.allocate(40).unwrap();
      let block = heap.offset_of(ptr).unwrap() - HEADER_SIZE;
      Header::clear_tag(&mut heap.region, block);

      assert_eq!(
        heap.check(),
        Err(CheckError::UnknownBlock {
          offset: block,
          tag: RELEASED,
        })
      );

      Header::write(&mut heap.region, block, 40);
    });
  }
}
