use std::ptr::NonNull;

use crate::block::ALIGN;

/// The contiguous span of memory handed out by a heap extender.
///
/// Blocks are addressed by byte offsets from `base`. Every access is checked
/// against the current length, so a bad offset computed from corrupted
/// metadata stops at an assertion instead of touching foreign memory.
pub(crate) struct Region {
  base: NonNull<u8>,
  len: usize,
}

impl Region {
  pub(crate) fn new(
    base: NonNull<u8>,
    len: usize,
  ) -> Self {
    assert!(
      base.addr().get().is_multiple_of(ALIGN),
      "region base {base:p} must be {ALIGN}-byte aligned"
    );
    Self { base, len }
  }

  pub(crate) fn len(&self) -> usize {
    self.len
  }

  /// One byte past the last managed byte.
  pub(crate) fn end(&self) -> NonNull<u8> {
    self.pointer(self.len)
  }

  pub(crate) fn grow(
    &mut self,
    n_bytes: usize,
  ) {
    self.len += n_bytes;
  }

  pub(crate) fn pointer(
    &self,
    offset: usize,
  ) -> NonNull<u8> {
    assert!(offset <= self.len, "offset {offset:#x} past heap end {:#x}", self.len);
    unsafe { self.base.add(offset) }
  }

  /// Maps an address back to its offset if it lies inside the region.
  pub(crate) fn offset_of(
    &self,
    ptr: NonNull<u8>,
  ) -> Option<usize> {
    ptr
      .addr()
      .get()
      .checked_sub(self.base.addr().get())
      .filter(|offset| *offset < self.len)
  }

  pub(crate) fn read_u32(
    &self,
    offset: usize,
  ) -> u32 {
    self.check(offset, size_of::<u32>());
    unsafe { self.base.add(offset).cast::<u32>().read() }
  }

  pub(crate) fn write_u32(
    &mut self,
    offset: usize,
    value: u32,
  ) {
    self.check(offset, size_of::<u32>());
    unsafe { self.base.add(offset).cast::<u32>().write(value) }
  }

  pub(crate) fn read_u64(
    &self,
    offset: usize,
  ) -> u64 {
    self.check(offset, size_of::<u64>());
    unsafe { self.base.add(offset).cast::<u64>().read() }
  }

  pub(crate) fn write_u64(
    &mut self,
    offset: usize,
    value: u64,
  ) {
    self.check(offset, size_of::<u64>());
    unsafe { self.base.add(offset).cast::<u64>().write(value) }
  }

  fn check(
    &self,
    offset: usize,
    width: usize,
  ) {
    assert!(
      offset.checked_add(width).is_some_and(|end| end <= self.len),
      "access of {width} bytes at {offset:#x} outside heap of {:#x} bytes",
      self.len
    );
    assert!(
      offset.is_multiple_of(width),
      "misaligned access of {width} bytes at {offset:#x}"
    );
  }
}
