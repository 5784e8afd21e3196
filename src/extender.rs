//! Sources of fresh heap memory.
//!
//! ```text
//!   before extend(n)                      after extend(n)
//!   ┌──────────────────────┐              ┌──────────────────────┬───────────┐
//!   │    managed region    │              │    managed region    │  n bytes  │
//!   └──────────────────────┘              └──────────────────────┴───────────┘
//!                          ▲                                     ▲
//!                          └── old end, returned by extend(n) ───┘
//! ```

use std::{
  alloc::{self, Layout},
  io,
  ptr::NonNull,
};

use libc::{c_void, intptr_t, sbrk};
use snafu::{IntoError as _, ResultExt as _, ensure};

use crate::error::{ExtendError, LimitExceededSnafu, RefusedSnafu, UnalignedSnafu};

/// Page size assumed when the platform cannot report one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Grows a contiguous memory region, like the program break does.
///
/// Every successful call must return the end of the memory handed out by the
/// previous call, so that the region stays one contiguous span.
pub trait HeapExtender {
  /// Grows the region by `n_bytes`, a positive multiple of
  /// [`page_size`](Self::page_size), and returns the previous end.
  fn extend(
    &mut self,
    n_bytes: usize,
  ) -> Result<NonNull<u8>, ExtendError>;

  fn page_size(&self) -> usize;
}

fn check_extension(
  n_bytes: usize,
  page_size: usize,
) -> Result<(), ExtendError> {
  ensure!(
    n_bytes > 0 && n_bytes.is_multiple_of(page_size),
    UnalignedSnafu { n_bytes, page_size }
  );
  Ok(())
}

/// The process's program break, moved with `sbrk(2)`.
///
/// Nothing else in the process may move the break while a heap built on this
/// extender is alive; the heap notices when it happens and refuses to grow.
#[derive(Debug)]
pub struct Sbrk {
  page_size: usize,
  page_aligned: bool,
}

impl Default for Sbrk {
  fn default() -> Self {
    Self::new()
  }
}

impl Sbrk {
  pub fn new() -> Self {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = usize::try_from(page_size)
      .ok()
      .filter(|size| size.is_power_of_two())
      .unwrap_or(DEFAULT_PAGE_SIZE);
    Self {
      page_size,
      page_aligned: false,
    }
  }

  /// The current program break, as reported by `sbrk(0)`.
  pub fn current_break() -> *mut u8 {
    unsafe { sbrk(0) }.cast()
  }

  fn move_break(n_bytes: usize) -> Result<NonNull<u8>, ExtendError> {
    let refused = || RefusedSnafu { n_bytes };
    let Ok(increment) = intptr_t::try_from(n_bytes) else {
      return Err(refused().into_error(io::Error::from(io::ErrorKind::OutOfMemory)));
    };
    let old_break = unsafe { sbrk(increment) };
    if old_break == usize::MAX as *mut c_void {
      return Err(io::Error::last_os_error()).context(refused());
    }
    NonNull::new(old_break.cast())
      .ok_or_else(|| refused().into_error(io::Error::from(io::ErrorKind::InvalidData)))
  }
}

impl HeapExtender for Sbrk {
  fn extend(
    &mut self,
    n_bytes: usize,
  ) -> Result<NonNull<u8>, ExtendError> {
    check_extension(n_bytes, self.page_size)?;

    if !self.page_aligned {
      let padding = Self::current_break().align_offset(self.page_size);
      if padding > 0 {
        Self::move_break(padding)?;
      }
      self.page_aligned = true;
    }

    Self::move_break(n_bytes)
  }

  fn page_size(&self) -> usize {
    self.page_size
  }
}

/// A private, fixed-capacity stand-in for the program break.
///
/// The backing memory is reserved up front, zeroed and page-aligned; `extend`
/// only moves a break offset through it.
#[derive(Debug)]
pub struct Arena {
  base: NonNull<u8>,
  capacity: usize,
  page_size: usize,
  brk: usize,
}

unsafe impl Send for Arena {}

impl Arena {
  /// Reserves `capacity` bytes, rounded down to whole pages of
  /// [`DEFAULT_PAGE_SIZE`].
  ///
  /// # Panics
  ///
  /// Panics if `capacity` is smaller than one page.
  pub fn new(capacity: usize) -> Self {
    Self::with_page_size(capacity, DEFAULT_PAGE_SIZE)
  }

  /// # Panics
  ///
  /// Panics if `page_size` is not a power of two or `capacity` is smaller
  /// than one page.
  pub fn with_page_size(
    capacity: usize,
    page_size: usize,
  ) -> Self {
    assert!(page_size.is_power_of_two(), "page size must be a power of two");
    let capacity = capacity / page_size * page_size;
    assert!(capacity > 0, "arena must hold at least one page");

    let layout = Self::layout(capacity, page_size);
    let base = unsafe { alloc::alloc_zeroed(layout) };
    let Some(base) = NonNull::new(base) else {
      alloc::handle_alloc_error(layout);
    };

    Self {
      base,
      capacity,
      page_size,
      brk: 0,
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes handed out so far.
  pub fn used(&self) -> usize {
    self.brk
  }

  fn layout(
    capacity: usize,
    page_size: usize,
  ) -> Layout {
    Layout::from_size_align(capacity, page_size)
      .unwrap_or_else(|_| panic!("arena of {capacity} bytes is too large"))
  }
}

impl HeapExtender for Arena {
  fn extend(
    &mut self,
    n_bytes: usize,
  ) -> Result<NonNull<u8>, ExtendError> {
    check_extension(n_bytes, self.page_size)?;
    ensure!(
      n_bytes <= self.capacity - self.brk,
      LimitExceededSnafu {
        n_bytes,
        limit: self.capacity,
      }
    );

    let old_end = unsafe { self.base.add(self.brk) };
    self.brk += n_bytes;
    Ok(old_end)
  }

  fn page_size(&self) -> usize {
    self.page_size
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    unsafe { alloc::dealloc(self.base.as_ptr(), Self::layout(self.capacity, self.page_size)) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_arena_extend() {
    let mut arena = Arena::new(3 * DEFAULT_PAGE_SIZE);
    let first = arena.extend(DEFAULT_PAGE_SIZE).unwrap();
    let second = arena.extend(2 * DEFAULT_PAGE_SIZE).unwrap();

    assert!(first.addr().get().is_multiple_of(DEFAULT_PAGE_SIZE));
    assert_eq!(second.addr().get() - first.addr().get(), DEFAULT_PAGE_SIZE);
    assert_eq!(arena.used(), arena.capacity());
  }

  #[test]
  fn test_arena_limit() {
    let mut arena = Arena::new(2 * DEFAULT_PAGE_SIZE);
    arena.extend(DEFAULT_PAGE_SIZE).unwrap();

    let err = arena.extend(2 * DEFAULT_PAGE_SIZE).unwrap_err();
    assert!(matches!(err, ExtendError::LimitExceeded { .. }));
    assert_eq!(arena.used(), DEFAULT_PAGE_SIZE);

    arena.extend(DEFAULT_PAGE_SIZE).unwrap();
  }

  #[test]
  fn test_arena_rejects_unaligned() {
    let mut arena = Arena::new(2 * DEFAULT_PAGE_SIZE);
    assert!(matches!(arena.extend(0), Err(ExtendError::Unaligned { .. })));
    assert!(matches!(arena.extend(100), Err(ExtendError::Unaligned { .. })));
    assert_eq!(arena.used(), 0);
  }

  #[test]
  fn test_arena_rounds_capacity_down() {
    let arena = Arena::with_page_size(3 * 512 + 100, 512);
    assert_eq!(arena.capacity(), 3 * 512);
    assert_eq!(arena.page_size(), 512);
  }

  #[test]
  fn test_sbrk_page_size() {
    let sbrk = Sbrk::new();
    assert!(sbrk.page_size().is_power_of_two());
    assert!(!Sbrk::current_break().is_null());
  }
}
