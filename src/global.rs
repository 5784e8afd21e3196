//! The process-wide heap on the program break.
//!
//! There is exactly one break per process, so there is at most one
//! [`Allocator<Sbrk>`] per process. It is created by [`init`], or lazily with
//! the default [`Config`] by the first [`BrkGlobalAlloc::alloc`].

use std::{
  alloc::{GlobalAlloc, Layout},
  ptr::{self, NonNull},
};

use snafu::{OptionExt as _, ensure};
use spin::Once;

use crate::{
  ALIGN,
  allocator::Allocator,
  config::Config,
  error::{
    AllocError, AllocUninitializedSnafu, AlreadyInitializedSnafu, InitError, ReleaseError,
    ReleaseUninitializedSnafu,
  },
  extender::Sbrk,
};

static GLOBAL: Once<Allocator<Sbrk>> = Once::new();

/// Creates the process-wide heap.
///
/// Fails with [`InitError::AlreadyInitialized`] on every call after the first
/// successful one. A failed initialization may be retried.
pub fn init(config: Config) -> Result<&'static Allocator<Sbrk>, InitError> {
  let mut fresh = false;
  let allocator = GLOBAL.try_call_once(|| {
    fresh = true;
    Allocator::init(Sbrk::new(), config)
  })?;
  ensure!(fresh, AlreadyInitializedSnafu);
  Ok(allocator)
}

/// The process-wide heap, if it was created.
pub fn get() -> Option<&'static Allocator<Sbrk>> {
  GLOBAL.get()
}

pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
  get().context(AllocUninitializedSnafu)?.allocate(size)
}

/// # Safety
///
/// See [`Heap::release`](crate::Heap::release).
pub unsafe fn release(ptr: *mut u8) -> Result<(), ReleaseError> {
  let allocator = get().context(ReleaseUninitializedSnafu)?;
  unsafe { allocator.release(ptr) }
}

/// A [`GlobalAlloc`] on the process-wide heap.
///
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: brkalloc::BrkGlobalAlloc = brkalloc::BrkGlobalAlloc;
/// # fn main() {}
/// ```
///
/// Alignments above [`ALIGN`] are not supported and yield null.
///
/// When installed, the heap's own log records are emitted from inside the
/// allocator. A logger that allocates while handling them re-enters the heap
/// lock and spins forever, so either leave logging disabled or use a logger
/// that never allocates.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrkGlobalAlloc;

unsafe impl GlobalAlloc for BrkGlobalAlloc {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    if layout.align() > ALIGN {
      return ptr::null_mut();
    }
    // `Config::from_env` allocates; only the default is safe here.
    let Ok(allocator) = GLOBAL.try_call_once(|| Allocator::init(Sbrk::new(), Config::default()))
    else {
      return ptr::null_mut();
    };
    allocator
      .allocate(layout.size())
      .map_or(ptr::null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(
    &self,
    ptr: *mut u8,
    _layout: Layout,
  ) {
    // Rejected pointers were already logged by the heap.
    if let Some(allocator) = get() {
      let _ = unsafe { allocator.release(ptr) };
    }
  }
}
