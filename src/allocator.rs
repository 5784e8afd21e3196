use std::ptr::NonNull;

use spin::Mutex;

use crate::{
  config::Config,
  error::{AllocError, CheckError, InitError, ReleaseError},
  extender::HeapExtender,
  heap::{FreeBlock, Heap, HeapStats},
};

/// The thread-safe owning handle of a heap.
///
/// Every operation holds one lock from start to finish, heap extension and the
/// retry after it included, so no two threads ever observe a half-updated
/// free list or race on the end of the region. The lock is a spin lock and
/// never allocates, which keeps the allocator usable underneath the global
/// allocator.
pub struct Allocator<E> {
  heap: Mutex<Heap<E>>,
}

impl<E> Allocator<E>
where
  E: HeapExtender,
{
  /// Creates the heap with its initial pages taken from `extender`.
  pub fn init(
    extender: E,
    config: Config,
  ) -> Result<Self, InitError> {
    Ok(Self {
      heap: Mutex::new(Heap::new(extender, config)?),
    })
  }

  pub fn allocate(
    &self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    self.heap.lock().allocate(size)
  }

  /// # Safety
  ///
  /// See [`Heap::release`].
  pub unsafe fn release(
    &self,
    ptr: *mut u8,
  ) -> Result<(), ReleaseError> {
    unsafe { self.heap.lock().release(ptr) }
  }

  pub fn stats(&self) -> HeapStats {
    self.heap.lock().stats()
  }

  pub fn free_blocks(&self) -> Vec<FreeBlock> {
    self.heap.lock().free_blocks().collect()
  }

  pub fn check(&self) -> Result<(), CheckError> {
    self.heap.lock().check()
  }

  /// Runs `f` with the heap locked, for inspection that must not interleave
  /// with other threads.
  pub fn with_heap<R, F>(
    &self,
    f: F,
  ) -> R
  where
    F: FnOnce(&Heap<E>) -> R,
  {
    f(&self.heap.lock())
  }
}
