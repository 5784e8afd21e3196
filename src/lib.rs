//! # brkalloc - A Best-Fit Heap on the Program Break
//!
//! This crate provides a general-purpose **best-fit allocator** that manages a
//! single contiguous region grown with `sbrk(2)`, keeps released blocks on an
//! address-ordered free list and merges neighbouring free blocks immediately.
//!
//! ## Overview
//!
//! ```text
//!   Managed Region:
//!
//!   base                                                         program break
//!   ▼                                                                       ▼
//!   ┌──────────┬────────┬──────────────┬────────┬──────────┬────────────────┐
//!   │  free    │ used   │    free      │ used   │  used    │     free       │
//!   └──────────┴────────┴──────────────┴────────┴──────────┴────────────────┘
//!        │                    ▲  │                                ▲
//!        └────────────────────┘  └────────────────────────────────┘
//!                     free list, ascending addresses
//! ```
//!
//! Allocation picks the free block that leaves the least slack. A block whose
//! slack could not hold a free node of its own is handed out whole; any other
//! block gives up its tail and stays on the list. When nothing fits, the
//! region is extended by whole pages, once, and the search is retried.
//!
//! ## Crate Structure
//!
//! ```text
//!   brkalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - In-band headers and free nodes (internal)
//!   ├── region     - Bounds-checked view of the managed bytes (internal)
//!   ├── free_list  - Coalescing insert and best-fit search (internal)
//!   ├── extender   - HeapExtender: Sbrk and Arena
//!   ├── config     - Config, BRKALLOC_* environment overrides
//!   ├── heap       - Heap: the single-threaded core
//!   ├── allocator  - Allocator: the locked handle
//!   ├── global     - The process-wide heap and BrkGlobalAlloc
//!   ├── trace      - Allocation traces and their replay
//!   └── error      - Error types
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use brkalloc::{Allocator, Arena, Config, DEFAULT_PAGE_SIZE};
//!
//! let allocator = Allocator::init(Arena::new(16 * DEFAULT_PAGE_SIZE), Config::default())?;
//!
//! let ptr = allocator.allocate(100)?;
//! unsafe {
//!   ptr.as_ptr().write_bytes(0, 100);
//!   allocator.release(ptr.as_ptr())?;
//! }
//! assert_eq!(allocator.stats().free_blocks, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Block Layout
//!
//! ```text
//!   Allocated:                        Free:
//!   ┌──────┬──────┬────────────────┐  ┌──────┬──────┬──────┬──────┬─────────┐
//!   │ size │ tag  │    payload     │  │ size │  0   │ prev │ next │  ...    │
//!   └──────┴──────┴────────────────┘  └──────┴──────┴──────┴──────┴─────────┘
//!    4 B    4 B   ▲ size bytes          4 B    4 B    8 B    8 B
//!                 └── returned pointer, 8-byte aligned
//! ```
//!
//! ## Safety
//!
//! Releasing takes a raw pointer. Null, foreign, misaligned and already
//! released pointers are rejected without touching the heap, but a pointer
//! into the middle of a live block whose bytes mimic a header cannot be told
//! apart from a real one.

pub mod align;
mod allocator;
mod block;
mod config;
mod error;
mod extender;
mod free_list;
pub mod global;
mod heap;
mod region;
pub mod trace;

pub use allocator::Allocator;
pub use block::{ALIGN, HEADER_SIZE, MAX_HEAP_SIZE, MIN_PAYLOAD, NODE_SIZE, TIGHT_FIT_SLACK};
pub use config::Config;
pub use error::{
  AllocError, CheckError, ConfigError, ExtendError, InitError, ReleaseError, ReplayError,
  TraceError,
};
pub use extender::{Arena, DEFAULT_PAGE_SIZE, HeapExtender, Sbrk};
pub use global::BrkGlobalAlloc;
pub use heap::{FreeBlock, Heap, HeapStats};
