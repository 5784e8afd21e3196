use std::{io, num::ParseIntError, path::PathBuf};

use snafu::{Location, Snafu};

/// Failure to grow the managed region.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExtendError {
  #[snafu(display("extension of {n_bytes} bytes is not a positive multiple of the {page_size}-byte page"))]
  Unaligned { n_bytes: usize, page_size: usize },
  #[snafu(display("the operating system refused to extend the heap by {n_bytes} bytes"))]
  Refused { n_bytes: usize, source: io::Error },
  #[snafu(display("extending by {n_bytes} bytes would exceed the {limit}-byte heap limit"))]
  LimitExceeded { n_bytes: usize, limit: usize },
  #[snafu(display("program break moved behind the allocator's back: expected {expected:#x}, got {found:#x}"))]
  NonContiguous { expected: usize, found: usize },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InitError {
  #[snafu(display("invalid heap configuration: {reason}"))]
  InvalidConfig { reason: &'static str },
  #[snafu(display("failed to obtain the initial {n_bytes}-byte heap"))]
  InitialExtension {
    n_bytes: usize,
    source: ExtendError,
    #[snafu(implicit)]
    location: Location,
  },
  #[snafu(display("the process-wide heap is already initialized"))]
  AlreadyInitialized,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
  #[snafu(display("request of {size} bytes exceeds the largest supported block"))]
  TooLarge { size: usize },
  #[snafu(display("could not grow the heap for a request of {size} bytes"))]
  Extension {
    size: usize,
    source: ExtendError,
    #[snafu(implicit)]
    location: Location,
  },
  #[snafu(display("heap grew but still cannot hold a request of {size} bytes"))]
  Exhausted {
    size: usize,
    #[snafu(implicit)]
    location: Location,
  },
  #[snafu(display("the process-wide heap is not initialized"))]
  #[snafu(context(name(AllocUninitializedSnafu)))]
  Uninitialized,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReleaseError {
  #[snafu(display("attempt to release a null pointer"))]
  NullPointer {
    #[snafu(implicit)]
    location: Location,
  },
  #[snafu(display("pointer {addr:#x} was not handed out by this heap"))]
  Foreign { addr: usize },
  #[snafu(display("pointer {addr:#x} was already released"))]
  DoubleRelease { addr: usize },
  #[snafu(display("block header for {addr:#x} is corrupted (tag {tag:#010x}, size {size})"))]
  Corrupted { addr: usize, tag: u32, size: usize },
  #[snafu(display("the process-wide heap is not initialized"))]
  #[snafu(context(name(ReleaseUninitializedSnafu)))]
  Uninitialized,
}

impl ReleaseError {
  /// Whether the failure points at damaged heap metadata rather than at a
  /// caller handing back the wrong pointer.
  pub fn is_corruption(&self) -> bool {
    matches!(self, Self::Corrupted { .. })
  }
}

/// A violated heap invariant found by [`Heap::check`](crate::Heap::check).
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum CheckError {
  #[snafu(display("free block {offset:#x} is not above its predecessor {prev:#x}"))]
  Unordered { offset: usize, prev: usize },
  #[snafu(display("free block {offset:#x} has a stale back link"))]
  BrokenLink { offset: usize },
  #[snafu(display("free blocks {left:#x} and {right:#x} touch but were not merged"))]
  Unmerged { left: usize, right: usize },
  #[snafu(display("block at {offset:#x} is neither free nor allocated (tag {tag:#010x})"))]
  UnknownBlock { offset: usize, tag: u32 },
  #[snafu(display("block at {offset:#x} runs to {end:#x}, past the heap end {len:#x}"))]
  Overrun { offset: usize, end: usize, len: usize },
  #[snafu(display("free block {offset:#x} does not start on a block boundary"))]
  Stray { offset: usize },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
  #[snafu(display("{var}={value:?} is not a valid number"))]
  InvalidValue {
    var: &'static str,
    value: String,
    source: ParseIntError,
  },
}

/// A malformed allocation trace.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TraceError {
  #[snafu(display("failed to read trace {}", path.display()))]
  Read { path: PathBuf, source: io::Error },
  #[snafu(display("line {line}: unknown operation {op:?}"))]
  UnknownOp { line: usize, op: String },
  #[snafu(display("line {line}: missing {field}"))]
  MissingField { line: usize, field: &'static str },
  #[snafu(display("line {line}: invalid {field}"))]
  InvalidNumber {
    line: usize,
    field: &'static str,
    source: ParseIntError,
  },
  #[snafu(display("line {line}: unexpected trailing field {extra:?}"))]
  TrailingField { line: usize, extra: String },
}

/// A trace that could not be replayed, or a heap that misbehaved under it.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReplayError {
  #[snafu(display("thread {thread} allocates into slot {slot}, which is still live"))]
  SlotInUse { thread: usize, slot: usize },
  #[snafu(display("thread {thread} releases slot {slot}, which holds nothing"))]
  EmptySlot { thread: usize, slot: usize },
  #[snafu(display("thread {thread} slot {slot}: payload byte {offset} was overwritten"))]
  CorruptPayload {
    thread: usize,
    slot: usize,
    offset: usize,
  },
}
