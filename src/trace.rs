//! Allocation traces and their multi-threaded replay.
//!
//! A trace is plain text, one operation per line:
//!
//! ```text
//! # thread slot size
//! m 0 0 128      allocate 128 bytes into slot 0 of thread 0
//! m 1 0 4000
//! f 0 0          release slot 0 of thread 0
//! ```
//!
//! Blank lines and everything after a `#` are ignored. Slots are private to
//! their thread.

use std::{
  collections::{BTreeMap, HashMap},
  fs,
  num::ParseIntError,
  panic,
  path::Path,
  ptr::NonNull,
  slice,
  str::{FromStr, SplitWhitespace},
  sync::Barrier,
  thread,
};

use log::{debug, info};
use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
  allocator::Allocator,
  error::{
    CorruptPayloadSnafu, EmptySlotSnafu, InvalidNumberSnafu, MissingFieldSnafu, ReadSnafu,
    ReplayError, SlotInUseSnafu, TraceError, TrailingFieldSnafu, UnknownOpSnafu,
  },
  extender::HeapExtender,
  heap::HeapStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
  Allocate {
    thread: usize,
    slot: usize,
    size: usize,
  },
  Release {
    thread: usize,
    slot: usize,
  },
}

impl Op {
  pub fn thread(&self) -> usize {
    match *self {
      Self::Allocate { thread, .. } | Self::Release { thread, .. } => thread,
    }
  }
}

/// Outcome of a [`replay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
  pub ops: usize,
  pub threads: usize,
  /// Allocations the heap refused, usually because it hit its limit.
  pub failed_allocations: usize,
  pub failed_releases: usize,
  /// Heap state once every thread finished. Slots still live at the end of
  /// the trace remain allocated.
  pub stats: HeapStats,
}

pub fn parse(input: &str) -> Result<Vec<Op>, TraceError> {
  let mut ops = Vec::new();
  for (index, text) in input.lines().enumerate() {
    let line = index + 1;
    let text = text.split_once('#').map_or(text, |(op, _)| op);
    let mut fields = Fields {
      line,
      inner: text.split_whitespace(),
    };

    let Some(op) = fields.inner.next() else {
      continue;
    };
    let op = match op {
      "m" => Op::Allocate {
        thread: fields.number("thread")?,
        slot: fields.number("slot")?,
        size: fields.number("size")?,
      },
      "f" => Op::Release {
        thread: fields.number("thread")?,
        slot: fields.number("slot")?,
      },
      op => return UnknownOpSnafu { line, op }.fail(),
    };
    fields.finish()?;
    ops.push(op);
  }
  Ok(ops)
}

pub fn load(path: impl AsRef<Path>) -> Result<Vec<Op>, TraceError> {
  let path = path.as_ref();
  let input = fs::read_to_string(path).context(ReadSnafu { path })?;
  parse(&input)
}

struct Fields<'a> {
  line: usize,
  inner: SplitWhitespace<'a>,
}

impl Fields<'_> {
  fn number<T>(
    &mut self,
    field: &'static str,
  ) -> Result<T, TraceError>
  where
    T: FromStr<Err = ParseIntError>,
  {
    let line = self.line;
    self
      .inner
      .next()
      .context(MissingFieldSnafu { line, field })?
      .parse()
      .context(InvalidNumberSnafu { line, field })
  }

  fn finish(mut self) -> Result<(), TraceError> {
    match self.inner.next() {
      Some(extra) => TrailingFieldSnafu {
        line: self.line,
        extra,
      }
      .fail(),
      None => Ok(()),
    }
  }
}

/// Runs `ops` against `allocator`, one OS thread per trace thread.
///
/// Every granted payload is filled with a byte unique to its thread and slot
/// and verified before it is released, so two live grants that overlap are
/// reported as [`ReplayError::CorruptPayload`].
pub fn replay<E>(
  allocator: &Allocator<E>,
  ops: &[Op],
) -> Result<ReplayReport, ReplayError>
where
  E: HeapExtender + Send,
{
  let mut per_thread: BTreeMap<usize, Vec<Op>> = BTreeMap::new();
  for op in ops {
    per_thread.entry(op.thread()).or_default().push(*op);
  }
  info!("replaying {} ops on {} threads", ops.len(), per_thread.len());

  let barrier = Barrier::new(per_thread.len());
  let tallies = thread::scope(|s| {
    let handles: Vec<_> = per_thread
      .iter()
      .map(|(thread, ops)| {
        let barrier = &barrier;
        s.spawn(move || {
          barrier.wait();
          run_thread(allocator, *thread, ops)
        })
      })
      .collect();
    handles
      .into_iter()
      .map(|handle| handle.join().unwrap_or_else(|err| panic::resume_unwind(err)))
      .collect::<Vec<_>>()
  });

  let mut report = ReplayReport {
    ops: ops.len(),
    threads: per_thread.len(),
    failed_allocations: 0,
    failed_releases: 0,
    stats: HeapStats::default(),
  };
  for tally in tallies {
    let tally = tally?;
    report.failed_allocations += tally.failed_allocations;
    report.failed_releases += tally.failed_releases;
  }
  report.stats = allocator.stats();
  Ok(report)
}

#[derive(Default)]
struct Tally {
  failed_allocations: usize,
  failed_releases: usize,
}

fn run_thread<E>(
  allocator: &Allocator<E>,
  thread: usize,
  ops: &[Op],
) -> Result<Tally, ReplayError>
where
  E: HeapExtender,
{
  let mut tally = Tally::default();
  let mut slots: HashMap<usize, (NonNull<u8>, usize)> = HashMap::new();

  for op in ops {
    match *op {
      Op::Allocate { slot, size, .. } => {
        ensure!(!slots.contains_key(&slot), SlotInUseSnafu { thread, slot });
        match allocator.allocate(size) {
          Ok(ptr) => {
            unsafe { ptr.as_ptr().write_bytes(fill_byte(thread, slot), size) };
            slots.insert(slot, (ptr, size));
          }
          Err(err) => {
            debug!("thread {thread} slot {slot}: {err}");
            tally.failed_allocations += 1;
          }
        }
      }
      Op::Release { slot, .. } => {
        let (ptr, size) = slots.remove(&slot).context(EmptySlotSnafu { thread, slot })?;
        let payload = unsafe { slice::from_raw_parts(ptr.as_ptr(), size) };
        let fill = fill_byte(thread, slot);
        if let Some(offset) = payload.iter().position(|byte| *byte != fill) {
          return CorruptPayloadSnafu {
            thread,
            slot,
            offset,
          }
          .fail();
        }
        if let Err(err) = unsafe { allocator.release(ptr.as_ptr()) } {
          debug!("thread {thread} slot {slot}: {err}");
          tally.failed_releases += 1;
        }
      }
    }
  }
  Ok(tally)
}

fn fill_byte(
  thread: usize,
  slot: usize,
) -> u8 {
  (thread.wrapping_mul(167) ^ slot.wrapping_mul(31)).to_le_bytes()[0] | 1
}
