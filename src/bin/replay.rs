use std::{path::PathBuf, process};

use argh::FromArgs;
use brkalloc::{Allocator, Arena, Config, DEFAULT_PAGE_SIZE, HeapExtender, Sbrk, trace};
use log::info;
use snafu::{ResultExt as _, Whatever};

/// Replay an allocation trace against a brkalloc heap.
#[derive(Debug, FromArgs)]
struct Args {
  #[argh(positional)]
  trace: PathBuf,
  /// largest size the heap may grow to, in bytes
  #[argh(option, default = "64 << 20")]
  heap_limit: usize,
  /// pages obtained when the heap is created
  #[argh(option, default = "1")]
  initial_pages: usize,
  /// grow the real program break instead of a private arena
  #[argh(switch)]
  sbrk: bool,
  /// verify the heap layout after the replay
  #[argh(switch)]
  check: bool,
}

fn main() {
  env_logger::init();
  let args: Args = argh::from_env();

  if let Err(err) = run(&args) {
    eprintln!("{}", snafu::Report::from_error(err));
    process::exit(1);
  }
}

fn run(args: &Args) -> Result<(), Whatever> {
  let ops = trace::load(&args.trace)
    .with_whatever_context(|_| format!("failed to load trace, path={}", args.trace.display()))?;
  let config = Config::default()
    .initial_pages(args.initial_pages)
    .max_heap_size(args.heap_limit);

  if args.sbrk {
    let start = Sbrk::current_break();
    info!("program break starts at {start:p}");
    replay(Sbrk::new(), config, &ops, args.check)
  } else {
    let capacity = args
      .heap_limit
      .max(args.initial_pages.saturating_mul(DEFAULT_PAGE_SIZE))
      .max(DEFAULT_PAGE_SIZE);
    replay(Arena::new(capacity), config, &ops, args.check)
  }
}

fn replay<E>(
  extender: E,
  config: Config,
  ops: &[trace::Op],
  check: bool,
) -> Result<(), Whatever>
where
  E: HeapExtender + Send,
{
  let allocator = Allocator::init(extender, config).whatever_context("failed to create heap")?;
  let report = trace::replay(&allocator, ops).whatever_context("replay failed")?;

  println!("ops:                {}", report.ops);
  println!("threads:            {}", report.threads);
  println!("failed allocations: {}", report.failed_allocations);
  println!("failed releases:    {}", report.failed_releases);
  println!("max heap extent:    {} bytes", report.stats.heap_size);
  println!("extensions:         {}", report.stats.extensions);
  println!("live blocks:        {}", report.stats.allocated_blocks);
  println!(
    "free blocks:        {} ({} bytes, largest {})",
    report.stats.free_blocks, report.stats.free_bytes, report.stats.largest_free
  );

  if check {
    allocator.check().whatever_context("heap check failed")?;
    println!("heap check:         ok");
  }
  Ok(())
}
