//! Thread stress tests.
//!
//! These exercise one heap under heavy contention and verify that concurrent
//! allocate/release calls never hand out overlapping memory and leave the
//! block partition intact.

use std::{
  ptr,
  sync::{Arc, Barrier},
  thread,
};

use brkalloc::{Allocator, Arena, Config, DEFAULT_PAGE_SIZE, FreeBlock};

fn stress_n_threads(num_threads: usize) {
  const ITERATIONS: usize = 2_000;
  const LIVE: usize = 16;

  let allocator = Arc::new(
    Allocator::init(Arena::new(1024 * DEFAULT_PAGE_SIZE), Config::default()).unwrap(),
  );
  let barrier = Arc::new(Barrier::new(num_threads));

  let handles: Vec<_> = (0..num_threads)
    .map(|t| {
      let allocator = Arc::clone(&allocator);
      let barrier = Arc::clone(&barrier);
      thread::spawn(move || {
        let fill = t as u8 + 1;
        let mut live: Vec<(*mut u8, usize)> = Vec::with_capacity(LIVE);
        barrier.wait();

        for i in 0..ITERATIONS {
          let size = 1 + (i * 37 + t * 11) % 600;
          let p = allocator.allocate(size).unwrap().as_ptr();
          unsafe { ptr::write_bytes(p, fill, size) };
          live.push((p, size));

          if live.len() == LIVE {
            for (p, size) in live.drain(..).rev().step_by(2) {
              unsafe {
                let bytes = std::slice::from_raw_parts(p, size);
                assert!(bytes.iter().all(|b| *b == fill), "payload overwritten");
                allocator.release(p).unwrap();
              }
            }
          }
        }

        for (p, size) in live {
          unsafe {
            let bytes = std::slice::from_raw_parts(p, size);
            assert!(bytes.iter().all(|b| *b == fill), "payload overwritten");
            allocator.release(p).unwrap();
          }
        }
      })
    })
    .collect();

  for h in handles {
    h.join().expect("thread panicked during allocate/release stress");
  }

  allocator.check().unwrap();
  let stats = allocator.stats();
  assert_eq!(stats.allocated_blocks, 0);
  assert_eq!(
    allocator.free_blocks(),
    [FreeBlock {
      offset: 0,
      span: stats.heap_size
    }]
  );
}

#[test]
fn stress_4_threads() {
  stress_n_threads(4);
}

#[test]
fn stress_8_threads() {
  stress_n_threads(8);
}

#[test]
fn concurrent_extensions_keep_region_contiguous() {
  const THREADS: usize = 8;

  let allocator = Arc::new(
    Allocator::init(Arena::new(256 * DEFAULT_PAGE_SIZE), Config::default()).unwrap(),
  );
  let barrier = Arc::new(Barrier::new(THREADS));

  let handles: Vec<_> = (0..THREADS)
    .map(|_| {
      let allocator = Arc::clone(&allocator);
      let barrier = Arc::clone(&barrier);
      thread::spawn(move || {
        barrier.wait();
        (0..4)
          .map(|_| allocator.allocate(5 * DEFAULT_PAGE_SIZE).unwrap().addr().get())
          .collect::<Vec<_>>()
      })
    })
    .collect();

  let mut addrs: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
  addrs.sort_unstable();
  for pair in addrs.windows(2) {
    assert!(pair[1] - pair[0] >= 5 * DEFAULT_PAGE_SIZE, "grants overlap");
  }

  allocator.check().unwrap();
  assert_eq!(allocator.stats().allocated_blocks, THREADS * 4);
}
