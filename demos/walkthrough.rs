use std::{error::Error, io::Read, ptr::NonNull};

use brkalloc::{Config, Sbrk, global};

/// Waits until the user presses ENTER.
/// Useful when you want to inspect memory state with tools like `pmap`, `gdb`,
/// or just visually track how allocations change the program break.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints the upper boundary of the heap managed via brk/sbrk.
fn print_program_break(label: &str) {
  println!(
    "[{label}] PID = {}, program break (sbrk(0)) = {:?}",
    std::process::id(),
    Sbrk::current_break(),
  );
}

fn print_heap() {
  let Some(allocator) = global::get() else {
    return;
  };
  let stats = allocator.stats();
  println!(
    "    heap: {} bytes, {} live, {} free ({} bytes)",
    stats.heap_size, stats.allocated_blocks, stats.free_blocks, stats.free_bytes
  );
  for block in allocator.free_blocks() {
    println!("    free block at +{:#06x}, {} bytes", block.offset, block.span);
  }
}

fn print_alloc(
  size: usize,
  ptr: NonNull<u8>,
) {
  println!("    requested {size} bytes -> {ptr:p}");
  print_heap();
}

fn main() -> Result<(), Box<dyn Error>> {
  print_program_break("start");
  global::init(Config::default())?;
  print_program_break("after init");
  print_heap();
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 1) Small allocations are carved from the tail of the one free block.
  // --------------------------------------------------------------------
  println!("\n[1] Allocate three blocks of 100, 200 and 100 bytes");
  let first = global::allocate(100)?;
  print_alloc(100, first);
  let second = global::allocate(200)?;
  print_alloc(200, second);
  let third = global::allocate(100)?;
  print_alloc(100, third);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 2) Releasing the middle block leaves a hole between two live blocks.
  // --------------------------------------------------------------------
  unsafe { global::release(second.as_ptr())? };
  println!("\n[2] Released the 200-byte block at {second:p}");
  print_heap();
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 3) A request that fits the hole reuses it instead of the bigger block.
  // --------------------------------------------------------------------
  let fourth = global::allocate(150)?;
  println!("\n[3] Allocate 150 bytes (best fit)");
  print_alloc(150, fourth);
  println!(
    "[3] Landed inside the hole? {}",
    if (second.as_ptr()..second.as_ptr().wrapping_add(200)).contains(&fourth.as_ptr()) {
      "Yes, the smallest block that fits was used"
    } else {
      "No, it allocated somewhere else"
    }
  );
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 4) Releasing a pointer twice is reported, not fatal.
  // --------------------------------------------------------------------
  unsafe { global::release(first.as_ptr())? };
  match unsafe { global::release(first.as_ptr()) } {
    Ok(()) => println!("\n[4] Second release unexpectedly succeeded"),
    Err(err) => println!("\n[4] Second release rejected: {err}"),
  }
  print_heap();
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 5) A large request grows the heap by whole pages.
  //
  //    The system malloc may have moved the break since init; the heap
  //    then refuses to grow rather than span someone else's memory.
  // --------------------------------------------------------------------
  print_program_break("before large alloc");
  println!("\n[5] Allocate 64 KiB");
  let big = match global::allocate(64 * 1024) {
    Ok(big) => {
      print_alloc(64 * 1024, big);
      Some(big)
    }
    Err(err) => {
      println!("[5] Heap could not grow: {err}");
      None
    }
  };
  print_program_break("after large alloc");
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 6) Releasing everything merges the heap back into one free block.
  // --------------------------------------------------------------------
  for ptr in [Some(third), Some(fourth), big].into_iter().flatten() {
    unsafe { global::release(ptr.as_ptr())? };
  }
  println!("\n[6] Released everything");
  print_heap();

  println!("\n[7] End of example. The break is never lowered; the OS reclaims it at exit.");
  Ok(())
}
