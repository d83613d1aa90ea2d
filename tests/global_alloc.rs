//! `Allocator` installed as the process allocator.

use std::sync::Mutex;
use std::thread;

use log::{LevelFilter, Log, Metadata, Record};

#[global_allocator]
static GLOBAL: segfit::Allocator = segfit::Allocator;

/// A logger that allocates for every record it sees.
struct Recorder {
  lines: Mutex<Vec<String>>,
}

impl Log for Recorder {
  fn enabled(&self, _: &Metadata) -> bool {
    true
  }

  fn log(&self, record: &Record) {
    let line = format!("{} {}: {}", record.level(), record.target(), record.args());
    if let Ok(mut lines) = self.lines.lock() {
      lines.push(line);
    }
  }

  fn flush(&self) {}
}

static RECORDER: Recorder = Recorder {
  lines: Mutex::new(Vec::new()),
};

#[test]
fn allocating_logger_at_trace_level() {
  log::set_logger(&RECORDER).unwrap();
  log::set_max_level(LevelFilter::Trace);

  let small = vec![1u8; 100];
  // Large enough to extend the thread heap.
  let big = vec![2u8; 4 << 20];
  log::info!("allocated {} and {} bytes", small.len(), big.len());

  let sum = thread::spawn(move || big.iter().map(|&b| b as usize).sum::<usize>())
    .join()
    .unwrap();
  assert_eq!(sum, 2 * (4 << 20));

  let lines = RECORDER.lines.lock().unwrap();
  assert!(lines.iter().any(|line| line.contains("allocated 100 and")));
}

#[test]
fn boxes_freed_on_another_thread_are_reused() {
  let mut peak = 0;
  for _ in 0..50 {
    let boxes: Vec<Box<[u8; 64]>> = (0..10_000).map(|i| Box::new([i as u8; 64])).collect();
    thread::spawn(move || drop(boxes)).join().unwrap();
    let stats = segfit::thread_stats().unwrap();
    peak = peak.max(stats.heap_size);
  }
  // One round needs about 1MB; without reuse fifty rounds would need 40MB.
  assert!(peak < 8 << 20, "thread heap grew to {peak} bytes");
}

#[test]
fn over_aligned_values() {
  #[repr(align(128))]
  struct Padded([u8; 128]);

  let values: Vec<Box<Padded>> = (0..64).map(|i| Box::new(Padded([i; 128]))).collect();
  for (i, value) in values.iter().enumerate() {
    assert_eq!(&**value as *const Padded as usize % 128, 0);
    assert!(value.0.iter().all(|&b| b == i as u8));
  }
}
