use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use segfit::{Heap, Payload, VecHeap};
use std::hint::black_box;

const SLOTS: usize = 512;
const STEPS: usize = 20_000;

#[derive(Clone, Copy)]
enum Step {
  Allocate(usize, usize),
  Resize(usize, usize),
  Free(usize),
}

/// Deterministic mixed trace over a fixed set of slots.
fn trace(max: usize) -> Vec<Step> {
  let mut state = 0x2545_f491_4f6c_dd1du64;
  let mut next = move || {
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    state as usize
  };
  (0..STEPS)
    .map(|_| {
      let slot = next() % SLOTS;
      let size = 1 + next() % max;
      match next() % 8 {
        0..=3 => Step::Allocate(slot, size),
        4..=5 => Step::Resize(slot, size),
        _ => Step::Free(slot),
      }
    })
    .collect()
}

fn replay(steps: &[Step]) -> usize {
  let mut heap = Heap::new(VecHeap::with_limit(1 << 26)).unwrap();
  let mut slots: Vec<Option<Payload>> = vec![None; SLOTS];
  for &step in steps {
    match step {
      Step::Allocate(slot, size) => {
        if let Some(old) = slots[slot].take() {
          heap.free(old);
        }
        slots[slot] = heap.allocate(size).ok().flatten();
      }
      Step::Resize(slot, size) => {
        if let Ok(p) = heap.resize(slots[slot], size) {
          slots[slot] = p;
        }
      }
      Step::Free(slot) => {
        if let Some(old) = slots[slot].take() {
          heap.free(old);
        }
      }
    }
  }
  heap.heap_size()
}

fn benchmark_trace_replay(c: &mut Criterion) {
  let mut group = c.benchmark_group("trace_replay");

  for max in [64, 256, 4096, 65536] {
    let steps = trace(max);
    group.throughput(Throughput::Elements(STEPS as u64));
    group.bench_with_input(BenchmarkId::new("max_size", max), &steps, |b, steps| {
      b.iter(|| black_box(replay(steps)))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_trace_replay);
criterion_main!(benches);
