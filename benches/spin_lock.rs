use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Mutex;

const OPS: u64 = 100_000;

fn bench_uncontended(c: &mut Criterion) {
  let mut group = c.benchmark_group("lock_uncontended");
  group.throughput(Throughput::Elements(OPS));

  group.bench_function("bedrock_spin", |b| {
    let lock = bedrock::SpinLock::new();
    let mut counter = 0u64;
    b.iter(|| {
      for _ in 0..OPS {
        lock.lock();
        counter = counter.wrapping_add(1);
        lock.unlock();
      }
      black_box(counter)
    })
  });

  group.bench_function("std_mutex", |b| {
    let lock = Mutex::new(0u64);
    b.iter(|| {
      for _ in 0..OPS {
        let mut guard = lock.lock().unwrap();
        *guard = guard.wrapping_add(1);
      }
      black_box(*lock.lock().unwrap())
    })
  });

  group.finish();
}

fn bench_contended(c: &mut Criterion) {
  const THREADS: usize = 4;
  const PER_THREAD: u64 = 10_000;

  let mut group = c.benchmark_group("lock_contended");
  group.throughput(Throughput::Elements(THREADS as u64 * PER_THREAD));

  group.bench_function("bedrock_spin_x4", |b| {
    b.iter(|| {
      let lock = bedrock::SpinLock::new();
      let counter = std::sync::atomic::AtomicU64::new(0);
      std::thread::scope(|scope| {
        for _ in 0..THREADS {
          scope.spawn(|| {
            for _ in 0..PER_THREAD {
              lock.lock();
              counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
              lock.unlock();
            }
          });
        }
      });
      black_box(counter.into_inner())
    })
  });

  group.finish();
}

criterion_group!(benches, bench_uncontended, bench_contended);
criterion_main!(benches);
