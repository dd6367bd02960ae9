//! Usage-counter tests. These live in their own test binary so the crate's
//! parallel unit tests cannot perturb the process-wide counters; within the
//! binary, tests serialize on a mutex for the same reason.

use std::sync::{Mutex, MutexGuard};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
  SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn matched_pairs_leave_usage_unchanged() {
  let _guard = serial();

  let count0 = bedrock::alloc_count();
  let usage0 = bedrock::current_usage();

  for _ in 0..16 {
    let ptr = bedrock::alloc(512, true);
    unsafe { bedrock::free(ptr, true) };
  }

  assert_eq!(bedrock::alloc_count(), count0);
  if cfg!(debug_assertions) {
    assert_eq!(bedrock::current_usage(), usage0);
    assert!(bedrock::peak_usage() >= usage0 + 512);
  }
}

#[test]
fn peak_covers_any_intermediate_usage() {
  let _guard = serial();

  if !cfg!(debug_assertions) {
    return; // byte accounting is compiled out
  }

  let base = bedrock::current_usage();
  let a = bedrock::alloc(1024, true);
  let b = bedrock::alloc(2048, true);
  let high_water = bedrock::current_usage();
  assert_eq!(high_water, base + 1024 + 2048);
  unsafe {
    bedrock::free(a, true);
    bedrock::free(b, true);
  }
  assert_eq!(bedrock::current_usage(), base);
  assert!(bedrock::peak_usage() >= high_water);
}

#[test]
fn aligned_round_trip_restores_counters() {
  let _guard = serial();

  let count0 = bedrock::alloc_count();
  let usage0 = bedrock::current_usage();

  let ptr = bedrock::alloc_aligned(300, 256);
  assert!(!ptr.is_null());
  assert_eq!(bedrock::alloc_count(), count0 + 1);
  unsafe { bedrock::free_aligned(ptr) };

  assert_eq!(bedrock::alloc_count(), count0);
  assert_eq!(bedrock::current_usage(), usage0);
}

#[test]
fn zero_count_array_does_not_touch_counters() {
  let _guard = serial();

  let count0 = bedrock::alloc_count();
  let usage0 = bedrock::current_usage();

  assert!(bedrock::alloc_array::<u64>(0).is_null());

  assert_eq!(bedrock::alloc_count(), count0);
  assert_eq!(bedrock::current_usage(), usage0);
}

#[test]
fn array_round_trip_restores_counters() {
  let _guard = serial();

  let count0 = bedrock::alloc_count();
  let usage0 = bedrock::current_usage();

  let ptr = bedrock::alloc_array::<u32>(100);
  assert!(!ptr.is_null());
  if cfg!(debug_assertions) {
    assert_eq!(bedrock::current_usage(), usage0 + 400);
  }
  unsafe { bedrock::free_array(ptr) };

  assert_eq!(bedrock::alloc_count(), count0);
  assert_eq!(bedrock::current_usage(), usage0);
}

#[test]
fn realloc_adjusts_usage_by_delta() {
  let _guard = serial();

  if !cfg!(debug_assertions) {
    return;
  }

  let usage0 = bedrock::current_usage();
  let ptr = bedrock::alloc(100, true);
  assert_eq!(bedrock::current_usage(), usage0 + 100);

  let ptr = unsafe { bedrock::realloc(ptr, 250, true) };
  assert_eq!(bedrock::current_usage(), usage0 + 250);

  let ptr = unsafe { bedrock::realloc(ptr, 50, true) };
  assert_eq!(bedrock::current_usage(), usage0 + 50);

  unsafe { bedrock::free(ptr, true) };
  assert_eq!(bedrock::current_usage(), usage0);
}

#[test]
fn available_memory_is_unknown_sentinel() {
  assert_eq!(bedrock::available_memory(), u64::MAX);
}
