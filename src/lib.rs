//! Low-level memory substrate: static, aligned and array allocation over the
//! system allocator, process-wide usage accounting, and a cache-line-sized
//! spin lock. No threads are created here; everything is a primitive for
//! caller-managed threads.

use core::{
  mem::{align_of, needs_drop, size_of},
  ptr::{self, null_mut},
  sync::atomic::{AtomicU64, Ordering},
};

#[cfg(all(feature = "threads", target_vendor = "apple"))]
use core::cell::UnsafeCell;
#[cfg(all(feature = "threads", not(target_vendor = "apple")))]
use core::sync::atomic::AtomicBool;

// =============================================================================
// Constants
// =============================================================================

/// Maximum alignment the allocator guarantees for header-carrying blocks.
///
/// Floored at 16: strict-alignment targets need the u64 header fields on an
/// 8-byte boundary even when the C ABI reports a smaller `max_align_t`, and
/// 16 is the minimum for 128-bit SIMD loads.
pub const MAX_ALIGN: usize = {
  let abi = align_of::<libc::max_align_t>();
  if abi < 16 { 16 } else { abi }
};

// Header layout for prepadded blocks:
//
//   offset 0              8-byte allocation size
//   ELEMENT_OFFSET        8-byte element count (array allocations)
//   DATA_OFFSET           user data, aligned to MAX_ALIGN
//
/// Offset of the allocation-size field inside the header.
pub const SIZE_OFFSET: usize = 0;
/// Offset of the element-count field inside the header.
pub const ELEMENT_OFFSET: usize = align_up(SIZE_OFFSET + size_of::<u64>(), align_of::<u64>());
/// Offset of the user data region; also the total header size.
pub const DATA_OFFSET: usize = align_up(ELEMENT_OFFSET + size_of::<u64>(), MAX_ALIGN);

/// Assumed cache line size, used to pad `SpinLock` against false sharing.
#[cfg(any(target_arch = "aarch64", target_arch = "powerpc64"))]
pub const CACHE_LINE_BYTES: usize = 128;
#[cfg(not(any(target_arch = "aarch64", target_arch = "powerpc64")))]
pub const CACHE_LINE_BYTES: usize = 64;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(MAX_ALIGN.is_power_of_two());
const _: () = assert!(MAX_ALIGN >= align_of::<u64>());
const _: () = assert!(ELEMENT_OFFSET >= SIZE_OFFSET + size_of::<u64>());
const _: () = assert!(DATA_OFFSET >= ELEMENT_OFFSET + size_of::<u64>());
const _: () = assert!(DATA_OFFSET % MAX_ALIGN == 0);
const _: () = assert!(CACHE_LINE_BYTES.is_power_of_two());
#[cfg(feature = "threads")]
const _: () = assert!(size_of::<SpinLock>() == CACHE_LINE_BYTES);

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_malloc(size: usize) -> *mut u8 {
  unsafe { libc::malloc(size) as *mut u8 }
}

unsafe fn os_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { libc::realloc(ptr.cast(), size) as *mut u8 }
}

unsafe fn os_free(ptr: *mut u8) {
  unsafe { libc::free(ptr.cast()) }
}

/// Plain allocations are infallible at this layer; a refused request means
/// the process is already in an unrecoverable state.
#[cold]
#[inline(never)]
fn oom_abort(bytes: usize) -> ! {
  tracing::error!(bytes, "system allocator could not serve request, aborting");
  std::process::abort();
}

// =============================================================================
// Usage Counters
// =============================================================================

/// Outstanding allocations, tracked in every build.
static ALLOC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Bytes currently in use / historical peak. Debug builds only; accounting
/// needs the size header on every block, so debug builds prepad everything.
#[cfg(debug_assertions)]
static MEM_USAGE: AtomicU64 = AtomicU64::new(0);
#[cfg(debug_assertions)]
static MAX_USAGE: AtomicU64 = AtomicU64::new(0);

#[cfg(debug_assertions)]
#[inline(always)]
fn track_alloc(bytes: u64) {
  let usage = MEM_USAGE.fetch_add(bytes, Ordering::Relaxed) + bytes;
  MAX_USAGE.fetch_max(usage, Ordering::Relaxed);
}

#[cfg(debug_assertions)]
#[inline(always)]
fn track_free(bytes: u64) {
  MEM_USAGE.fetch_sub(bytes, Ordering::Relaxed);
}

#[cfg(debug_assertions)]
#[inline(always)]
fn track_realloc(old_bytes: u64, new_bytes: u64) {
  if new_bytes > old_bytes {
    track_alloc(new_bytes - old_bytes);
  } else {
    track_free(old_bytes - new_bytes);
  }
}

/// Number of outstanding allocations.
pub fn alloc_count() -> u64 {
  ALLOC_COUNT.load(Ordering::Relaxed)
}

/// Bytes currently allocated through this facility. Always 0 in release
/// builds, where byte accounting is compiled out.
pub fn current_usage() -> u64 {
  #[cfg(debug_assertions)]
  {
    MEM_USAGE.load(Ordering::Relaxed)
  }
  #[cfg(not(debug_assertions))]
  {
    0
  }
}

/// Highest value `current_usage` has reached in this process. Always 0 in
/// release builds.
pub fn peak_usage() -> u64 {
  #[cfg(debug_assertions)]
  {
    MAX_USAGE.load(Ordering::Relaxed)
  }
  #[cfg(not(debug_assertions))]
  {
    0
  }
}

/// Memory available to the process. Not measured on desktop platforms;
/// returns `u64::MAX` for "unknown".
pub fn available_memory() -> u64 {
  u64::MAX
}

// =============================================================================
// Header Recovery
// =============================================================================

// Prepadded blocks are a "fat allocation": size and element count sit in
// front of the data region at fixed offsets. Only the data pointer crosses
// the public boundary; these helpers are the single place that walks back.

#[inline(always)]
unsafe fn block_base(data: *mut u8) -> *mut u8 {
  unsafe { data.sub(DATA_OFFSET) }
}

#[inline(always)]
unsafe fn size_field(base: *mut u8) -> *mut u64 {
  unsafe { base.add(SIZE_OFFSET) as *mut u64 }
}

#[inline(always)]
unsafe fn count_field(base: *mut u8) -> *mut u64 {
  unsafe { base.add(ELEMENT_OFFSET) as *mut u64 }
}

/// Whether a block gets the header prefix. Debug builds prepad every block
/// so the usage counters can recover sizes at free time.
#[inline(always)]
fn prepad(with_header: bool) -> bool {
  cfg!(debug_assertions) || with_header
}

// =============================================================================
// Static Allocator
// =============================================================================

/// Fallible allocation: null on exhaustion. The aligned and array paths
/// build on this so they can surface null instead of aborting.
fn try_alloc(bytes: usize, with_header: bool) -> *mut u8 {
  let prepad = prepad(with_header);

  let total = if prepad {
    match bytes.checked_add(DATA_OFFSET) {
      Some(total) => total,
      None => return null_mut(),
    }
  } else {
    // malloc(0) may legally return null; keep "success means non-null".
    bytes.max(1)
  };

  let base = unsafe { os_malloc(total) };
  if base.is_null() {
    return null_mut();
  }
  ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);

  if prepad {
    unsafe {
      *size_field(base) = bytes as u64;
      #[cfg(debug_assertions)]
      track_alloc(bytes as u64);
      base.add(DATA_OFFSET)
    }
  } else {
    base
  }
}

/// Allocate `bytes` of raw memory, reserving the metadata header when
/// `with_header` is set. Never returns null: exhaustion aborts the process.
///
/// The returned pointer satisfies [`MAX_ALIGN`] when the header is enabled,
/// and the system allocator's guarantee otherwise.
pub fn alloc(bytes: usize, with_header: bool) -> *mut u8 {
  let mem = try_alloc(bytes, with_header);
  if mem.is_null() {
    oom_abort(bytes);
  }
  mem
}

/// Grow or shrink a block from [`alloc`]/[`realloc`], preserving contents up
/// to the smaller of the two sizes. A null `ptr` behaves as a fresh
/// allocation; `bytes == 0` frees the block and returns null.
///
/// # Safety
///
/// `ptr` must be null or come from [`alloc`]/[`realloc`] with the same
/// `with_header` flag, and must not be used again after this call.
pub unsafe fn realloc(ptr: *mut u8, bytes: usize, with_header: bool) -> *mut u8 {
  if ptr.is_null() {
    return alloc(bytes, with_header);
  }

  if prepad(with_header) {
    let base = unsafe { block_base(ptr) };
    #[cfg(debug_assertions)]
    let old_bytes = unsafe { *size_field(base) };

    if bytes == 0 {
      #[cfg(debug_assertions)]
      track_free(old_bytes);
      ALLOC_COUNT.fetch_sub(1, Ordering::Relaxed);
      unsafe { os_free(base) };
      return null_mut();
    }

    let total = match bytes.checked_add(DATA_OFFSET) {
      Some(total) => total,
      None => oom_abort(bytes),
    };
    let new_base = unsafe { os_realloc(base, total) };
    if new_base.is_null() {
      oom_abort(bytes);
    }
    unsafe {
      *size_field(new_base) = bytes as u64;
      #[cfg(debug_assertions)]
      track_realloc(old_bytes, bytes as u64);
      new_base.add(DATA_OFFSET)
    }
  } else {
    if bytes == 0 {
      ALLOC_COUNT.fetch_sub(1, Ordering::Relaxed);
      unsafe { os_free(ptr) };
      return null_mut();
    }
    let mem = unsafe { os_realloc(ptr, bytes) };
    if mem.is_null() {
      oom_abort(bytes);
    }
    mem
  }
}

/// Release a block from [`alloc`]/[`realloc`]. Null is a no-op. Double-free
/// and a mismatched `with_header` flag are undefined behavior, not detected.
///
/// # Safety
///
/// `ptr` must be null or come from [`alloc`]/[`realloc`] with the same
/// `with_header` flag, freed exactly once.
pub unsafe fn free(ptr: *mut u8, with_header: bool) {
  if ptr.is_null() {
    return;
  }
  ALLOC_COUNT.fetch_sub(1, Ordering::Relaxed);

  if prepad(with_header) {
    let base = unsafe { block_base(ptr) };
    #[cfg(debug_assertions)]
    unsafe {
      track_free(*size_field(base));
    }
    unsafe { os_free(base) };
  } else {
    unsafe { os_free(ptr) };
  }
}

// =============================================================================
// Aligned Allocator
// =============================================================================

// Layout of an aligned block, relative to the underlying allocation:
//
//   [ leading pad | u32 offset | data (aligned, returned) | trailing pad ]
//
// The u32 immediately before the returned pointer records the distance back
// to the underlying allocation so free can recover it.

/// Allocate `bytes` with the returned pointer aligned to `alignment`, which
/// must be a power of two. Returns null on exhaustion (soft failure).
pub fn alloc_aligned(bytes: usize, alignment: usize) -> *mut u8 {
  debug_assert!(alignment.is_power_of_two());

  // Worst case needs alignment - 1 bytes of shift plus the offset field.
  let total = match bytes.checked_add(alignment - 1 + size_of::<u32>()) {
    Some(total) => total,
    None => return null_mut(),
  };
  let base = try_alloc(total, false);
  if base.is_null() {
    return null_mut();
  }

  let aligned = align_up(base as usize + size_of::<u32>(), alignment);
  let offset = (aligned - base as usize) as u32;
  unsafe {
    *(aligned as *mut u32).sub(1) = offset;
  }
  aligned as *mut u8
}

/// Reallocate an aligned block. Contents are preserved up to
/// `min(prev_bytes, bytes)`. The old block is released even when the new
/// allocation fails, in which case null is returned and the contents are
/// gone.
///
/// # Safety
///
/// `ptr` must be null or come from [`alloc_aligned`]/[`realloc_aligned`],
/// `prev_bytes` must be its requested size, and it must not be used again
/// after this call.
pub unsafe fn realloc_aligned(
  ptr: *mut u8,
  bytes: usize,
  prev_bytes: usize,
  alignment: usize,
) -> *mut u8 {
  if ptr.is_null() {
    return alloc_aligned(bytes, alignment);
  }

  let new_ptr = alloc_aligned(bytes, alignment);
  if !new_ptr.is_null() {
    unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, prev_bytes.min(bytes)) };
  }
  unsafe { free_aligned(ptr) };
  new_ptr
}

/// Release a block from [`alloc_aligned`]/[`realloc_aligned`].
///
/// # Safety
///
/// `ptr` must come from [`alloc_aligned`]/[`realloc_aligned`] and be freed
/// exactly once. Null is not valid input.
pub unsafe fn free_aligned(ptr: *mut u8) {
  unsafe {
    let offset = *(ptr as *const u32).sub(1);
    free(ptr.sub(offset as usize), false);
  }
}

// =============================================================================
// Array Allocation Facility
// =============================================================================

/// Allocate storage for `count` elements of `T`, defaulting each element in
/// ascending index order. The element count is recoverable from the returned
/// pointer via [`array_len`].
///
/// Returns null for `count == 0` (no allocation happens) and on exhaustion;
/// no elements are constructed in either case.
pub fn alloc_array<T: Default>(count: usize) -> *mut T {
  let data = unsafe { alloc_array_uninit::<T>(count) };
  if data.is_null() {
    return data;
  }
  for i in 0..count {
    unsafe { ptr::write(data.add(i), T::default()) };
  }
  data
}

/// [`alloc_array`] without element construction, for element types the
/// caller initializes itself. The count header is still stored, so
/// [`array_len`] and [`free_array`] work as usual.
///
/// # Safety
///
/// Every element must be initialized before the array is read or passed to
/// [`free_array`] with a `T` that needs dropping.
pub unsafe fn alloc_array_uninit<T>(count: usize) -> *mut T {
  if count == 0 {
    return null_mut();
  }
  let bytes = match size_of::<T>().checked_mul(count) {
    Some(bytes) => bytes,
    None => return null_mut(),
  };
  let mem = try_alloc(bytes, true);
  if mem.is_null() {
    return null_mut();
  }
  unsafe {
    *count_field(block_base(mem)) = count as u64;
  }
  mem as *mut T
}

/// Recover the element count of an array allocation from its data pointer.
///
/// # Safety
///
/// `ptr` must come from [`alloc_array`]/[`alloc_array_uninit`] and not have
/// been freed.
pub unsafe fn array_len<T>(ptr: *const T) -> usize {
  unsafe { *count_field(block_base(ptr as *mut u8)) as usize }
}

/// Drop every element in ascending index order (when `T` needs dropping) and
/// release the array. Null is not valid input: zero-length arrays never
/// allocate, so there is nothing to free.
///
/// # Safety
///
/// `ptr` must come from [`alloc_array`]/[`alloc_array_uninit`] with all
/// elements initialized, and be freed exactly once.
pub unsafe fn free_array<T>(ptr: *mut T) {
  unsafe {
    if needs_drop::<T>() {
      let count = array_len(ptr);
      for i in 0..count {
        ptr::drop_in_place(ptr.add(i));
      }
    }
    free(ptr as *mut u8, true);
  }
}

// =============================================================================
// Spin Lock
// =============================================================================

// The implementations below avoid false sharing by padding to the assumed
// cache line size. Padding instead of an align attribute: lock instances may
// end up packed in arrays where alignment would not be honored anyway.

/// Busy-wait hint between lock attempts. Pure, stateless, selected at
/// compile time per target CPU family.
#[cfg(all(feature = "threads", not(target_vendor = "apple")))]
#[inline(always)]
fn cpu_pause() {
  #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
  unsafe {
    core::arch::asm!("pause", options(nomem, nostack, preserves_flags));
  }

  #[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
  unsafe {
    core::arch::asm!("yield", options(nomem, nostack, preserves_flags));
  }

  #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
  unsafe {
    // Zihintpause "pause" encoding; decodes as a plain hint on older cores.
    core::arch::asm!(".insn i 0x0F, 0, x0, x0, 0x010", options(nomem, nostack, preserves_flags));
  }

  #[cfg(target_arch = "loongarch64")]
  for _ in 0..32 {
    // Repeated ibar approximates the latency of the x86 pause instruction.
    unsafe { core::arch::asm!("ibar 0", options(nostack, preserves_flags)) };
  }

  // Architectures without stable inline asm get the compiler's own hint,
  // which lowers to the platform pause instruction where one exists.
  #[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "arm",
    target_arch = "aarch64",
    target_arch = "riscv32",
    target_arch = "riscv64",
    target_arch = "loongarch64",
  )))]
  core::hint::spin_loop();
}

/// Unfair, non-reentrant mutual exclusion sized to one cache line.
///
/// `lock` busy-waits with no timeout or queuing; a thread re-locking a lock
/// it already holds deadlocks. Apple targets delegate to the kernel-assisted
/// unfair lock; elsewhere this is an atomic flag with a per-architecture
/// pause between attempts. With the `threads` feature disabled both
/// operations are no-ops so call sites need no conditional compilation.
#[cfg(all(feature = "threads", target_vendor = "apple"))]
pub struct SpinLock {
  lock: UnsafeCell<libc::os_unfair_lock>,
  _pad: [u8; CACHE_LINE_BYTES - size_of::<libc::os_unfair_lock>()],
}

#[cfg(all(feature = "threads", target_vendor = "apple"))]
impl SpinLock {
  pub const fn new() -> Self {
    Self {
      lock: UnsafeCell::new(libc::OS_UNFAIR_LOCK_INIT),
      _pad: [0; CACHE_LINE_BYTES - size_of::<libc::os_unfair_lock>()],
    }
  }

  #[inline(always)]
  pub fn lock(&self) {
    unsafe { libc::os_unfair_lock_lock(self.lock.get()) };
  }

  #[inline(always)]
  pub fn unlock(&self) {
    unsafe { libc::os_unfair_lock_unlock(self.lock.get()) };
  }
}

// SAFETY: os_unfair_lock is the kernel's thread-safe lock primitive; all
// access goes through its lock/unlock entry points.
#[cfg(all(feature = "threads", target_vendor = "apple"))]
unsafe impl Send for SpinLock {}
#[cfg(all(feature = "threads", target_vendor = "apple"))]
unsafe impl Sync for SpinLock {}

#[cfg(all(feature = "threads", not(target_vendor = "apple")))]
pub struct SpinLock {
  locked: AtomicBool,
  _pad: [u8; CACHE_LINE_BYTES - 1],
}

#[cfg(all(feature = "threads", not(target_vendor = "apple")))]
impl SpinLock {
  pub const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
      _pad: [0; CACHE_LINE_BYTES - 1],
    }
  }

  #[inline(always)]
  pub fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      // Wait on a relaxed load rather than hammering the CAS.
      while self.locked.load(Ordering::Relaxed) {
        cpu_pause();
      }
    }
  }

  #[inline(always)]
  pub fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

#[cfg(not(feature = "threads"))]
pub struct SpinLock;

#[cfg(not(feature = "threads"))]
impl SpinLock {
  pub const fn new() -> Self {
    Self
  }

  #[inline(always)]
  pub fn lock(&self) {}

  #[inline(always)]
  pub fn unlock(&self) {}
}

impl Default for SpinLock {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be
/// a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod prop_tests {
  use proptest::prelude::*;

  proptest! {
    #[test]
    fn aligned_pointers_always_aligned(bytes in 1usize..4096, shift in 0u32..12) {
      let alignment = 1usize << shift;
      let ptr = crate::alloc_aligned(bytes, alignment);
      prop_assert!(!ptr.is_null());
      prop_assert_eq!(ptr as usize % alignment, 0);
      unsafe {
        ptr.write_bytes(0xA5, bytes);
        crate::free_aligned(ptr);
      }
    }

    #[test]
    fn array_count_recoverable(count in 1usize..1024) {
      let ptr = crate::alloc_array::<u32>(count);
      prop_assert!(!ptr.is_null());
      let len = unsafe { crate::array_len(ptr) };
      unsafe { crate::free_array(ptr) };
      prop_assert_eq!(len, count);
    }

    #[test]
    fn realloc_keeps_original_prefix(seed in 0u8..=255u8, grow in 1usize..2048) {
      let ptr = crate::alloc(64, true);
      unsafe {
        for i in 0..64 {
          *ptr.add(i) = seed.wrapping_add(i as u8);
        }
        let grown = crate::realloc(ptr, 64 + grow, true);
        prop_assert!(!grown.is_null());
        let mut ok = true;
        for i in 0..64 {
          ok &= *grown.add(i) == seed.wrapping_add(i as u8);
        }
        crate::free(grown, true);
        prop_assert!(ok);
      }
    }
  }
}
