//! Allocation counting for `--memory`.
//!
//! A thin wrapper around the system allocator keeps global atomic totals.
//! The binary installs it as the global allocator; the harness reads
//! snapshot deltas around the measured phase. When the wrapper is not
//! installed (library tests, embedders with their own allocator), the
//! counters stay at zero and memory stats are omitted.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static ALLOCATED_BYTES: AtomicU64 = AtomicU64::new(0);
static ALLOCATION_COUNT: AtomicU64 = AtomicU64::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// System-allocator wrapper that counts allocations.
pub struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ALLOCATED_BYTES.fetch_add(layout.size() as u64, Ordering::Relaxed);
        ALLOCATION_COUNT.fetch_add(1, Ordering::Relaxed);
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        ALLOCATED_BYTES.fetch_add(layout.size() as u64, Ordering::Relaxed);
        ALLOCATION_COUNT.fetch_add(1, Ordering::Relaxed);
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let grown = new_size.saturating_sub(layout.size()) as u64;
        ALLOCATED_BYTES.fetch_add(grown, Ordering::Relaxed);
        ALLOCATION_COUNT.fetch_add(1, Ordering::Relaxed);
        unsafe { System.realloc(ptr, layout, new_size) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

/// Record that [`CountingAllocator`] is the process's global allocator.
/// Called once from the binary before any measurement.
pub fn mark_installed() {
    INSTALLED.store(true, Ordering::Relaxed);
}

/// Whether allocation counters are live in this process.
pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Relaxed)
}

/// A point-in-time reading of the allocation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocSnapshot {
    pub bytes: u64,
    pub count: u64,
}

pub fn snapshot() -> AllocSnapshot {
    AllocSnapshot {
        bytes: ALLOCATED_BYTES.load(Ordering::Relaxed),
        count: ALLOCATION_COUNT.load(Ordering::Relaxed),
    }
}

impl AllocSnapshot {
    /// Bytes and allocations since `earlier`.
    pub fn since(&self, earlier: &AllocSnapshot) -> (u64, u64) {
        (
            self.bytes.wrapping_sub(earlier.bytes),
            self.count.wrapping_sub(earlier.count),
        )
    }
}
