//! Integration tests for arena composition and diagnostics
//!
//! Region allocators can serve as the upstream of another arena, and report
//! their events to a shared sink.

#![no_std]

extern crate alloc;
extern crate region_allocator;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use kspin::SpinNoIrq;
use region_allocator::{
    AllocError, AllocResult, BlockInfo, BoundaryTagAllocator, BuddyAllocator, DiagnosticSink,
    FitMode, GlobalHeap, Severity, UpstreamAllocator,
};

/// Sink keeping every message for inspection.
struct Collect {
    lines: SpinNoIrq<Vec<(Severity, String)>>,
}

impl Collect {
    fn new() -> Self {
        Self {
            lines: SpinNoIrq::new(Vec::new()),
        }
    }

    fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.lines
            .lock()
            .iter()
            .any(|(level, line)| *level == severity && line.contains(needle))
    }
}

impl DiagnosticSink for Collect {
    fn log(&self, severity: Severity, message: fmt::Arguments<'_>) {
        self.lines.lock().push((severity, message.to_string()));
    }
}

/// Upstream counting outstanding regions.
struct Counting {
    heap: GlobalHeap,
    live: AtomicUsize,
}

impl Counting {
    fn new() -> Self {
        Self {
            heap: GlobalHeap::new(),
            live: AtomicUsize::new(0),
        }
    }
}

impl UpstreamAllocator for Counting {
    fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        let ptr = self.heap.allocate(size)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(ptr)
    }

    fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.heap.deallocate(ptr, size);
    }
}

/// Upstream that never has memory.
struct Empty;

impl UpstreamAllocator for Empty {
    fn allocate(&self, _size: usize) -> AllocResult<NonNull<u8>> {
        Err(AllocError::NoMemory)
    }

    fn deallocate(&self, _ptr: NonNull<u8>, _size: usize) {
        unreachable!("nothing was handed out");
    }
}

#[test]
fn test_boundary_tags_inside_buddy() {
    let buddy = Arc::new(BuddyAllocator::new(4096, None, None, FitMode::FirstFit).unwrap());
    let upstream: Arc<dyn UpstreamAllocator> = buddy.clone();

    let inner = BoundaryTagAllocator::new(512, Some(upstream), None, FitMode::FirstFit).unwrap();
    assert_eq!(
        buddy.list_blocks(),
        vec![
            BlockInfo::new(1024, true),
            BlockInfo::new(1024, false),
            BlockInfo::new(2048, false)
        ]
    );

    let ptr = inner.allocate(64).unwrap();
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0xC3, 64) };
    inner.deallocate(ptr.as_ptr()).unwrap();

    drop(inner);
    assert_eq!(buddy.list_blocks(), vec![BlockInfo::new(4096, false)]);
}

#[test]
fn test_buddy_inside_boundary_tags() {
    let outer = Arc::new(BoundaryTagAllocator::new(8192, None, None, FitMode::BestFit).unwrap());
    let upstream: Arc<dyn UpstreamAllocator> = outer.clone();
    let inner = BuddyAllocator::new(1024, Some(upstream), None, FitMode::FirstFit).unwrap();
    assert_eq!(outer.list_blocks().len(), 2);
    assert!(outer.list_blocks()[0].occupied);

    let ptr = inner.allocate(200).unwrap();
    inner.deallocate(ptr.as_ptr()).unwrap();

    drop(inner);
    assert_eq!(outer.list_blocks(), vec![BlockInfo::new(8192, false)]);
}

#[test]
fn test_region_released_exactly_once() {
    let counting = Arc::new(Counting::new());
    {
        let upstream: Arc<dyn UpstreamAllocator> = counting.clone();
        let boundary =
            BoundaryTagAllocator::new(1024, Some(upstream.clone()), None, FitMode::FirstFit)
                .unwrap();
        let buddy = BuddyAllocator::new(1024, Some(upstream), None, FitMode::FirstFit).unwrap();
        assert_eq!(counting.live.load(Ordering::SeqCst), 2);

        // Moving the allocator moves the region with it.
        let moved = boundary;
        moved.allocate(10).unwrap();
        drop(buddy);
        assert_eq!(counting.live.load(Ordering::SeqCst), 1);
    }
    assert_eq!(counting.live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_upstream_failure_is_reported() {
    let upstream: Arc<dyn UpstreamAllocator> = Arc::new(Empty);
    let result = BoundaryTagAllocator::new(1024, Some(upstream.clone()), None, FitMode::FirstFit);
    assert!(matches!(result, Err(AllocError::NoMemory)));
    let result = BuddyAllocator::new(1024, Some(upstream), None, FitMode::FirstFit);
    assert!(matches!(result, Err(AllocError::NoMemory)));
}

#[test]
fn test_sink_receives_events() {
    let sink = Arc::new(Collect::new());
    let allocator =
        BoundaryTagAllocator::new(1024, None, Some(sink.clone()), FitMode::FirstFit).unwrap();

    let a = allocator.allocate(64).unwrap();
    let b = allocator.allocate(64).unwrap();
    assert!(sink.contains(Severity::Debug, "allocating 64 bytes"));
    assert!(sink.contains(Severity::Debug, "split block"));

    allocator.deallocate(a.as_ptr()).unwrap();
    allocator.deallocate(b.as_ptr()).unwrap();
    assert!(sink.contains(Severity::Debug, "merged block"));

    assert_eq!(allocator.deallocate(b.as_ptr()), Err(AllocError::NotAllocated));
    assert!(sink.contains(Severity::Error, "double free"));

    assert_eq!(allocator.allocate(4096), Err(AllocError::NoMemory));
    assert!(sink.contains(Severity::Error, "unable to allocate"));
}

#[test]
fn test_buddy_sink_receives_events() {
    let sink = Arc::new(Collect::new());
    let allocator =
        BuddyAllocator::new(1024, None, Some(sink.clone()), FitMode::FirstFit).unwrap();

    let ptr = allocator.allocate(1).unwrap();
    assert!(sink.contains(Severity::Debug, "buddy system: split block"));
    allocator.deallocate(ptr.as_ptr()).unwrap();
    assert!(sink.contains(Severity::Debug, "buddy system: merged buddies"));
    assert_eq!(allocator.deallocate(ptr.as_ptr()), Err(AllocError::NotAllocated));
    assert!(sink.contains(Severity::Error, "buddy system: double free"));
}

#[test]
fn test_construction_errors_reach_sink() {
    let sink = Arc::new(Collect::new());
    let result = BoundaryTagAllocator::new(8, None, Some(sink.clone()), FitMode::FirstFit);
    assert!(matches!(result, Err(AllocError::InvalidParam)));
    assert!(sink.contains(Severity::Error, "cannot hold the arena"));

    let heap = GlobalHeap::with_sink(sink.clone());
    let ptr = heap.allocate(64).unwrap();
    heap.deallocate(ptr, 64);
    assert!(sink.contains(Severity::Debug, "global heap: allocated 64 bytes"));
}
