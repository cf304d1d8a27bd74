//! Upstream allocator collaborator and the process-heap pass-through.

use alloc::alloc::{alloc, dealloc};
use alloc::sync::Arc;
use core::alloc::Layout;
use core::ptr::NonNull;

use crate::diagnostics::{DiagnosticSink, Diagnostics};
use crate::{AllocError, AllocResult, WORD_SIZE};

/// Supplier of the raw bytes backing an arena.
///
/// The arena is requested once at construction and handed back once, with
/// the same size, when the region allocator is dropped.
pub trait UpstreamAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to at least [`WORD_SIZE`].
    fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>>;

    /// Release a region previously returned by [`UpstreamAllocator::allocate`].
    fn deallocate(&self, ptr: NonNull<u8>, size: usize);
}

/// Direct pass-through to the global allocator.
#[derive(Debug, Clone, Default)]
pub struct GlobalHeap {
    diag: Diagnostics,
}

impl GlobalHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            diag: Diagnostics::new(Some(sink)),
        }
    }

    fn layout(size: usize) -> AllocResult<Layout> {
        Layout::from_size_align(size, WORD_SIZE).map_err(|_| AllocError::InvalidParam)
    }
}

impl UpstreamAllocator for GlobalHeap {
    fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        self.diag
            .debug(format_args!("global heap: allocating {} bytes", size));
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }

        let layout = Self::layout(size)?;
        match NonNull::new(unsafe { alloc(layout) }) {
            Some(ptr) => {
                self.diag.debug(format_args!(
                    "global heap: allocated {} bytes at {:#x}",
                    size,
                    ptr.as_ptr() as usize
                ));
                Ok(ptr)
            }
            None => {
                self.diag
                    .error(format_args!("global heap: unable to allocate {} bytes", size));
                Err(AllocError::NoMemory)
            }
        }
    }

    fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        self.diag.debug(format_args!(
            "global heap: releasing {} bytes at {:#x}",
            size,
            ptr.as_ptr() as usize
        ));
        match Self::layout(size) {
            // SAFETY: the region came from `allocate` with this very layout.
            Ok(layout) => unsafe { dealloc(ptr.as_ptr(), layout) },
            Err(_) => self.diag.error(format_args!(
                "global heap: refusing to release {:#x} with invalid size {}",
                ptr.as_ptr() as usize,
                size
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_heap_roundtrip() {
        let heap = GlobalHeap::new();
        let ptr = heap.allocate(256).unwrap();
        assert_eq!(ptr.as_ptr() as usize % WORD_SIZE, 0);

        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0xA5, 256);
            assert_eq!(*ptr.as_ptr().add(255), 0xA5);
        }

        heap.deallocate(ptr, 256);
    }

    #[test]
    fn test_global_heap_rejects_zero() {
        let heap = GlobalHeap::new();
        assert_eq!(heap.allocate(0), Err(AllocError::InvalidParam));
    }
}
