//! The general allocator that [`ExecMem`](crate::ExecMem) falls back on.
//!
//! Programs are loaded through a `malloc`/`free` style interface, so freeing
//! only gets a pointer back. [`Heap`] implements that interface on top of
//! Rust's global allocator by storing each allocation's [`Layout`] in a small
//! header placed just before the returned buffer.

use std::{alloc::Layout, ptr::NonNull};

use static_assertions::const_assert;

/// The alignment used for [`Heap`] allocations. This is 8 bytes because that is
/// the largest alignment a loaded program's sections ask for.
///
/// Always a power of two.
pub const DEFAULT_ALIGNMENT: usize = 8;

const_assert!(DEFAULT_ALIGNMENT.is_power_of_two());

/// A `malloc`/`free` pair.
///
/// # Safety
///
/// Implementors must return pointers to distinct, writable regions of at least
/// the requested size that stay valid until passed back to [`free`](Self::free).
pub unsafe trait GeneralAllocator {
    /// Allocates `size` bytes, returning `None` when the heap is exhausted.
    fn malloc(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Returns memory to the heap.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`malloc`](Self::malloc) on this allocator
    /// and must not have been freed already.
    unsafe fn free(&mut self, ptr: NonNull<u8>);
}

unsafe impl<A: GeneralAllocator + ?Sized> GeneralAllocator for &mut A {
    fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        (**self).malloc(size)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // SAFETY: forwarded from the caller.
        unsafe { (**self).free(ptr) }
    }
}

/// A plan for allocating a buffer with a header.
///
/// # Invariants
///
/// - [`Self::header_size`] is always greater than or equal to the size of [`AllocMetadata`]
///   and aligned to [`Self::align`].
/// - [`Self::align`] is a power of two.
#[derive(Debug, Clone, Copy)]
struct AllocationPlan {
    header_size: usize,
    allocation_size: usize,
    align: usize,
}

impl AllocationPlan {
    /// Plans an allocation holding `size` bytes of data at [`DEFAULT_ALIGNMENT`].
    ///
    /// Returns `None` if the total size overflows.
    const fn for_size(size: usize) -> Option<Self> {
        let header_size = Self::header_size(DEFAULT_ALIGNMENT);
        let Some(allocation_size) = header_size.checked_add(size) else {
            return None;
        };

        Some(Self {
            header_size,
            allocation_size,
            align: DEFAULT_ALIGNMENT,
        })
    }

    /// Returns a non-zero-sized Layout suitable for storing the allocation's
    /// header and buffer.
    fn layout(&self) -> Option<Layout> {
        Layout::from_size_align(self.allocation_size, self.align).ok()
    }

    const fn header_size(align: usize) -> usize {
        // Big enough for the metadata and aligned like the buffer so the two
        // can be concatenated.
        size_of::<AllocMetadata>().next_multiple_of(align)
    }
}

/// Describes an allocation. Stored in memory right before the buffer.
#[derive(Debug)]
struct AllocMetadata {
    layout: Layout,
}

const_assert!(DEFAULT_ALIGNMENT >= align_of::<AllocMetadata>());

/// A buffer of memory prefixed by a header containing metadata.
#[repr(transparent)]
#[derive(Debug)]
struct AllocationPtr(NonNull<u8>);

impl AllocationPtr {
    /// Allocates a new buffer, or returns None.
    fn alloc(plan: AllocationPlan) -> Option<Self> {
        let layout = plan.layout()?;

        // SAFETY: the layout always includes a non-empty header.
        let memory = NonNull::new(unsafe { std::alloc::alloc(layout) })?;

        // SAFETY: the header and buffer are part of the same allocation.
        let allocation = Self(unsafe { memory.add(plan.header_size) });

        // SAFETY: we have exclusive access to the fresh allocation.
        unsafe {
            allocation.metadata().write(AllocMetadata { layout });
        }

        Some(allocation)
    }

    /// Deallocates this allocation.
    ///
    /// # Safety
    ///
    /// The pointer must have come from [`Self::alloc`] and not been freed.
    unsafe fn dealloc(self) {
        // SAFETY: allocations are always prefixed with an AllocMetadata.
        let metadata = unsafe { self.metadata().read() };
        // SAFETY: the header lives in the same allocation.
        let base = unsafe {
            self.0
                .sub(AllocationPlan::header_size(metadata.layout.align()))
        };

        // SAFETY: `base` is what `alloc` returned, with the same layout.
        unsafe {
            std::alloc::dealloc(base.as_ptr(), metadata.layout);
        }
    }

    /// Returns a pointer to the metadata stored just before this buffer.
    ///
    /// This is not the beginning of the header; the metadata is only the last
    /// `size_of::<AllocMetadata>()` bytes of it. The rest is padding.
    const fn metadata(&self) -> NonNull<AllocMetadata> {
        // SAFETY: allocations are always prefixed with an AllocMetadata.
        unsafe { self.0.sub(size_of::<AllocMetadata>()).cast() }
    }
}

/// The process heap, reached through Rust's global allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Heap;

unsafe impl GeneralAllocator for Heap {
    fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let plan = AllocationPlan::for_size(size)?;
        AllocationPtr::alloc(plan).map(|allocation| allocation.0)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // SAFETY: caller guarantees ptr came from `malloc` and is still live.
        unsafe { AllocationPtr(ptr).dealloc() }
    }
}
