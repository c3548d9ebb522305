//! Element array allocation.
//!
//! Thread storage blocks allocate their element arrays through an
//! [`ElementAllocator`]. The trait exposes one optional capability beyond
//! plain allocate/free: growing an existing allocation in place once it is
//! above a size threshold. Allocators without that capability fall back to
//! allocate-copy-swap. Allocators that round requests up can also report the
//! usable size of an allocation so blocks adopt the slack as capacity.

use std::alloc::Layout;

/// Allocator used for thread storage block element arrays.
///
/// # Safety
///
/// `allocate_zeroed` must return either null or a pointer to a zero-filled
/// block valid for `layout`. `grow_in_place` may only report success if the
/// block at `ptr` is now valid for `new` without having moved. `usable_size`
/// must never report fewer bytes than `layout.size()`, and every byte it
/// reports must be valid for reads and writes.
#[allow(unsafe_code)]
pub unsafe trait ElementAllocator: Send + Sync + 'static {
    /// Allocate a zero-filled block, or return null on failure.
    fn allocate_zeroed(&self, layout: Layout) -> *mut u8;

    /// Free a block previously returned by this allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator. `layout` must be the layout it
    /// was allocated or last grown with, or any layout of the same alignment
    /// whose size lies between that and its `usable_size`.
    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout);

    /// Bytes actually usable in an allocation made with `layout`.
    fn usable_size(&self, layout: Layout) -> usize {
        layout.size()
    }

    /// Smallest current allocation size, in bytes, for which in-place growth
    /// is worth attempting. `None` disables the in-place path.
    fn min_in_place_bytes(&self) -> Option<usize> {
        None
    }

    /// Try to extend the block at `ptr` from `old` to `new` without moving it.
    /// The contents of the grown range are unspecified on success.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator and `old` must satisfy the same
    /// rule as the layout passed to `deallocate`. `new.size() >= old.size()`
    /// with the same alignment.
    unsafe fn grow_in_place(&self, ptr: *mut u8, old: Layout, new: Layout) -> bool {
        let _ = (ptr, old, new);
        false
    }
}

/// The global Rust allocator. Has no in-place growth capability.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

// SAFETY: forwards to the global allocator, which upholds the contract.
#[allow(unsafe_code)]
unsafe impl ElementAllocator for SystemAllocator {
    fn allocate_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return std::ptr::null_mut();
        }
        // SAFETY: layout has non-zero size.
        unsafe { std::alloc::alloc_zeroed(layout) }
    }

    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() || layout.size() == 0 {
            return;
        }
        // SAFETY: caller guarantees ptr came from alloc_zeroed with this layout.
        unsafe { std::alloc::dealloc(ptr, layout) };
    }
}

/// Shared instance used by tags declared without an explicit allocator.
pub static SYSTEM_ALLOCATOR: SystemAllocator = SystemAllocator;
