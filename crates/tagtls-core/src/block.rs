//! Per-thread storage blocks.
//!
//! Each thread that touches a tag gets one [`ThreadBlock`]: a growable array
//! of [`ElementWrapper`]s indexed by slot id.
//!
//! ## Sharing rules
//!
//! - Only the owning thread grows the array, and it publishes the new pointer
//!   and capacity while holding the registry lock.
//! - The owning thread reads pointer and capacity without the lock. It is the
//!   only writer, so it always observes its own latest values.
//! - Other threads touch a block only under the registry lock, and only to
//!   empty an element whose index lies inside the published capacity
//!   (slot destruction).
//! - Capacity never shrinks while the block is alive.
//!
//! Growth adopts any slack the allocator reports through
//! [`ElementAllocator::usable_size`](crate::alloc::ElementAllocator::usable_size)
//! as extra capacity.

use std::alloc::Layout;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::config;
use crate::alloc::ElementAllocator;
use crate::element::{DisposalMode, ElementWrapper, dispose_guarded};
use crate::error::TlsError;
use crate::exit_hook;
use crate::handle::SlotHandle;
use crate::registry::Registry;

/// One thread's element storage for one tag.
pub(crate) struct ThreadBlock {
    registry: &'static Registry,
    elements: AtomicPtr<ElementWrapper>,
    capacity: AtomicUsize,
    /// Set once exit teardown starts; a block in teardown is never relinked.
    exiting: AtomicBool,
}

fn element_layout(capacity: usize) -> Result<Layout, TlsError> {
    Layout::array::<ElementWrapper>(capacity).map_err(|_| TlsError::AllocationFailed {
        bytes: usize::MAX,
    })
}

/// Elements that fit in an allocation requested for `requested` elements.
fn usable_capacity(allocator: &dyn ElementAllocator, layout: Layout, requested: usize) -> usize {
    (allocator.usable_size(layout) / size_of::<ElementWrapper>()).max(requested)
}

impl ThreadBlock {
    pub(crate) fn new(registry: &'static Registry) -> Self {
        Self {
            registry,
            elements: AtomicPtr::new(ptr::null_mut()),
            capacity: AtomicUsize::new(0),
            exiting: AtomicBool::new(false),
        }
    }

    /// Published capacity. Exact on the owning thread; other threads must
    /// hold the registry lock.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Pointer to element `index`. Same access rules as [`Self::capacity`].
    #[inline]
    #[allow(unsafe_code)]
    pub(crate) fn element_ptr(&self, index: usize) -> *mut ElementWrapper {
        debug_assert!(index < self.capacity());
        // SAFETY: index is inside the published capacity of the live array.
        unsafe { self.elements.load(Ordering::Relaxed).add(index) }
    }

    /// Grow the element array so that `handle`'s id is addressable,
    /// allocating the id if needed. Must run on the owning thread.
    ///
    /// On failure the block is left exactly as it was.
    #[allow(unsafe_code)]
    pub(crate) fn reserve(&self, handle: &SlotHandle) -> Result<(), TlsError> {
        let registry = self.registry;
        let prev_capacity = self.capacity();
        let id = registry.allocate(handle)? as usize;
        if prev_capacity > id {
            return Ok(());
        }

        let requested = config::growth_policy().next_capacity(id, prev_capacity);
        let old_layout = element_layout(prev_capacity)?;
        let new_layout = element_layout(requested)?;
        let old_elements = self.elements.load(Ordering::Relaxed);
        let allocator = registry.allocator();

        // A concurrent slot destroy may be reading the old array. It must not
        // move except through a copy published under the lock.
        let mut grown_in_place = false;
        if prev_capacity > 0
            && allocator
                .min_in_place_bytes()
                .is_some_and(|min| old_layout.size() >= min)
        {
            // SAFETY: old_elements came from this allocator with old_layout.
            grown_in_place = unsafe {
                allocator.grow_in_place(old_elements.cast::<u8>(), old_layout, new_layout)
            };
        }

        let (target, zeroed) = if grown_in_place {
            (old_elements, prev_capacity)
        } else {
            let fresh = allocator.allocate_zeroed(new_layout).cast::<ElementWrapper>();
            if fresh.is_null() {
                return Err(TlsError::AllocationFailed {
                    bytes: new_layout.size(),
                });
            }
            (fresh, requested)
        };
        let new_capacity = usable_capacity(allocator, new_layout, requested);
        // Indices past prev_capacity are unpublished, so no other thread can
        // look at them yet.
        // SAFETY: the allocation is usable for new_capacity elements; the
        // ones below `zeroed` are already zero or hold live values.
        unsafe { ptr::write_bytes(target.add(zeroed), 0, new_capacity - zeroed) };
        let reallocated = if grown_in_place {
            ptr::null_mut()
        } else {
            target
        };

        {
            let mut state = registry.lock();
            if prev_capacity == 0 && !self.exiting.load(Ordering::Relaxed) {
                state.link(NonNull::from(self));
            }
            if !reallocated.is_null() {
                if prev_capacity != 0 {
                    // Copy under the lock: a concurrent destroy may be emptying
                    // one of these elements right now.
                    // SAFETY: both arrays hold at least prev_capacity elements
                    // and do not overlap.
                    unsafe {
                        ptr::copy_nonoverlapping(old_elements, reallocated, prev_capacity);
                    }
                }
                self.elements.store(reallocated, Ordering::Relaxed);
            }
            self.capacity.store(new_capacity, Ordering::Relaxed);
        }

        if !reallocated.is_null() && prev_capacity != 0 {
            // SAFETY: the old array is unpublished and its elements were moved
            // bitwise into the new one.
            unsafe { allocator.deallocate(old_elements.cast::<u8>(), old_layout) };
        }

        if !exit_hook::is_draining() {
            tracing::trace!(
                tag = registry.name(),
                id,
                prev_capacity,
                requested,
                new_capacity,
                grown_in_place,
                "grew thread-local element storage"
            );
        }
        Ok(())
    }

    /// Exit-hook callback: tear down the calling thread's block.
    ///
    /// Unlinks the block so slot destruction can no longer reach it, then
    /// disposes every element in [`DisposalMode::ThisThread`], repeating full
    /// passes until one disposes nothing. Deleters may touch storage under the
    /// same tag, re-populating or even growing this block.
    ///
    /// # Safety
    ///
    /// `ctx` must be a block created by [`Registry`] for the calling thread and
    /// registered with the exit hook; it is freed here and must not be used
    /// again.
    #[allow(unsafe_code)]
    pub(crate) unsafe fn on_thread_exit(ctx: NonNull<()>) {
        let block_ptr = ctx.cast::<ThreadBlock>();
        // SAFETY: caller contract.
        let block = unsafe { block_ptr.as_ref() };
        let registry = block.registry;

        block.exiting.store(true, Ordering::Relaxed);
        registry.lock().unlink(block_ptr);
        // The block is private to this thread from here on.

        loop {
            let mut disposed = 0_usize;
            let mut index = 0;
            // Re-read capacity each step: a deleter may have grown the array.
            while index < block.capacity() {
                // Move out before disposing; the deleter may reallocate the array.
                // SAFETY: index < capacity and no other thread can reach the block.
                let mut element = unsafe { (*block.element_ptr(index)).take() };
                if dispose_guarded(&mut element, DisposalMode::ThisThread, registry.name(), index)
                {
                    disposed += 1;
                }
                index += 1;
            }
            if disposed == 0 {
                break;
            }
        }

        let capacity = block.capacity.swap(0, Ordering::Relaxed);
        let elements = block.elements.swap(ptr::null_mut(), Ordering::Relaxed);
        if !elements.is_null() {
            if let Ok(layout) = element_layout(capacity) {
                // SAFETY: allocated by this registry's allocator with this layout.
                unsafe { registry.allocator().deallocate(elements.cast::<u8>(), layout) };
            }
        }
        registry.forget_current(block_ptr);

        // SAFETY: created with Box::new in Registry::create_block; nothing
        // references it any more.
        drop(unsafe { Box::from_raw(block_ptr.as_ptr()) });
    }
}
