//! Slot registry: the per-tag authority for slot ids and live thread blocks.
//!
//! A [`Registry`] owns id assignment and recycling for one tag and tracks
//! every [`ThreadBlock`] that has allocated storage under it. All of that
//! state sits behind one `parking_lot::Mutex`, which is also the lock thread
//! blocks take to publish growth. The lock is never held while a disposal
//! callback runs: callbacks may re-enter the registry.

use std::cell::Cell;
use std::collections::HashSet;
use std::ptr::{self, NonNull};
use std::thread::LocalKey;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::alloc::ElementAllocator;
use crate::block::ThreadBlock;
use crate::element::{DisposalMode, ElementWrapper, dispose_guarded};
use crate::error::TlsError;
use crate::exit_hook;
use crate::handle::{SlotHandle, UNASSIGNED_ID};

/// First id handed out by a fresh registry.
pub const FIRST_SLOT_ID: u32 = 1;

/// Per-thread pointer to the calling thread's block for one tag.
///
/// Declared by [`declare_tag!`](crate::declare_tag) as a `const`-initialized
/// `thread_local!`. It has no destructor, so it stays readable through the
/// whole of thread teardown, including the exit drain that frees the block.
#[doc(hidden)]
pub struct BlockCell(Cell<*mut ThreadBlock>);

impl BlockCell {
    #[must_use]
    pub const fn new() -> Self {
        Self(Cell::new(ptr::null_mut()))
    }
}

impl Default for BlockCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct BlockPtr(NonNull<ThreadBlock>);

// SAFETY: other threads only dereference a BlockPtr while holding the
// registry lock, under the block sharing rules.
#[allow(unsafe_code)]
unsafe impl Send for BlockPtr {}

/// Lock-protected registry state.
pub(crate) struct RegistryState {
    next_id: u32,
    free_ids: Vec<u32>,
    live: HashSet<BlockPtr>,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            next_id: FIRST_SLOT_ID,
            free_ids: Vec::new(),
            live: HashSet::new(),
        }
    }

    pub(crate) fn link(&mut self, block: NonNull<ThreadBlock>) {
        self.live.insert(BlockPtr(block));
    }

    pub(crate) fn unlink(&mut self, block: NonNull<ThreadBlock>) {
        self.live.remove(&BlockPtr(block));
    }
}

/// Point-in-time view of a registry, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Tag name the registry belongs to.
    pub tag: &'static str,
    /// Next id that would be minted when the free pool is empty.
    pub next_id: u32,
    /// Number of destroyed ids waiting for reuse.
    pub free_ids: usize,
    /// Threads with storage linked into the registry.
    pub live_blocks: usize,
}

/// Shared authority for one tag's slots.
pub struct Registry {
    name: &'static str,
    state: Mutex<RegistryState>,
    current: &'static LocalKey<BlockCell>,
    allocator: &'static dyn ElementAllocator,
}

impl Registry {
    /// Create a registry. Normally called once per tag by
    /// [`declare_tag!`](crate::declare_tag).
    #[must_use]
    pub fn new(
        name: &'static str,
        current: &'static LocalKey<BlockCell>,
        allocator: &'static dyn ElementAllocator,
    ) -> Self {
        Self {
            name,
            state: Mutex::new(RegistryState::new()),
            current,
            allocator,
        }
    }

    /// Tag name, used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn allocator(&self) -> &'static dyn ElementAllocator {
        self.allocator
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    /// Id for `handle`, assigning one on first use.
    ///
    /// Idempotent: racing first accesses serialize on the lock and all observe
    /// the id published by the winner. Freed ids are reused (most recently
    /// freed first) before new ones are minted.
    pub fn allocate(&self, handle: &SlotHandle) -> Result<u32, TlsError> {
        if let Some(id) = handle.id() {
            return Ok(id);
        }

        let mut state = self.lock();
        if let Some(id) = handle.id() {
            return Ok(id);
        }

        let id = match state.free_ids.pop() {
            Some(id) => id,
            None => {
                if state.next_id == UNASSIGNED_ID {
                    return Err(TlsError::IdSpaceExhausted);
                }
                let id = state.next_id;
                state.next_id += 1;
                id
            }
        };
        handle.assign(id);
        Ok(id)
    }

    /// Release `handle`'s id and dispose every thread's value for it.
    ///
    /// Values are moved out of every live block under the lock and disposed
    /// in [`DisposalMode::AllThreads`] after it is released. Destroying an
    /// unassigned handle is a no-op. Panicking deleters are logged and
    /// discarded; the id is back in the free pool before any deleter runs.
    ///
    /// Returns the number of values disposed.
    ///
    /// No thread may access the slot once `destroy` has started.
    #[allow(unsafe_code)]
    pub fn destroy(&self, handle: &SlotHandle) -> usize {
        let mut captured: Vec<ElementWrapper> = Vec::new();
        let id = {
            let mut state = self.lock();
            let Some(id) = handle.take() else {
                return 0;
            };
            let index = id as usize;

            for block in &state.live {
                // SAFETY: linked blocks stay alive until their owning thread
                // unlinks them under this lock.
                let block = unsafe { block.0.as_ref() };
                if index >= block.capacity() {
                    continue;
                }
                // SAFETY: index is inside the capacity published under this
                // lock; the owning thread no longer accesses this slot.
                let element = unsafe { &mut *block.element_ptr(index) };
                if element.is_set() {
                    captured.push(element.take());
                }
            }
            state.free_ids.push(id);
            id
        };

        let mut disposed = 0;
        for mut element in captured {
            if dispose_guarded(&mut element, DisposalMode::AllThreads, self.name, id as usize) {
                disposed += 1;
            }
        }
        if !exit_hook::is_draining() {
            tracing::trace!(tag = self.name, id, disposed, "destroyed thread-local slot");
        }
        disposed
    }

    /// The calling thread's storage cell for `handle`, creating the thread's
    /// block and growing it as needed.
    ///
    /// The pointer stays valid until the next growth of this thread's block
    /// (any `get` on a handle of the same tag may grow it) or until thread
    /// exit. Callers must not keep it across such a call.
    #[inline]
    #[allow(unsafe_code)]
    pub fn get(&'static self, handle: &SlotHandle) -> Result<NonNull<ElementWrapper>, TlsError> {
        let block = self.current_block()?;
        // SAFETY: the current thread's block lives until this thread exits.
        let block = unsafe { block.as_ref() };
        loop {
            // An unassigned handle reads as u32::MAX, which never fits.
            let id = handle.raw() as usize;
            if id < block.capacity() {
                // SAFETY: id < capacity; pointer derived from the live array.
                return Ok(unsafe { NonNull::new_unchecked(block.element_ptr(id)) });
            }
            block.reserve(handle)?;
        }
    }

    /// Capacity of the calling thread's block (0 if it has none).
    #[must_use]
    #[allow(unsafe_code)]
    pub fn local_capacity(&self) -> usize {
        let block = self.current.with(|cell| cell.0.get());
        // SAFETY: the current thread's block lives until this thread exits.
        NonNull::new(block).map_or(0, |block| unsafe { block.as_ref() }.capacity())
    }

    /// Snapshot of ids and live blocks.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.lock();
        RegistryStats {
            tag: self.name,
            next_id: state.next_id,
            free_ids: state.free_ids.len(),
            live_blocks: state.live.len(),
        }
    }

    fn current_block(&'static self) -> Result<NonNull<ThreadBlock>, TlsError> {
        match NonNull::new(self.current.with(|cell| cell.0.get())) {
            Some(block) => Ok(block),
            None => self.create_block(),
        }
    }

    #[cold]
    #[allow(unsafe_code)]
    fn create_block(&'static self) -> Result<NonNull<ThreadBlock>, TlsError> {
        let block = NonNull::from(Box::leak(Box::new(ThreadBlock::new(self))));
        // SAFETY: the callback frees exactly this block, on this thread.
        let registered = unsafe { exit_hook::register(block.cast(), ThreadBlock::on_thread_exit) };
        if let Err(err) = registered {
            // SAFETY: never published anywhere.
            drop(unsafe { Box::from_raw(block.as_ptr()) });
            if let TlsError::ExitKeyUnavailable { code } = err {
                tracing::error!(tag = self.name, code, "failed to arm thread exit teardown");
            }
            return Err(err);
        }
        self.current.with(|cell| cell.0.set(block.as_ptr()));
        Ok(block)
    }

    /// Clear the calling thread's block pointer if it still names `block`.
    pub(crate) fn forget_current(&self, block: NonNull<ThreadBlock>) {
        self.current.with(|cell| {
            if cell.0.get() == block.as_ptr() {
                cell.0.set(ptr::null_mut());
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&self, next_id: u32) {
        self.lock().next_id = next_id;
    }
}
