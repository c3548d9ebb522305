//! Slot handles.

use std::sync::atomic::{AtomicU32, Ordering};

/// Id carried by a handle that has no slot assigned.
pub const UNASSIGNED_ID: u32 = u32::MAX;

/// A lazily-assigned slot identifier held by a call site.
///
/// The id is allocated by the tag's [`Registry`](crate::Registry) on first use
/// and returned to its free pool by [`Registry::destroy`](crate::Registry::destroy).
/// Ids are not stable across a destroy/re-allocate cycle.
#[derive(Debug)]
pub struct SlotHandle {
    id: AtomicU32,
}

impl Default for SlotHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotHandle {
    /// An unassigned handle. Usable in `static` initializers.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            id: AtomicU32::new(UNASSIGNED_ID),
        }
    }

    /// The assigned id, if any.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        match self.raw() {
            UNASSIGNED_ID => None,
            id => Some(id),
        }
    }

    /// Returns true if an id is currently assigned.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        self.raw() != UNASSIGNED_ID
    }

    /// The assigned id or [`UNASSIGNED_ID`]. Since the sentinel is `u32::MAX`,
    /// `capacity <= raw()` holds for any unassigned handle, which lets the hot
    /// path fold "unassigned" into "out of range".
    #[inline]
    pub(crate) fn raw(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    /// Publish a freshly allocated id. Registry lock must be held.
    pub(crate) fn assign(&self, id: u32) {
        let previous = self.id.swap(id, Ordering::AcqRel);
        debug_assert_eq!(previous, UNASSIGNED_ID, "handle assigned twice");
    }

    /// Take the id and mark the handle unassigned. Registry lock must be held.
    pub(crate) fn take(&self) -> Option<u32> {
        match self.id.swap(UNASSIGNED_ID, Ordering::AcqRel) {
            UNASSIGNED_ID => None,
            id => Some(id),
        }
    }
}
