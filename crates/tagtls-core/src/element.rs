//! Element wrappers: one stored value per (thread, slot) pair.
//!
//! A wrapper owns a type-erased value pointer plus the means to destroy it
//! exactly once. The all-zero bit pattern is the empty wrapper, so element
//! arrays can come straight from a zeroing allocator.
//!
//! Wrappers living inside a thread's element array are never disposed in
//! place: callers move the contents out first ([`ElementWrapper::take`]) and
//! dispose the local copy. A disposal callback may grow the very array the
//! wrapper came from, and the fixpoint loop in thread-exit teardown relies on
//! the in-array wrapper already being empty when that happens.

use std::any::Any;
use std::fmt;
use std::io::{self, Write};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use crate::exit_hook;

/// Why a stored value is being disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisposalMode {
    /// The owning thread is exiting.
    ThisThread,
    /// The slot was destroyed while other threads may still be running.
    AllThreads,
}

/// Deleter for values installed with a plain function.
pub type RawDeleter = unsafe fn(*mut u8, DisposalMode);

/// Deleter closure owned by the wrapper that holds it.
pub type OwnedDeleter = Box<dyn FnOnce(*mut u8, DisposalMode) + Send>;

/// Storage cell for one thread's value of one slot.
#[repr(C)]
pub struct ElementWrapper {
    value: *mut u8,
    deleter: Option<RawDeleter>,
    owned_deleter: *mut OwnedDeleter,
    owns_deleter: bool,
}

// SAFETY: every constructor requires the value and deleter to be Send; the
// raw pointers are only dereferenced by whoever currently owns the wrapper.
#[allow(unsafe_code)]
unsafe impl Send for ElementWrapper {}

impl Default for ElementWrapper {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for ElementWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementWrapper")
            .field("value", &self.value)
            .field("has_deleter", &self.deleter.is_some())
            .field("owns_deleter", &self.owns_deleter)
            .finish()
    }
}

#[allow(unsafe_code)]
unsafe fn drop_boxed<T>(ptr: *mut u8, _mode: DisposalMode) {
    // SAFETY: installed by `ElementWrapper::boxed::<T>` from `Box::into_raw`.
    drop(unsafe { Box::from_raw(ptr.cast::<T>()) });
}

#[allow(unsafe_code)]
impl ElementWrapper {
    /// The empty wrapper.
    pub const EMPTY: Self = Self {
        value: ptr::null_mut(),
        deleter: None,
        owned_deleter: ptr::null_mut(),
        owns_deleter: false,
    };

    /// Wrap a boxed value; disposal drops the box in either mode.
    #[must_use]
    pub fn boxed<T: Send + 'static>(value: Box<T>) -> Self {
        Self {
            value: Box::into_raw(value).cast::<u8>(),
            deleter: Some(drop_boxed::<T>),
            owned_deleter: ptr::null_mut(),
            owns_deleter: false,
        }
    }

    /// Wrap a raw value with a plain-function deleter.
    ///
    /// # Safety
    ///
    /// `value` must be non-null, safe to send to another thread, and valid to
    /// pass to `deleter` exactly once.
    #[must_use]
    pub unsafe fn from_raw(value: *mut u8, deleter: RawDeleter) -> Self {
        debug_assert!(!value.is_null());
        Self {
            value,
            deleter: Some(deleter),
            owned_deleter: ptr::null_mut(),
            owns_deleter: false,
        }
    }

    /// Wrap a raw value with a deleter closure that the wrapper owns.
    ///
    /// # Safety
    ///
    /// Same contract as [`ElementWrapper::from_raw`].
    #[must_use]
    pub unsafe fn with_deleter<D>(value: *mut u8, deleter: D) -> Self
    where
        D: FnOnce(*mut u8, DisposalMode) + Send + 'static,
    {
        debug_assert!(!value.is_null());
        let owned: OwnedDeleter = Box::new(deleter);
        Self {
            value,
            deleter: None,
            owned_deleter: Box::into_raw(Box::new(owned)),
            owns_deleter: true,
        }
    }

    /// Returns true if a value is stored.
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        !self.value.is_null()
    }

    /// The stored value pointer (null if absent).
    #[inline]
    #[must_use]
    pub fn value(&self) -> *mut u8 {
        self.value
    }

    /// Move the contents out, leaving this wrapper empty.
    #[must_use]
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Install `new`, returning the previous contents undisposed.
    #[must_use]
    pub fn replace(&mut self, new: Self) -> Self {
        mem::replace(self, new)
    }

    /// Take the value pointer without running the deleter. An owned deleter
    /// is freed without being called.
    #[must_use]
    pub fn release(&mut self) -> *mut u8 {
        let taken = self.take();
        if taken.owns_deleter {
            // SAFETY: created by `Box::into_raw` in `with_deleter`.
            drop(unsafe { Box::from_raw(taken.owned_deleter) });
        }
        taken.value
    }

    /// Dispose the stored value with `mode`.
    ///
    /// All fields are cleared before the deleter runs. Returns false (and
    /// does nothing) if no value is stored, so repeated disposal is a no-op.
    pub fn dispose(&mut self, mode: DisposalMode) -> bool {
        let taken = self.take();
        if taken.value.is_null() {
            if taken.owns_deleter {
                // SAFETY: created by `Box::into_raw` in `with_deleter`.
                drop(unsafe { Box::from_raw(taken.owned_deleter) });
            }
            return false;
        }

        if taken.owns_deleter {
            // SAFETY: created by `Box::into_raw` in `with_deleter`; the wrapper
            // was emptied above so the box is reclaimed exactly once.
            let deleter: OwnedDeleter = *unsafe { Box::from_raw(taken.owned_deleter) };
            deleter(taken.value, mode);
        } else if let Some(deleter) = taken.deleter {
            // SAFETY: constructor contract: value is valid for its deleter once.
            unsafe { deleter(taken.value, mode) };
        }
        true
    }
}

/// Dispose `element`, catching a panicking deleter.
///
/// The wrapper is emptied before its deleter runs, so a panic still counts as
/// a disposal. Panics are logged against `tag` and `id` and then discarded:
/// slot destruction must finish its bookkeeping and thread teardown must keep
/// going.
pub(crate) fn dispose_guarded(
    element: &mut ElementWrapper,
    mode: DisposalMode,
    tag: &'static str,
    id: usize,
) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| element.dispose(mode))) {
        Ok(disposed) => disposed,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            if exit_hook::is_draining() {
                // Subscriber thread-locals are already destroyed while the
                // exit drain runs.
                let _ = writeln!(
                    io::stderr(),
                    "tagtls: discarded a panic from a {mode:?} disposal callback \
                     (tag {tag}, id {id}): {message}"
                );
                return true;
            }
            match mode {
                DisposalMode::AllThreads => tracing::warn!(
                    tag,
                    id,
                    reason = message,
                    "slot destroy discarded a panic from a disposal callback"
                ),
                DisposalMode::ThisThread => tracing::error!(
                    tag,
                    id,
                    reason = message,
                    "thread exit discarded a panic from a disposal callback"
                ),
            }
            true
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
