//! Typed per-thread values on top of a tag's registry.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::element::{DisposalMode, ElementWrapper};
use crate::error::TlsError;
use crate::handle::SlotHandle;
use crate::tag::{DefaultTag, Tag};

type Init<T> = Box<dyn Fn() -> T + Send + Sync>;
type Deleter<T> = Arc<dyn Fn(T, DisposalMode) + Send + Sync>;

/// A value with one lazily-initialized instance per thread.
///
/// Each thread that calls [`with`](Self::with) gets its own `T`, created by
/// the init closure on first access. A thread's value is disposed when that
/// thread exits; all remaining values are disposed when the `ThreadLocal` is
/// dropped, on the dropping thread.
///
/// ```
/// use std::cell::Cell;
/// use tagtls_core::ThreadLocal;
///
/// let hits: ThreadLocal<Cell<u32>> = ThreadLocal::new(|| Cell::new(0));
/// hits.with(|h| h.set(h.get() + 1));
/// hits.with(|h| assert_eq!(h.get(), 1));
///
/// std::thread::scope(|s| {
///     s.spawn(|| hits.with(|h| assert_eq!(h.get(), 0)));
/// });
/// ```
pub struct ThreadLocal<T: Send + 'static, G: Tag = DefaultTag> {
    handle: SlotHandle,
    init: Init<T>,
    deleter: Option<Deleter<T>>,
    _tag: PhantomData<fn() -> G>,
}

impl<T: Send + 'static, G: Tag> ThreadLocal<T, G> {
    /// Per-thread values created by `init` and dropped normally.
    pub fn new(init: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            handle: SlotHandle::new(),
            init: Box::new(init),
            deleter: None,
            _tag: PhantomData,
        }
    }

    /// Per-thread values created by `init` and handed to `deleter` on disposal,
    /// together with whether the owning thread is exiting
    /// ([`DisposalMode::ThisThread`]) or the slot is being destroyed
    /// ([`DisposalMode::AllThreads`]).
    pub fn with_deleter(
        init: impl Fn() -> T + Send + Sync + 'static,
        deleter: impl Fn(T, DisposalMode) + Send + Sync + 'static,
    ) -> Self {
        Self {
            handle: SlotHandle::new(),
            init: Box::new(init),
            deleter: Some(Arc::new(deleter)),
            _tag: PhantomData,
        }
    }

    /// The slot id, once any thread has accessed the value.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.handle.id()
    }

    /// Run `f` with the calling thread's value, initializing it first if
    /// needed.
    #[allow(unsafe_code)]
    pub fn try_with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, TlsError> {
        let cell = G::registry().get(&self.handle)?;
        // SAFETY: `get` returns this thread's live element for the slot.
        let current = unsafe { cell.as_ref() }.value().cast::<T>();
        let value = if current.is_null() {
            self.initialize()?
        } else {
            current.cast_const()
        };
        // SAFETY: the value is a Box<T> owned by this thread's element. It is
        // only disposed at this thread's exit or by dropping `self`, neither
        // of which can happen while `&self` is borrowed here.
        Ok(f(unsafe { &*value }))
    }

    /// Like [`try_with`](Self::try_with), panicking if storage is unavailable.
    ///
    /// # Panics
    ///
    /// Panics if the thread has finished its exit teardown, or if slot ids or
    /// element storage are exhausted.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        match self.try_with(f) {
            Ok(result) => result,
            Err(err) => panic!("cannot access thread-local value: {err}"),
        }
    }

    /// Whether the calling thread already has a value. Never initializes one.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn is_initialized(&self) -> bool {
        if !self.handle.is_assigned() {
            return false;
        }
        match G::registry().get(&self.handle) {
            // SAFETY: `get` returns this thread's live element for the slot.
            Ok(cell) => unsafe { cell.as_ref() }.is_set(),
            Err(_) => false,
        }
    }

    #[cold]
    #[allow(unsafe_code)]
    fn initialize(&self) -> Result<*const T, TlsError> {
        let mut fresh = self.wrap(Box::new((self.init)()));

        // `init` may have touched other slots of this tag (growing the block)
        // or even this one, so resolve the element again.
        let cell = match G::registry().get(&self.handle) {
            Ok(cell) => cell,
            Err(err) => {
                fresh.dispose(DisposalMode::ThisThread);
                return Err(err);
            }
        };
        // SAFETY: `get` returns this thread's live element for the slot.
        let existing = unsafe { cell.as_ref() }.value().cast::<T>();
        if !existing.is_null() {
            fresh.dispose(DisposalMode::ThisThread);
            return Ok(existing.cast_const());
        }
        // SAFETY: the element is empty, so overwriting it leaks nothing.
        unsafe { cell.as_ptr().write(fresh) };
        // SAFETY: same element, just populated.
        Ok(unsafe { cell.as_ref() }.value().cast::<T>().cast_const())
    }

    #[allow(unsafe_code)]
    fn wrap(&self, boxed: Box<T>) -> ElementWrapper {
        match &self.deleter {
            None => ElementWrapper::boxed(boxed),
            Some(deleter) => {
                let deleter = Arc::clone(deleter);
                let dispose = move |ptr: *mut u8, mode: DisposalMode| {
                    // SAFETY: the element only ever holds the Box<T> below.
                    let value = unsafe { Box::from_raw(ptr.cast::<T>()) };
                    deleter(*value, mode);
                };
                let raw = Box::into_raw(boxed).cast::<u8>();
                // SAFETY: `dispose` reclaims exactly the box leaked as `raw`.
                unsafe { ElementWrapper::with_deleter(raw, dispose) }
            }
        }
    }
}

impl<T: Send + Default + 'static, G: Tag> Default for ThreadLocal<T, G> {
    fn default() -> Self {
        Self::new(T::default)
    }
}

impl<T: Send + 'static, G: Tag> Drop for ThreadLocal<T, G> {
    fn drop(&mut self) {
        G::registry().destroy(&self.handle);
    }
}

impl<T: Send + 'static, G: Tag> fmt::Debug for ThreadLocal<T, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocal")
            .field("tag", &G::registry().name())
            .field("id", &self.handle.id())
            .finish_non_exhaustive()
    }
}
