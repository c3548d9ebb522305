#![allow(dead_code, unsafe_code)]

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::Mutex;
use tagtls_core::{DisposalMode, ElementWrapper, Registry, SlotHandle};
use tracing::level_filters::LevelFilter;

thread_local! {
    static TRACING_CONFIG_GUARD: Cell<Option<tracing::subscriber::DefaultGuard>> = const { Cell::new(None) };
}

/// Route this test thread's events to stdout at TRACE.
///
/// Spawned worker threads keep the no-op default, so only the test thread's
/// own activity is printed.
pub fn init_test_worker() {
    let stdout_subscriber = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_test_writer()
        .finish();

    TRACING_CONFIG_GUARD.set(Some(tracing::subscriber::set_default(stdout_subscriber)));
}

pub type DisposalLog = Arc<Mutex<Vec<(u32, DisposalMode)>>>;

pub fn disposal_log() -> DisposalLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A boxed `u32` whose deleter records `(value, mode)` into `log`.
pub fn recording(value: u32, log: &DisposalLog) -> ElementWrapper {
    let log = Arc::clone(log);
    let raw = Box::into_raw(Box::new(value)).cast::<u8>();
    let deleter = move |ptr: *mut u8, mode: DisposalMode| {
        // SAFETY: only ever installed over the box leaked above.
        let value = *unsafe { Box::from_raw(ptr.cast::<u32>()) };
        log.lock().push((value, mode));
    };
    // SAFETY: the deleter reclaims exactly `raw`.
    unsafe { ElementWrapper::with_deleter(raw, deleter) }
}

/// Install `element` into the calling thread's cell for `handle`.
pub fn store(registry: &'static Registry, handle: &SlotHandle, element: ElementWrapper) {
    let cell = registry.get(handle).unwrap();
    // SAFETY: freshly resolved cell for this thread; no other borrow is live.
    let mut previous = unsafe { &mut *cell.as_ptr() }.replace(element);
    previous.dispose(DisposalMode::ThisThread);
}

/// Read the calling thread's `u32` for `handle`, if one is stored.
pub fn load_u32(registry: &'static Registry, handle: &SlotHandle) -> Option<u32> {
    let cell = registry.get(handle).unwrap();
    // SAFETY: freshly resolved cell; tests only store boxed u32 values.
    let value = unsafe { cell.as_ref() }.value().cast::<u32>();
    // SAFETY: non-null values are live boxed u32s.
    (!value.is_null()).then(|| unsafe { *value })
}

pub fn sorted(log: &DisposalLog) -> Vec<(u32, DisposalMode)> {
    let mut entries = log.lock().clone();
    entries.sort_by_key(|&(value, mode)| (value, mode == DisposalMode::AllThreads));
    entries
}
