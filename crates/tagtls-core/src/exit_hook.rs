//! Thread exit callbacks.
//!
//! A per-thread list of `(context, callback)` pairs, drained by the
//! destructor of one process-wide pthread key. The C library runs key
//! destructors after every `thread_local!` destructor of the exiting thread,
//! so storage stays usable from those destructors no matter which one
//! registered first.
//!
//! Callbacks registered while the list is draining (for example, by a
//! callback re-creating storage it just tore down) run in the same drain.
//! Callbacks registered afterwards, from another key's destructor, re-arm the
//! key so the next destructor round drains them. After
//! [`MAX_DRAINS`] drains registration fails with [`TlsError::ThreadExited`].
//!
//! The list head and phase live in `const` thread-locals with no destructor,
//! so they stay readable for the whole of thread teardown. Nothing on the
//! drain path may rely on a thread-local that has a destructor, `tracing`
//! subscribers included; see [`is_draining`].

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use crate::error::TlsError;

/// Callback run at thread exit with the context pointer it was registered with.
pub type ExitCallback = unsafe fn(NonNull<()>);

/// Destructor rounds the C library guarantees (`PTHREAD_DESTRUCTOR_ITERATIONS`).
pub const MAX_DRAINS: u8 = 4;

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const DRAINING: u8 = 2;
const FINISHED: u8 = 3;

struct Pending {
    ctx: NonNull<()>,
    callback: ExitCallback,
    next: *mut Pending,
}

thread_local! {
    static HEAD: Cell<*mut Pending> = const { Cell::new(ptr::null_mut()) };
    static PHASE: Cell<u8> = const { Cell::new(IDLE) };
    static DRAINS: Cell<u8> = const { Cell::new(0) };
}

static EXIT_KEY: OnceLock<Result<libc::pthread_key_t, i32>> = OnceLock::new();

#[allow(unsafe_code)]
fn exit_key() -> Result<libc::pthread_key_t, TlsError> {
    let created = *EXIT_KEY.get_or_init(|| {
        let mut key: libc::pthread_key_t = 0;
        // SAFETY: `key` is a valid out-pointer; the destructor has the
        // signature pthread expects.
        let rc = unsafe { libc::pthread_key_create(&mut key, Some(drain)) };
        if rc == 0 { Ok(key) } else { Err(rc) }
    });
    created.map_err(|code| TlsError::ExitKeyUnavailable { code })
}

/// Give the exit key a non-null value on this thread so the C library calls
/// [`drain`] when it exits.
#[allow(unsafe_code)]
fn arm() -> Result<(), TlsError> {
    let key = exit_key()?;
    let marker = ptr::without_provenance::<libc::c_void>(1);
    // SAFETY: key was created above; the marker is never dereferenced.
    let rc = unsafe { libc::pthread_setspecific(key, marker) };
    if rc == 0 {
        Ok(())
    } else {
        Err(TlsError::ExitKeyUnavailable { code: rc })
    }
}

fn phase_after_drain(drains: u8) -> u8 {
    if drains >= MAX_DRAINS { FINISHED } else { IDLE }
}

/// Exit key destructor: run every pending callback, including ones the
/// callbacks themselves register, until the list stays empty.
#[allow(unsafe_code)]
unsafe extern "C" fn drain(_marker: *mut libc::c_void) {
    PHASE.with(|phase| phase.set(DRAINING));
    loop {
        let mut node = HEAD.with(|head| head.replace(ptr::null_mut()));
        if node.is_null() {
            break;
        }
        while !node.is_null() {
            // SAFETY: nodes are leaked boxes pushed by `register` on this thread.
            let pending = unsafe { Box::from_raw(node) };
            node = pending.next;
            // SAFETY: registered together with `ctx` by `register`'s caller.
            unsafe { (pending.callback)(pending.ctx) };
        }
    }
    let drains = DRAINS.with(|drains| {
        let next = drains.get().saturating_add(1);
        drains.set(next);
        next
    });
    PHASE.with(|phase| phase.set(phase_after_drain(drains)));
}

/// Run `callback(ctx)` when the calling thread exits.
///
/// Callbacks run most-recently-registered first, after the thread's
/// `thread_local!` destructors. Fails once the calling thread has used up
/// its exit drains, or if the exit key cannot be created or set.
///
/// # Safety
///
/// `callback` must be sound to call with `ctx` on this thread during its
/// teardown, after its `thread_local!` destructors have run.
#[allow(unsafe_code)]
pub unsafe fn register(ctx: NonNull<()>, callback: ExitCallback) -> Result<(), TlsError> {
    match PHASE.with(Cell::get) {
        FINISHED => return Err(TlsError::ThreadExited),
        IDLE => {
            arm()?;
            PHASE.with(|phase| phase.set(ARMED));
        }
        _ => {}
    }
    let node = Box::into_raw(Box::new(Pending {
        ctx,
        callback,
        next: ptr::null_mut(),
    }));
    HEAD.with(|head| {
        // SAFETY: just allocated above.
        unsafe { (*node).next = head.get() };
        head.set(node);
    });
    Ok(())
}

/// Returns true while the calling thread is running its exit callbacks.
///
/// `thread_local!` values with destructors, including the buffers of
/// `tracing` subscribers, are gone by then.
#[must_use]
pub fn is_draining() -> bool {
    PHASE.with(Cell::get) == DRAINING
}

/// Returns true once the calling thread can no longer register exit callbacks.
#[must_use]
pub fn has_finished() -> bool {
    PHASE.with(Cell::get) == FINISHED
}
