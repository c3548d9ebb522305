//! Error taxonomy for the thread-local storage runtime.

use thiserror::Error;

/// Failures surfaced to callers of the registry and the typed wrapper.
///
/// Disposal callback panics are not represented here: both teardown paths
/// catch and log them instead of propagating.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TlsError {
    /// Growing a thread's element array failed. The block is left unchanged.
    #[error("failed to allocate {bytes} bytes of thread-local element storage")]
    AllocationFailed { bytes: usize },
    /// Every slot id below the unassigned sentinel has been handed out.
    #[error("thread-local slot id space exhausted")]
    IdSpaceExhausted,
    /// The calling thread already finished its exit teardown.
    #[error("thread-local storage accessed after the thread finished its exit teardown")]
    ThreadExited,
    /// The process-wide key that drives exit teardown could not be created
    /// or set for the calling thread.
    #[error("failed to arm thread exit teardown (error {code})")]
    ExitKeyUnavailable { code: i32 },
}
