//! # tagtls-core
//!
//! Tagged thread-local storage with dynamically allocated slots.
//!
//! A [`Registry`] hands out small integer slot ids to [`SlotHandle`]s and
//! recycles them when a slot is destroyed. Every thread that touches a slot
//! gets a private, growable array of [`ElementWrapper`]s indexed by id, so
//! a lookup is a capacity check plus an indexed load. Registries are selected
//! at compile time by a [`Tag`] type (see [`declare_tag!`]), and slots under
//! different tags share nothing.
//!
//! Stored values are disposed exactly once: by their owning thread when it
//! exits ([`DisposalMode::ThisThread`]), or by whichever thread destroys the
//! slot ([`DisposalMode::AllThreads`]). [`ThreadLocal`] wraps all of this in
//! a typed, safe API.
//!
//! ## Logging
//!
//! Growth and slot destruction emit `tracing` events at `trace` level.
//! Panics swallowed from disposal callbacks are reported at `warn` (slot
//! destroy) or `error` (thread exit). Thread exit teardown runs after the
//! thread's `thread_local!` destructors, where subscribers are unreachable,
//! so panics discarded there go to standard error instead.
//!
//! ## Configuration
//!
//! `TAGTLS_GROWTH` selects the element array growth policy; see [`config`].

#![deny(unsafe_code)]

pub mod alloc;
mod block;
pub mod config;
pub mod element;
pub mod error;
pub mod exit_hook;
pub mod handle;
pub mod local;
pub mod registry;
pub mod tag;

pub use alloc::{ElementAllocator, SystemAllocator};
pub use config::GrowthPolicy;
pub use element::{DisposalMode, ElementWrapper};
pub use error::TlsError;
pub use handle::{SlotHandle, UNASSIGNED_ID};
pub use local::ThreadLocal;
#[doc(hidden)]
pub use registry::BlockCell;
pub use registry::{FIRST_SLOT_ID, Registry, RegistryStats};
pub use tag::{DefaultTag, Tag};
