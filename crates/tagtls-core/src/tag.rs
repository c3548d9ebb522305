//! Tags: independent registries selected at compile time.
//!
//! Every tag owns one [`Registry`] and one thread-local block pointer. Slots
//! declared under different tags never share ids, locks, or storage.

use crate::registry::Registry;

/// A compile-time selector for one registry.
///
/// Implement with [`declare_tag!`](crate::declare_tag) rather than by hand:
/// the macro wires up the per-tag `thread_local!` the registry needs.
pub trait Tag: 'static {
    /// The tag's registry, created on first use.
    fn registry() -> &'static Registry;
}

/// Declare a tag type and its registry.
///
/// ```
/// tagtls_core::declare_tag! {
///     /// Slots for the request path.
///     pub struct RequestTag;
/// }
///
/// use tagtls_core::Tag;
/// assert_eq!(RequestTag::registry().name(), "RequestTag");
/// ```
///
/// An element allocator other than the global one can be supplied as a
/// `&'static` [`ElementAllocator`](crate::ElementAllocator):
///
/// ```
/// use tagtls_core::SystemAllocator;
///
/// static ALLOC: SystemAllocator = SystemAllocator;
///
/// tagtls_core::declare_tag! {
///     struct ArenaTag;
///     allocator = &ALLOC;
/// }
/// ```
#[macro_export]
macro_rules! declare_tag {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $crate::declare_tag! {
            $(#[$meta])*
            $vis struct $name;
            allocator = &$crate::alloc::SYSTEM_ALLOCATOR;
        }
    };
    ($(#[$meta:meta])* $vis:vis struct $name:ident; allocator = $alloc:expr;) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
        $vis struct $name;

        impl $crate::Tag for $name {
            fn registry() -> &'static $crate::Registry {
                ::std::thread_local! {
                    static CURRENT: $crate::BlockCell = const { $crate::BlockCell::new() };
                }
                static REGISTRY: ::std::sync::OnceLock<$crate::Registry> =
                    ::std::sync::OnceLock::new();
                REGISTRY.get_or_init(|| {
                    $crate::Registry::new(::core::stringify!($name), &CURRENT, $alloc)
                })
            }
        }
    };
}

declare_tag! {
    /// Tag used when a [`ThreadLocal`](crate::ThreadLocal) names none.
    pub struct DefaultTag;
}
