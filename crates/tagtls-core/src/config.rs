//! Growth policy configuration.
//!
//! The policy used when a thread's element array must grow is selected via
//! the `TAGTLS_GROWTH` environment variable:
//! - `default` (or unset): capacity `(id + 5) * 1.7`.
//! - `compact`: capacity `(id + 2) * 1.5`. Less slack, more reallocations.
//! - `eager`: capacity `(id + 8) * 2`. Fewest reallocations, most slack.
//!
//! Only the qualitative properties are a contract: the new capacity covers the
//! requested id and is strictly larger than the previous one.

use std::sync::atomic::{AtomicU8, Ordering};

/// Capacity growth policy: `new = (id + additive) * numerator / denominator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrowthPolicy {
    pub additive: usize,
    pub numerator: usize,
    pub denominator: usize,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl GrowthPolicy {
    /// 1.7x with an additive 5.
    pub const DEFAULT: Self = Self {
        additive: 5,
        numerator: 17,
        denominator: 10,
    };

    /// 1.5x with an additive 2.
    pub const COMPACT: Self = Self {
        additive: 2,
        numerator: 3,
        denominator: 2,
    };

    /// 2x with an additive 8.
    pub const EAGER: Self = Self {
        additive: 8,
        numerator: 2,
        denominator: 1,
    };

    /// Parse from string (case-insensitive). Unknown names map to the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" | "tight" | "small" => Self::COMPACT,
            "eager" | "fast" | "double" => Self::EAGER,
            _ => Self::DEFAULT,
        }
    }

    /// Capacity to grow to so that index `id` becomes addressable.
    ///
    /// Always strictly greater than both `id` and `prev_capacity`.
    #[must_use]
    pub fn next_capacity(&self, id: usize, prev_capacity: usize) -> usize {
        let denominator = self.denominator.max(1);
        let scaled = id
            .saturating_add(self.additive)
            .saturating_mul(self.numerator)
            / denominator;
        scaled
            .max(id.saturating_add(1))
            .max(prev_capacity.saturating_add(1))
    }
}

// Atomic cache: 0=unresolved, 1=default, 2=compact, 3=eager, 255=resolving.
static CACHED_POLICY: AtomicU8 = AtomicU8::new(0);

const POLICY_UNRESOLVED: u8 = 0;
const POLICY_DEFAULT: u8 = 1;
const POLICY_COMPACT: u8 = 2;
const POLICY_EAGER: u8 = 3;
const POLICY_RESOLVING: u8 = 255;

fn policy_to_u8(policy: GrowthPolicy) -> u8 {
    if policy == GrowthPolicy::COMPACT {
        POLICY_COMPACT
    } else if policy == GrowthPolicy::EAGER {
        POLICY_EAGER
    } else {
        POLICY_DEFAULT
    }
}

fn u8_to_policy(v: u8) -> GrowthPolicy {
    match v {
        POLICY_COMPACT => GrowthPolicy::COMPACT,
        POLICY_EAGER => GrowthPolicy::EAGER,
        _ => GrowthPolicy::DEFAULT,
    }
}

/// Get the configured growth policy (reads env var on first call, caches thereafter).
///
/// Growth can be reached from thread-exit destructors, where a blocking
/// `OnceLock` initializer could deadlock against a re-entrant call. A call
/// arriving while another resolves gets the default policy.
#[must_use]
pub fn growth_policy() -> GrowthPolicy {
    let cached = CACHED_POLICY.load(Ordering::Relaxed);

    if cached != POLICY_UNRESOLVED && cached != POLICY_RESOLVING {
        return u8_to_policy(cached);
    }

    if cached == POLICY_RESOLVING {
        return GrowthPolicy::DEFAULT;
    }

    if CACHED_POLICY
        .compare_exchange(
            POLICY_UNRESOLVED,
            POLICY_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_POLICY.load(Ordering::Relaxed);
        return if v != POLICY_UNRESOLVED && v != POLICY_RESOLVING {
            u8_to_policy(v)
        } else {
            GrowthPolicy::DEFAULT
        };
    }

    let policy = std::env::var("TAGTLS_GROWTH")
        .map(|v| GrowthPolicy::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_POLICY.store(policy_to_u8(policy), Ordering::Release);
    policy
}
