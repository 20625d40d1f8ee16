// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for [`SwrStore`].

use std::{fmt, marker::PhantomData, time::Duration};

use tick::Clock;

use crate::{KeyGuard, PendingPolicy, SwrStore};

/// Builder for configuring a [`SwrStore`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use swirl::{KeyGuard, PendingPolicy, SwrStore};
/// use tick::Clock;
///
/// let store = SwrStore::<u32, String>::builder(Clock::new_frozen())
///     .name("profiles")
///     .default_cache_time(Duration::from_secs(30))
///     .key_guard(KeyGuard::Always)
///     .pending_policy(PendingPolicy::Retain)
///     .build();
///
/// assert_eq!(store.name(), "profiles");
/// ```
pub struct StoreBuilder<A, R, D = R> {
    name: &'static str,
    clock: Clock,
    default_cache_time: Duration,
    key_guard: KeyGuard,
    pending_policy: PendingPolicy,
    _phantom: PhantomData<fn(A) -> (R, D)>,
}

impl<A, R, D> StoreBuilder<A, R, D> {
    pub(crate) fn new(clock: Clock) -> Self {
        Self {
            name: "swirl",
            clock,
            default_cache_time: Duration::ZERO,
            key_guard: KeyGuard::default(),
            pending_policy: PendingPolicy::default(),
            _phantom: PhantomData,
        }
    }

    /// Sets the name reported as `cache.name` in log events.
    #[must_use]
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Replaces the clock used to timestamp and age entries.
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the cache time for subscribers that do not configure their own.
    ///
    /// A zero duration, the default, disables caching for those subscribers.
    #[must_use]
    pub fn default_cache_time(mut self, cache_time: Duration) -> Self {
        self.default_cache_time = cache_time;
        self
    }

    /// Sets when derived keys may be evaluated.
    #[must_use]
    pub fn key_guard(mut self, key_guard: KeyGuard) -> Self {
        self.key_guard = key_guard;
        self
    }

    /// Sets what happens to an entry's operation once it has settled.
    #[must_use]
    pub fn pending_policy(mut self, pending_policy: PendingPolicy) -> Self {
        self.pending_policy = pending_policy;
        self
    }

    /// Creates the store.
    #[must_use]
    pub fn build(self) -> SwrStore<A, R, D> {
        SwrStore::from_parts(self.name, self.clock, self.default_cache_time, self.key_guard, self.pending_policy)
    }
}

impl<A, R, D> fmt::Debug for StoreBuilder<A, R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("name", &self.name)
            .field("clock", &self.clock)
            .field("default_cache_time", &self.default_cache_time)
            .field("key_guard", &self.key_guard)
            .field("pending_policy", &self.pending_policy)
            .finish()
    }
}
