// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Validity windows and freshness bookkeeping.

use std::{fmt, sync::Arc, time::Duration, time::Instant};

use tick::Clock;

use crate::{Error, Result};

type DeriveCacheTime<A> = dyn Fn(&A) -> Result<Duration> + Send + Sync;

/// How long a populated entry stays valid for a subscriber's calls.
///
/// A zero duration disables caching for the call entirely.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use swirl::CacheTime;
///
/// let fixed: CacheTime<u32> = CacheTime::fixed(Duration::from_secs(1));
/// let by_args: CacheTime<u32> = CacheTime::derived(|id: &u32| {
///     if *id == 0 { Duration::ZERO } else { Duration::from_secs(30) }
/// });
/// # let _ = (fixed, by_args);
/// ```
pub enum CacheTime<A> {
    /// The same window for every call.
    Fixed(Duration),

    /// A window computed from the current call arguments.
    Derived(Arc<DeriveCacheTime<A>>),
}

impl<A: 'static> CacheTime<A> {
    /// A window that never changes.
    #[must_use]
    pub fn fixed(duration: Duration) -> Self {
        Self::Fixed(duration)
    }

    /// A window computed from call arguments.
    pub fn derived<F>(derive: F) -> Self
    where
        F: Fn(&A) -> Duration + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(move |args: &A| -> Result<Duration> { Ok(derive(args)) }))
    }

    /// A window computed from call arguments by a function that may fail.
    ///
    /// A failure is reported as [`Error::CacheTimeResolution`] and leaves the
    /// cache untouched.
    pub fn try_derived<E, F>(derive: F) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(&A) -> Result<Duration, E> + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(move |args: &A| -> Result<Duration> {
            derive(args).map_err(Error::cache_time_resolution)
        }))
    }
}

impl<A> CacheTime<A> {
    pub(crate) fn resolve(&self, args: &A) -> Result<Duration> {
        match self {
            Self::Fixed(duration) => Ok(*duration),
            Self::Derived(derive) => derive(args),
        }
    }
}

impl<A> Clone for CacheTime<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed(duration) => Self::Fixed(*duration),
            Self::Derived(derive) => Self::Derived(Arc::clone(derive)),
        }
    }
}

impl<A> fmt::Debug for CacheTime<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(duration) => f.debug_tuple("Fixed").field(duration).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

impl<A> From<Duration> for CacheTime<A> {
    fn from(duration: Duration) -> Self {
        Self::Fixed(duration)
    }
}

/// When an entry was last populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Populated successfully at the given instant.
    Updated(Instant),

    /// No valid cached data exists.
    Expired,
}

impl Freshness {
    /// Returns `true` if the entry holds data younger than `cache_time`.
    ///
    /// A zero `cache_time` never yields a valid entry.
    #[must_use]
    pub fn is_valid(self, cache_time: Duration, clock: &Clock) -> bool {
        match self {
            Self::Updated(at) => !cache_time.is_zero() && clock.instant().saturating_duration_since(at) < cache_time,
            Self::Expired => false,
        }
    }

    /// Returns `true` if the entry was populated but its window has elapsed.
    ///
    /// Already expired entries are not "aged out"; they have nothing to invalidate.
    #[must_use]
    pub(crate) fn is_aged_out(self, cache_time: Duration, clock: &Clock) -> bool {
        matches!(self, Self::Updated(_)) && !self.is_valid(cache_time, clock)
    }
}

/// What happens to the shared pending operation after it succeeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PendingPolicy {
    /// The value is stored on the entry and the pending operation is cleared
    /// once the value has been broadcast.
    #[default]
    ClearAfterBroadcast,

    /// The settled pending operation is kept on the entry and replayed to
    /// later callers while the entry is valid; no separate value is stored.
    Retain,
}
