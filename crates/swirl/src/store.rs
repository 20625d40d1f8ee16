// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The keyed store of cache entries shared by all subscribers.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tick::Clock;

use crate::{
    CacheKey, Error, Freshness, KeyGuard, PendingPolicy, Result, Settled, SubscriberId,
    builder::StoreBuilder,
    pending::{OperationId, PendingOperation},
    registry::{Registry, broadcast},
    subscriber::{Subscriber, SubscriberOptions, SubscriberShared},
    telemetry::{CacheActivity, record},
};

/// Per-key record of freshness, in-flight work and subscriber membership.
pub(crate) struct CacheEntry<A, R, D> {
    freshness: Freshness,
    pending: Option<PendingOperation<R, D>>,
    value: Option<Settled<R, D>>,
    subscribers: Registry<A, R, D>,
}

impl<A, R, D> CacheEntry<A, R, D> {
    fn new() -> Self {
        Self {
            freshness: Freshness::Expired,
            pending: None,
            value: None,
            subscribers: Registry::new(),
        }
    }

    /// Drops cached data and in-flight work but keeps the subscribers.
    fn invalidate(&mut self) {
        self.freshness = Freshness::Expired;
        self.pending = None;
        self.value = None;
    }
}

/// A point-in-time view of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    freshness: Freshness,
    age: Option<Duration>,
    pending: bool,
    has_value: bool,
    subscribers: usize,
}

impl EntrySnapshot {
    /// When the entry was last populated, or [`Freshness::Expired`].
    #[must_use]
    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    /// Returns `true` if the entry holds no valid data.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.freshness == Freshness::Expired
    }

    /// Time since the entry was last populated.
    #[must_use]
    pub fn age(&self) -> Option<Duration> {
        self.age
    }

    /// Returns `true` if the entry would serve cached data to a call with this window.
    #[must_use]
    pub fn is_valid_for(&self, cache_time: Duration) -> bool {
        self.age.is_some_and(|age| !cache_time.is_zero() && age < cache_time)
    }

    /// Returns `true` while a shared operation is attached to the entry.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Returns `true` if a successful result is available from the entry.
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.has_value
    }

    /// Number of subscribers associated with the entry.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
    }
}

/// Which call a claim resolved to.
pub(crate) enum Claim<R, D> {
    /// Valid data was already cached.
    Cached(Settled<R, D>),
    /// Another call is already producing the result.
    Join(PendingOperation<R, D>),
    /// This call started the underlying operation.
    Lead(PendingOperation<R, D>),
}

pub(crate) struct StoreInner<A, R, D> {
    pub(crate) name: &'static str,
    pub(crate) clock: Clock,
    pub(crate) default_cache_time: Duration,
    pub(crate) key_guard: KeyGuard,
    pub(crate) pending_policy: PendingPolicy,
    entries: Mutex<HashMap<CacheKey, CacheEntry<A, R, D>>>,
    next_operation: AtomicU64,
    next_subscriber: AtomicU64,
}

/// A stale-while-revalidate store coordinating keyed operations across subscribers.
///
/// The store maps each [`CacheKey`] to an entry that tracks when it was last
/// populated, the single in-flight operation producing its next value, and the
/// subscribers sharing it. Subscribers are created with
/// [`subscribe`][Self::subscribe]; their calls are served from the entry while it
/// is valid, join the in-flight operation when there is one, and otherwise run
/// the underlying operation exactly once and share its result with every
/// sibling on the same key.
///
/// Cloning a store is cheap; every clone refers to the same entries.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use swirl::{KeySpec, SubscriberOptions, SwrStore};
/// use tick::Clock;
/// # futures::executor::block_on(async {
///
/// let store = SwrStore::<u32, String, String>::builder(Clock::new_frozen())
///     .default_cache_time(Duration::from_secs(60))
///     .build();
///
/// let profile = store.subscribe(
///     |id: u32| async move { Ok(format!("profile of {id}")) },
///     SubscriberOptions::new().key(KeySpec::derived(|id: &u32| format!("user:{id}"))),
/// );
///
/// assert_eq!(profile.run(1).await?, Some("profile of 1".to_string()));
/// assert!(store.entry("user:1").is_some_and(|entry| entry.has_value()));
/// # Ok::<(), swirl::Error>(())
/// # });
/// ```
pub struct SwrStore<A, R, D = R> {
    pub(crate) inner: Arc<StoreInner<A, R, D>>,
}

impl<A, R, D> Clone for SwrStore<A, R, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R, D> fmt::Debug for SwrStore<A, R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwrStore")
            .field("name", &self.inner.name)
            .field("default_cache_time", &self.inner.default_cache_time)
            .field("key_guard", &self.inner.key_guard)
            .field("pending_policy", &self.inner.pending_policy)
            .field("entries", &self.inner.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl<A, R, D> SwrStore<A, R, D> {
    /// Creates a store with the default configuration that ages entries with `clock`.
    ///
    /// The default base cache time is zero, so subscribers must configure a
    /// [`CacheTime`][crate::CacheTime] to take part in caching.
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self::builder(clock).build()
    }

    /// Creates a builder for configuring a store that ages entries with `clock`.
    #[must_use]
    pub fn builder(clock: Clock) -> StoreBuilder<A, R, D> {
        StoreBuilder::new(clock)
    }

    pub(crate) fn from_parts(
        name: &'static str,
        clock: Clock,
        default_cache_time: Duration,
        key_guard: KeyGuard,
        pending_policy: PendingPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name,
                clock,
                default_cache_time,
                key_guard,
                pending_policy,
                entries: Mutex::new(HashMap::new()),
                next_operation: AtomicU64::new(1),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// The name used in log events.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// The clock used for freshness decisions.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    /// The cache time used when a subscriber does not configure one.
    #[must_use]
    pub fn default_cache_time(&self) -> Duration {
        self.inner.default_cache_time
    }

    /// Expires the entry for `key`, dropping its data and in-flight work.
    ///
    /// The entry and its subscribers remain. Returns `false` if no entry exists.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.invalidate(key)
    }

    /// Expires every entry.
    pub fn invalidate_all(&self) {
        let mut entries = self.inner.entries.lock();
        for (key, entry) in entries.iter_mut() {
            entry.invalidate();
            record(self.inner.name, key, CacheActivity::Invalidated);
        }
    }

    /// Returns `true` if an entry exists for `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    /// The keys that currently have entries.
    #[must_use]
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    /// Number of entries in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns `true` if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }
}

impl<A, R: Clone, D: Clone> SwrStore<A, R, D> {
    /// Returns a snapshot of the entry for `key`, if one exists.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<EntrySnapshot> {
        let entries = self.inner.entries.lock();
        entries.get(key).map(|entry| self.inner.snapshot(entry))
    }

    /// Returns a snapshot of the entry for `key`, creating an expired entry if absent.
    pub fn get_or_create(&self, key: impl Into<CacheKey>) -> EntrySnapshot {
        let mut entries = self.inner.entries.lock();
        let entry = entries.entry(key.into()).or_insert_with(CacheEntry::new);
        self.inner.snapshot(entry)
    }
}

impl<A, R, D> SwrStore<A, R, D>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Creates a subscriber that runs `service` through this store.
    ///
    /// The service receives the call arguments and produces the raw result;
    /// the options decide the subscriber's key, cache time and formatter.
    pub fn subscribe<F, Fut>(&self, service: F, options: SubscriberOptions<A, R, D>) -> Subscriber<A, R, D>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let id = SubscriberId(self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed));
        Subscriber::new(self.clone(), id, Arc::new(move |args: A| service(args).boxed()), options)
    }
}

impl<A, R, D> StoreInner<A, R, D> {
    fn snapshot(&self, entry: &CacheEntry<A, R, D>) -> EntrySnapshot
    where
        R: Clone,
        D: Clone,
    {
        let retained = entry
            .pending
            .as_ref()
            .and_then(PendingOperation::peek)
            .is_some_and(|outcome| outcome.is_ok());

        EntrySnapshot {
            freshness: entry.freshness,
            age: match entry.freshness {
                Freshness::Updated(at) => Some(self.clock.instant().saturating_duration_since(at)),
                Freshness::Expired => None,
            },
            pending: entry.pending.is_some(),
            has_value: entry.value.is_some() || retained,
            subscribers: entry.subscribers.len(),
        }
    }

    pub(crate) fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        entry.invalidate();
        record(self.name, key, CacheActivity::Invalidated);
        true
    }

    /// Removes the subscriber from every entry and collects entries left without subscribers.
    pub(crate) fn prune(&self, id: SubscriberId) {
        let mut entries = self.entries.lock();
        entries.retain(|key, entry| {
            entry.subscribers.remove(id);
            entry.subscribers.prune_dead();
            if entry.subscribers.is_empty() {
                record(self.name, key, CacheActivity::Collected);
                false
            } else {
                true
            }
        });
    }

    /// The value a call with this window would be served from the entry, if any.
    pub(crate) fn cached_value(&self, key: &str, cache_time: Duration) -> Option<Settled<R, D>>
    where
        R: Clone,
        D: Clone,
    {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        if !entry.freshness.is_valid(cache_time, &self.clock) {
            return None;
        }
        entry
            .value
            .clone()
            .or_else(|| entry.pending.as_ref().and_then(PendingOperation::peek).and_then(Result::ok))
    }
}

impl<A, R, D> StoreInner<A, R, D>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Registers the subscriber on the entry for `key` and decides how its call is served.
    ///
    /// Runs entirely under the entry lock: checking for and installing the
    /// pending operation cannot interleave with another caller.
    pub(crate) fn claim(
        self: &Arc<Self>,
        key: &CacheKey,
        cache_time: Duration,
        subscriber: &Arc<SubscriberShared<A, R, D>>,
        start: impl FnOnce() -> BoxFuture<'static, Result<Settled<R, D>>>,
    ) -> Claim<R, D> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::new);
        entry.subscribers.register(subscriber);

        if entry.freshness.is_aged_out(cache_time, &self.clock) {
            entry.invalidate();
            record(self.name, key, CacheActivity::Expired);
        }

        if entry.freshness.is_valid(cache_time, &self.clock) {
            if let Some(value) = &entry.value {
                record(self.name, key, CacheActivity::Hit);
                return Claim::Cached(value.clone());
            }
            if let Some(retained) = &entry.pending {
                record(self.name, key, CacheActivity::Hit);
                return Claim::Join(retained.clone());
            }
        }

        if let Some(pending) = &entry.pending {
            record(self.name, key, CacheActivity::Joined);
            return Claim::Join(pending.clone());
        }

        let id = OperationId(self.next_operation.fetch_add(1, Ordering::Relaxed));
        let pending = PendingOperation::new(id, self.settle_after(key.clone(), id, subscriber.id, start()));
        entry.pending = Some(pending.clone());
        record(self.name, key, CacheActivity::Miss);
        Claim::Lead(pending)
    }

    /// Wraps the operation so its outcome is applied to the entry exactly once,
    /// by whichever caller happens to drive it to completion.
    fn settle_after(
        self: &Arc<Self>,
        key: CacheKey,
        id: OperationId,
        producer: SubscriberId,
        operation: BoxFuture<'static, Result<Settled<R, D>>>,
    ) -> BoxFuture<'static, Result<Settled<R, D>>> {
        let store = Arc::downgrade(self);
        async move {
            let outcome = operation.await;
            if let Some(store) = store.upgrade() {
                store.settle(&key, id, producer, &outcome);
            }
            outcome
        }
        .boxed()
    }

    fn settle(&self, key: &CacheKey, id: OperationId, producer: SubscriberId, outcome: &Result<Settled<R, D>>) {
        let targets = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                // Collected while the operation was running.
                return;
            };
            if entry.pending.as_ref().map(PendingOperation::id) != Some(id) {
                // Invalidated while the operation was running.
                return;
            }

            match outcome {
                Ok(settled) => {
                    entry.freshness = Freshness::Updated(self.clock.instant());
                    match self.pending_policy {
                        PendingPolicy::ClearAfterBroadcast => {
                            entry.value = Some(settled.clone());
                            entry.pending = None;
                        }
                        PendingPolicy::Retain => entry.value = None,
                    }
                    record(self.name, key, CacheActivity::Populated);
                    entry.subscribers.siblings(Some(producer))
                }
                Err(Error::Canceled) => {
                    entry.pending = None;
                    record(self.name, key, CacheActivity::Canceled);
                    return;
                }
                Err(_) => {
                    entry.invalidate();
                    record(self.name, key, CacheActivity::Failed);
                    return;
                }
            }
        };

        if let Ok(settled) = outcome {
            if broadcast(&targets, key, settled, self.key_guard) > 0 {
                record(self.name, key, CacheActivity::Broadcast);
            }
        }
    }

    /// Pushes a subscriber's current result to its same-key siblings.
    pub(crate) fn sync_siblings(&self, key: &CacheKey, from: SubscriberId, settled: &Settled<R, D>) -> usize {
        let targets = self
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.subscribers.siblings(Some(from)))
            .unwrap_or_default();

        let delivered = broadcast(&targets, key, settled, self.key_guard);
        if delivered > 0 {
            record(self.name, key, CacheActivity::Broadcast);
        }
        delivered
    }
}
