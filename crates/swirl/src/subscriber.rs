// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Subscribers: the callers that share cache entries.

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::Duration,
};

use futures::future::{AbortHandle, AbortRegistration, Abortable, Aborted, BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::{
    CacheKey, CacheTime, Error, KeyGuard, KeySpec, Result, Settled, Slot, SwrStore,
    key::{History, resolve_key},
    store::Claim,
    telemetry::{CacheActivity, record, record_unkeyed},
};

/// Identifies a subscriber within its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Format<R, D> = dyn Fn(&R) -> D + Send + Sync;
type Service<A, R> = dyn Fn(A) -> BoxFuture<'static, Result<R>> + Send + Sync;

/// How a subscriber takes part in caching.
///
/// Without a key, or with a zero cache time, calls bypass the store entirely.
pub struct SubscriberOptions<A, R, D = R> {
    key: Option<KeySpec<A>>,
    cache_time: Option<CacheTime<A>>,
    format: Arc<Format<R, D>>,
}

impl<A, R: Clone + 'static> SubscriberOptions<A, R, R> {
    /// Options with no key, the store's default cache time and results used as-is.
    #[must_use]
    pub fn new() -> Self {
        Self::with_format(R::clone)
    }
}

impl<A, R: Clone + 'static> Default for SubscriberOptions<A, R, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, R, D> SubscriberOptions<A, R, D> {
    /// Options whose results are converted by `format` before they reach the subscriber.
    ///
    /// The formatter of the subscriber that produced a result also decides what
    /// its siblings receive.
    #[must_use]
    pub fn with_format(format: impl Fn(&R) -> D + Send + Sync + 'static) -> Self {
        Self {
            key: None,
            cache_time: None,
            format: Arc::new(format),
        }
    }

    /// Sets the cache key.
    #[must_use]
    pub fn key(mut self, key: impl Into<KeySpec<A>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the validity window, overriding the store's default.
    #[must_use]
    pub fn cache_time(mut self, cache_time: impl Into<CacheTime<A>>) -> Self {
        self.cache_time = Some(cache_time.into());
        self
    }
}

impl<A, R, D> Clone for SubscriberOptions<A, R, D> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            cache_time: self.cache_time.clone(),
            format: Arc::clone(&self.format),
        }
    }
}

impl<A, R, D> fmt::Debug for SubscriberOptions<A, R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberOptions")
            .field("key", &self.key)
            .field("cache_time", &self.cache_time)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct RunState {
    in_flight: usize,
    finished: bool,
    calls: HashMap<u64, AbortHandle>,
    next_call: u64,
}

/// The part of a subscriber that the store's registries point at.
pub(crate) struct SubscriberShared<A, R, D> {
    pub(crate) id: SubscriberId,
    options: SubscriberOptions<A, R, D>,
    data: Slot<D>,
    raw: Slot<R>,
    executing: Slot<bool>,
    payload: Slot<A>,
    state: Mutex<RunState>,
}

impl<A, R, D> SubscriberShared<A, R, D> {
    fn history(&self) -> History {
        let state = self.state.lock();
        History {
            executing: state.in_flight > 0,
            finished: state.finished,
        }
    }

    pub(crate) fn is_executing(&self) -> bool {
        self.state.lock().in_flight > 0
    }

    fn key_for(&self, args: &A, guard: KeyGuard) -> Result<Option<CacheKey>> {
        resolve_key(self.options.key.as_ref(), Some(args), self.history(), guard)
    }

    fn cache_time_for(&self, args: &A, default: Duration) -> Result<Duration> {
        self.options.cache_time.as_ref().map_or(Ok(default), |time| time.resolve(args))
    }

    /// Starts tracking a call and returns the registration that aborts it.
    fn begin(self: &Arc<Self>, args: A) -> (CallGuard<A, R, D>, AbortRegistration) {
        let (handle, registration) = AbortHandle::new_pair();
        let call = {
            let mut state = self.state.lock();
            let call = state.next_call;
            state.next_call += 1;
            state.in_flight += 1;
            state.calls.insert(call, handle);
            call
        };

        self.payload.set(args);
        self.executing.set(true);

        (
            CallGuard {
                shared: Arc::clone(self),
                call,
            },
            registration,
        )
    }

    fn abort_all(&self) -> usize {
        let calls: Vec<_> = self.state.lock().calls.drain().map(|(_, handle)| handle).collect();
        for handle in &calls {
            handle.abort();
        }
        calls.len()
    }
}

impl<A: Clone, R, D> SubscriberShared<A, R, D> {
    /// The key for the subscriber's most recent arguments.
    pub(crate) fn current_key(&self, guard: KeyGuard) -> Result<Option<CacheKey>> {
        let args = self.payload.get();
        resolve_key(self.options.key.as_ref(), args.as_ref(), self.history(), guard)
    }

    fn current_cache_time(&self, default: Duration) -> Result<Duration> {
        match (&self.options.cache_time, self.payload.get()) {
            (None, _) => Ok(default),
            (Some(time), Some(args)) => time.resolve(&args),
            (Some(CacheTime::Fixed(time)), None) => Ok(*time),
            (Some(CacheTime::Derived(_)), None) => Ok(Duration::ZERO),
        }
    }
}

impl<A, R: Clone, D: Clone> SubscriberShared<A, R, D> {
    /// Writes a result into the subscriber's slots.
    pub(crate) fn publish(&self, settled: &Settled<R, D>) {
        self.raw.set(settled.raw.clone());
        self.data.set(settled.data.clone());
    }
}

/// Tracks one in-flight call; dropping it ends the call whether it finished,
/// failed or was aborted.
struct CallGuard<A, R, D> {
    shared: Arc<SubscriberShared<A, R, D>>,
    call: u64,
}

impl<A, R, D> Drop for CallGuard<A, R, D> {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.shared.state.lock();
            state.calls.remove(&self.call);
            state.in_flight = state.in_flight.saturating_sub(1);
            state.finished = true;
            state.in_flight == 0
        };

        if idle {
            self.shared.executing.set(false);
        }
    }
}

/// A caller of a keyed operation whose results are shared through a [`SwrStore`].
///
/// Each subscriber owns observable [slots][Slot] for its formatted data, the
/// raw result, whether it is executing and the arguments of its latest call.
/// Results from sibling subscribers on the same key are pushed into those
/// slots while this subscriber is idle.
///
/// Dropping a subscriber, or calling [`dispose`][Self::dispose], removes it
/// from every entry; entries left without subscribers are removed from the
/// store.
pub struct Subscriber<A, R, D = R> {
    store: SwrStore<A, R, D>,
    shared: Arc<SubscriberShared<A, R, D>>,
    service: Arc<Service<A, R>>,
}

impl<A, R, D> Subscriber<A, R, D> {
    pub(crate) fn new(store: SwrStore<A, R, D>, id: SubscriberId, service: Arc<Service<A, R>>, options: SubscriberOptions<A, R, D>) -> Self {
        Self {
            store,
            shared: Arc::new(SubscriberShared {
                id,
                options,
                data: Slot::new(),
                raw: Slot::new(),
                executing: Slot::with_value(Some(false)),
                payload: Slot::new(),
                state: Mutex::new(RunState::default()),
            }),
            service,
        }
    }

    /// Identifies this subscriber in its store's entries.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.shared.id
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<SubscriberShared<A, R, D>> {
        &self.shared
    }

    /// The store this subscriber belongs to.
    #[must_use]
    pub fn store(&self) -> &SwrStore<A, R, D> {
        &self.store
    }

    /// The formatted result of the latest call or broadcast.
    #[must_use]
    pub fn data(&self) -> &Slot<D> {
        &self.shared.data
    }

    /// The raw result of the latest call or broadcast.
    #[must_use]
    pub fn raw_data(&self) -> &Slot<R> {
        &self.shared.raw
    }

    /// Whether a call is in progress.
    #[must_use]
    pub fn is_executing(&self) -> &Slot<bool> {
        &self.shared.executing
    }

    /// The arguments of the latest call.
    #[must_use]
    pub fn payload(&self) -> &Slot<A> {
        &self.shared.payload
    }

    /// Detaches the subscriber from the store.
    ///
    /// Aborts in-flight calls, removes the subscriber from every entry and
    /// removes entries that no longer have subscribers. A later call registers
    /// the subscriber again; dropping it detaches it for good.
    pub fn dispose(&self) {
        self.shared.abort_all();
        self.store.inner.prune(self.shared.id);
    }
}

impl<A: Clone, R, D> Subscriber<A, R, D> {
    /// The cache key for the latest arguments, if the subscriber has one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyResolution`] if a derived key function fails.
    pub fn key(&self) -> Result<Option<CacheKey>> {
        self.shared.current_key(self.store.inner.key_guard)
    }

    /// Aborts every in-flight call of this subscriber.
    ///
    /// Aborted calls return `Ok(None)`. The shared operation itself keeps
    /// running for the other subscribers waiting on it. Returns the number of
    /// calls aborted.
    pub fn cancel(&self) -> usize {
        let inner = &self.store.inner;
        let aborted = self.shared.abort_all();
        if aborted > 0 {
            match self.shared.current_key(inner.key_guard) {
                Ok(Some(key)) => record(inner.name, &key, CacheActivity::Canceled),
                _ => record_unkeyed(inner.name, CacheActivity::Canceled),
            }
        }
        aborted
    }
}

impl<A, R, D> Subscriber<A, R, D>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Runs the operation for `args`, served from the cache when possible.
    ///
    /// A valid entry returns its data without calling the service. An entry with
    /// an operation in flight is joined. Otherwise the service runs and its
    /// result populates the entry and is pushed to idle siblings on the same key.
    ///
    /// Returns `Ok(None)` if the call was aborted by [`cancel`][Self::cancel] or
    /// its operation reported [`Error::Canceled`].
    ///
    /// # Errors
    ///
    /// Returns an error if the key or cache time cannot be resolved, or if the
    /// operation fails. A failed operation leaves the entry expired.
    pub async fn run(&self, args: A) -> Result<Option<D>> {
        let (_call, registration) = self.shared.begin(args.clone());
        abort_to_none(Abortable::new(self.execute(args), registration).await)
    }

    async fn execute(&self, args: A) -> Result<Option<D>> {
        let inner = &self.store.inner;
        loop {
            let Some(key) = self.shared.key_for(&args, inner.key_guard)? else {
                return self.bypass(None, args).await;
            };
            let cache_time = self.shared.cache_time_for(&args, inner.default_cache_time)?;
            if cache_time.is_zero() {
                return self.bypass(Some(&key), args).await;
            }

            let (pending, leading) = match inner.claim(&key, cache_time, &self.shared, || self.operation(args.clone())) {
                Claim::Cached(settled) => {
                    self.shared.publish(&settled);
                    return Ok(Some(settled.data));
                }
                Claim::Join(pending) => (pending, false),
                Claim::Lead(pending) => (pending, true),
            };

            match pending.outcome().await {
                Ok(settled) => {
                    self.shared.publish(&settled);
                    return Ok(Some(settled.data));
                }
                Err(Error::Canceled) if leading => return Ok(None),
                // The operation we joined was canceled; claim the entry again.
                Err(Error::Canceled) => {}
                Err(error) => return Err(error),
            }
        }
    }

    async fn bypass(&self, key: Option<&CacheKey>, args: A) -> Result<Option<D>> {
        let name = self.store.inner.name;
        match key {
            Some(key) => record(name, key, CacheActivity::Bypass),
            None => record_unkeyed(name, CacheActivity::Bypass),
        }
        match self.operation(args).await {
            Ok(settled) => {
                self.shared.publish(&settled);
                Ok(Some(settled.data))
            }
            Err(Error::Canceled) => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn operation(&self, args: A) -> BoxFuture<'static, Result<Settled<R, D>>> {
        let service = Arc::clone(&self.service);
        let format = Arc::clone(&self.shared.options.format);
        async move {
            let raw = service(args).await?;
            let data = format(&raw);
            Ok(Settled { raw, data })
        }
        .boxed()
    }

    /// Expires the entry for `args`, or for the latest arguments when `None`.
    ///
    /// The next call on that key runs the operation again. Returns `false` if
    /// the subscriber has no key or no entry exists for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyResolution`] if a derived key function fails.
    pub fn mark_expired(&self, args: Option<&A>) -> Result<bool> {
        let guard = self.store.inner.key_guard;
        let key = match args {
            Some(args) => self.shared.key_for(args, guard)?,
            None => self.shared.current_key(guard)?,
        };
        Ok(key.is_some_and(|key| self.store.inner.invalidate(&key)))
    }

    /// Expires the entry and runs the operation again.
    ///
    /// Uses the latest arguments when `args` is `None`; returns `Ok(None)` without
    /// doing anything if the subscriber has never been called.
    ///
    /// # Errors
    ///
    /// Same as [`run`][Self::run].
    pub async fn revalidate(&self, args: Option<A>) -> Result<Option<D>> {
        let Some(args) = args.or_else(|| self.shared.payload.get()) else {
            return Ok(None);
        };

        // The key is resolved while the call is executing, as `run` resolves it.
        let (_call, registration) = self.shared.begin(args.clone());
        if let Some(key) = self.shared.key_for(&args, self.store.inner.key_guard)? {
            self.store.inner.invalidate(&key);
        }
        abort_to_none(Abortable::new(self.execute(args), registration).await)
    }

    /// Re-emits cached data without running the operation.
    ///
    /// With `include_self`, this subscriber's slots are refreshed from its
    /// entry, or observers are notified again when the entry holds nothing
    /// valid. With `sync_data`, this subscriber's current result is pushed to
    /// its idle siblings on the same key. Returns the number of siblings
    /// updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or cache time cannot be resolved.
    pub fn trigger_data(&self, include_self: bool, sync_data: bool) -> Result<usize> {
        let inner = &self.store.inner;
        let Some(key) = self.shared.current_key(inner.key_guard)? else {
            if include_self {
                self.shared.data.touch();
            }
            return Ok(0);
        };

        if include_self {
            let cache_time = self.shared.current_cache_time(inner.default_cache_time)?;
            match inner.cached_value(&key, cache_time) {
                Some(settled) => self.shared.publish(&settled),
                None => {
                    self.shared.raw.touch();
                    self.shared.data.touch();
                }
            }
        }

        if !sync_data {
            return Ok(0);
        }
        match (self.shared.raw.get(), self.shared.data.get()) {
            (Some(raw), Some(data)) => Ok(inner.sync_siblings(&key, self.shared.id, &Settled { raw, data })),
            _ => Ok(0),
        }
    }
}

fn abort_to_none<T>(outcome: std::result::Result<Result<Option<T>>, Aborted>) -> Result<Option<T>> {
    outcome.unwrap_or(Ok(None))
}

impl<A, R, D> Drop for Subscriber<A, R, D> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<A, R, D> fmt::Debug for Subscriber<A, R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.shared.id)
            .field("store", &self.store.inner.name)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tick::Clock;

    use super::*;
    use crate::testing::LogCapture;

    type Store = SwrStore<u32, u32, String>;

    fn store() -> Store {
        Store::builder(Clock::new_frozen()).default_cache_time(Duration::from_secs(60)).build()
    }

    fn counting(calls: &Arc<AtomicUsize>) -> impl Fn(u32) -> BoxFuture<'static, Result<u32>> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move |id| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(id * 10) }.boxed()
        }
    }

    fn options() -> SubscriberOptions<u32, u32, String> {
        SubscriberOptions::with_format(|raw: &u32| format!("value {raw}")).key(KeySpec::derived(|id: &u32| format!("item:{id}")))
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Subscriber<u32, u32, String>: Send, Sync);
        static_assertions::assert_impl_all!(SubscriberOptions<u32, u32, String>: Send, Sync, Clone);
        static_assertions::assert_impl_all!(SubscriberId: Send, Sync, Copy);
    }

    #[tokio::test]
    async fn run_fills_slots() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let subscriber = store.subscribe(counting(&calls), options());

        assert_eq!(subscriber.is_executing().get(), Some(false));
        assert_eq!(subscriber.run(4).await.unwrap(), Some("value 40".to_string()));

        assert_eq!(subscriber.data().get(), Some("value 40".to_string()));
        assert_eq!(subscriber.raw_data().get(), Some(40));
        assert_eq!(subscriber.payload().get(), Some(4));
        assert_eq!(subscriber.is_executing().get(), Some(false));
        assert_eq!(subscriber.key().unwrap(), Some(CacheKey::from("item:4")));
    }

    #[tokio::test]
    async fn second_run_is_served_from_cache() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let subscriber = store.subscribe(counting(&calls), options());

        subscriber.run(1).await.unwrap();
        subscriber.run(1).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_key_bypasses_store() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let subscriber = store.subscribe(counting(&calls), SubscriberOptions::with_format(|raw: &u32| raw.to_string()));

        subscriber.run(1).await.unwrap();
        subscriber.run(1).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn zero_cache_time_bypasses_store() {
        let store = Store::new(Clock::new_frozen());
        let calls = Arc::new(AtomicUsize::new(0));
        let subscriber = store.subscribe(counting(&calls), options());

        subscriber.run(1).await.unwrap();
        subscriber.run(1).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn revalidate_without_history_does_nothing() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let subscriber = store.subscribe(counting(&calls), options());

        assert_eq!(subscriber.revalidate(None).await.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn revalidate_reuses_latest_arguments() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let subscriber = store.subscribe(counting(&calls), options());

        subscriber.run(2).await.unwrap();
        let refreshed = subscriber.revalidate(None).await.unwrap();

        assert_eq!(refreshed, Some("value 20".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mark_expired_before_history_resolves_no_key() {
        let store = store();
        let subscriber = store.subscribe(counting(&Arc::new(AtomicUsize::new(0))), options());

        assert!(!subscriber.mark_expired(None).unwrap());
        assert_eq!(subscriber.key().unwrap(), None);
    }

    #[tokio::test]
    async fn bypass_logs_resolved_key() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let uncached = store.subscribe(counting(&calls), options().cache_time(Duration::ZERO));
        uncached.run(4).await.unwrap();

        capture.assert_contains("cache.bypass");
        capture.assert_contains("cache.key=\"item:4\"");
    }

    #[tokio::test]
    async fn bypass_without_key_omits_key_field() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let unkeyed = store.subscribe(counting(&calls), SubscriberOptions::with_format(|raw: &u32| raw.to_string()));
        unkeyed.run(4).await.unwrap();

        capture.assert_contains("cache.bypass");
        assert!(!capture.output().contains("cache.key"));
    }

    #[tokio::test]
    async fn cancel_logs_key_of_aborted_call() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        let store = store();
        let subscriber = store.subscribe(|_id: u32| futures::future::pending::<Result<u32>>(), options());

        let (result, aborted) = tokio::join!(subscriber.run(5), async {
            tokio::task::yield_now().await;
            subscriber.cancel()
        });

        assert_eq!(result.unwrap(), None);
        assert_eq!(aborted, 1);
        let output = capture.output();
        let canceled = output.lines().find(|line| line.contains("cache.canceled")).unwrap();
        assert!(canceled.contains("cache.key=\"item:5\""), "{canceled}");
    }

    #[test]
    fn cancel_without_calls_is_noop() {
        let store = store();
        let subscriber = store.subscribe(counting(&Arc::new(AtomicUsize::new(0))), options());
        assert_eq!(subscriber.cancel(), 0);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_collects() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        let store = store();
        let subscriber = store.subscribe(counting(&Arc::new(AtomicUsize::new(0))), options());
        subscriber.run(1).await.unwrap();
        assert!(store.contains_key("item:1"));

        subscriber.dispose();
        subscriber.dispose();

        assert!(store.is_empty());
        assert_eq!(subscriber.is_executing().get(), Some(false));
        capture.assert_contains("cache.collected");
    }

    #[test]
    fn ids_are_distinct() {
        let store = store();
        let a = store.subscribe(counting(&Arc::new(AtomicUsize::new(0))), options());
        let b = store.subscribe(counting(&Arc::new(AtomicUsize::new(0))), options());

        assert_ne!(a.id(), b.id());
        assert_eq!(SubscriberId(3).to_string(), "#3");
    }

    #[test]
    fn debug_output() {
        let store = store();
        let subscriber = store.subscribe(counting(&Arc::new(AtomicUsize::new(0))), options());
        let debug = format!("{subscriber:?}");
        assert!(debug.contains("Subscriber"));
        assert!(debug.contains("Derived(..)"));
    }
}
