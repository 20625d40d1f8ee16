// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Stale-while-revalidate coordination for keyed async operations.
//!
//! Many independent callers often need the result of the same keyed operation:
//! several views showing one user profile, several handlers resolving one
//! configuration document. This crate lets them share that work:
//!
//! - A [`SwrStore`] maps each [`CacheKey`] to an entry holding when it was last
//!   populated, the single operation currently producing its value, and the
//!   subscribers associated with it.
//! - A [`Subscriber`] wraps an async operation. Its calls return cached data while
//!   the entry is younger than the subscriber's [`CacheTime`], join the in-flight
//!   operation if there is one, and otherwise run the operation exactly once.
//! - When an operation succeeds, its result is pushed into the [slots][Slot] of
//!   every idle sibling subscriber whose key still matches.
//! - When an operation fails, the entry is expired so the next call retries.
//! - Dropping a subscriber removes it from every entry; entries left without
//!   subscribers are removed.
//!
//! Keys are either fixed or derived from the call arguments. Derived keys are
//! only evaluated once a subscriber has been called, unless the store is
//! configured with [`KeyGuard::Always`].
//!
//! Entry ages are measured with the [`tick::Clock`] the store is built with.
//! Tests can pass a clock from `tick::ClockControl` to move time by hand.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use swirl::{KeySpec, SubscriberOptions, SwrStore};
//! use tick::Clock;
//! # futures::executor::block_on(async {
//!
//! let store = SwrStore::<u32, String>::builder(Clock::new_frozen())
//!     .name("profiles")
//!     .default_cache_time(Duration::from_secs(60))
//!     .build();
//!
//! let options = SubscriberOptions::new().key(KeySpec::derived(|id: &u32| format!("user:{id}")));
//! let header = store.subscribe(|id: u32| async move { Ok(format!("user {id}")) }, options.clone());
//! let sidebar = store.subscribe(|id: u32| async move { Ok(format!("user {id}")) }, options);
//!
//! header.run(7).await?;
//! // Served from the entry populated by `header`.
//! assert_eq!(sidebar.run(7).await?, Some("user 7".to_string()));
//!
//! header.mark_expired(None)?;
//! assert!(store.entry("user:7").is_some_and(|entry| entry.is_expired()));
//! # Ok::<(), swirl::Error>(())
//! # });
//! ```
//!
//! # Logging
//!
//! Cache activity is reported through [`tracing`] as `swr.event` events with
//! `cache.name`, `cache.key` and `cache.activity` fields. Failures are logged at
//! `WARN`; expiry, invalidation and collection of entries at `INFO`; everything
//! else at `DEBUG`.

pub mod builder;
mod error;
mod key;
mod pending;
mod policy;
mod registry;
mod slot;
mod store;
mod subscriber;
mod telemetry;

#[cfg(test)]
mod testing;

#[doc(inline)]
pub use builder::StoreBuilder;
#[doc(inline)]
pub use error::{Error, Result};
#[doc(inline)]
pub use key::{CacheKey, KeyGuard, KeySpec};
#[doc(inline)]
pub use pending::Settled;
#[doc(inline)]
pub use policy::{CacheTime, Freshness, PendingPolicy};
#[doc(inline)]
pub use slot::Slot;
#[doc(inline)]
pub use store::{EntrySnapshot, SwrStore};
#[doc(inline)]
pub use subscriber::{Subscriber, SubscriberId, SubscriberOptions};
