// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-entry subscriber membership and result broadcast.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use crate::{
    CacheKey, KeyGuard, Settled, SubscriberId,
    subscriber::SubscriberShared,
};

/// The subscribers currently associated with one cache entry.
///
/// Members are held weakly: the registry never keeps a subscriber alive.
pub(crate) struct Registry<A, R, D> {
    members: HashMap<SubscriberId, Weak<SubscriberShared<A, R, D>>>,
}

impl<A, R, D> Registry<A, R, D> {
    pub(crate) fn new() -> Self {
        Self { members: HashMap::new() }
    }

    /// Adds the subscriber, replacing any previous slot it held.
    ///
    /// Returns `true` if the subscriber was not yet a member.
    pub(crate) fn register(&mut self, subscriber: &Arc<SubscriberShared<A, R, D>>) -> bool {
        self.members.insert(subscriber.id, Arc::downgrade(subscriber)).is_none()
    }

    pub(crate) fn remove(&mut self, id: SubscriberId) -> bool {
        self.members.remove(&id).is_some()
    }

    /// Drops members whose subscriber no longer exists.
    pub(crate) fn prune_dead(&mut self) {
        self.members.retain(|_, member| member.strong_count() > 0);
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Live members other than `except`.
    pub(crate) fn siblings(&self, except: Option<SubscriberId>) -> Vec<Arc<SubscriberShared<A, R, D>>> {
        self.members
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .filter_map(|(_, member)| member.upgrade())
            .collect()
    }
}

impl<A, R, D> fmt::Debug for Registry<A, R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.members.keys()).finish()
    }
}

/// Pushes a freshly produced result into every idle sibling whose key still matches.
///
/// Siblings that are executing are skipped; their own call will update them.
/// Each sibling's key is resolved again from its current arguments, since it
/// may have changed since the sibling registered. Returns how many siblings
/// were updated.
pub(crate) fn broadcast<A, R, D>(
    targets: &[Arc<SubscriberShared<A, R, D>>],
    key: &CacheKey,
    settled: &Settled<R, D>,
    guard: KeyGuard,
) -> usize
where
    A: Clone,
    R: Clone,
    D: Clone,
{
    let mut delivered = 0;
    for target in targets {
        if target.is_executing() {
            continue;
        }

        match target.current_key(guard) {
            Ok(Some(current)) if current == *key => {
                target.publish(settled);
                delivered += 1;
            }
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(cache.key = key.as_str(), subscriber = %target.id, %error, "skipping broadcast target");
            }
        }
    }
    delivered
}
