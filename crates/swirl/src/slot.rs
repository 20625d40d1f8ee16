// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Observable result cells written by calls and broadcasts.

use std::fmt;

use tokio::sync::watch;

/// An observable value owned by a subscriber.
///
/// Slots are how results reach the code that uses a subscriber: the
/// subscriber's own calls write to them, and so do broadcasts from sibling
/// subscribers that share the same cache key. Observers can either read the
/// current value or [`watch`][Self::watch] for changes.
///
/// # Examples
///
/// ```
/// use swirl::Slot;
///
/// let slot = Slot::new();
/// let mut changes = slot.watch();
///
/// slot.set(42);
/// assert_eq!(slot.get(), Some(42));
/// assert!(changes.has_changed().unwrap());
/// ```
pub struct Slot<T> {
    sender: watch::Sender<Option<T>>,
}

impl<T> Slot<T> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::with_value(None)
    }

    pub(crate) fn with_value(value: Option<T>) -> Self {
        let (sender, _) = watch::channel(value);
        Self { sender }
    }

    /// Replaces the current value and notifies observers.
    pub fn set(&self, value: T) {
        self.sender.send_replace(Some(value));
    }

    /// Notifies observers without changing the value.
    ///
    /// Used to force observers to re-read a value that was mutated in a way
    /// they could not see.
    pub fn touch(&self) {
        self.sender.send_modify(|_| {});
    }

    /// Returns a receiver that observes every subsequent change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Option<T>> {
        self.sender.subscribe()
    }

    /// Returns `true` if the slot holds no value yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sender.borrow().is_none()
    }
}

impl<T: Clone> Slot<T> {
    /// Returns a clone of the current value.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.sender.borrow().clone()
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&*self.sender.borrow()).finish()
    }
}
