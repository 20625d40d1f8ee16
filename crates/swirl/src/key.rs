// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache key derivation.

use std::{borrow::Borrow, fmt, ops::Deref, sync::Arc};

use crate::{Error, Result};

/// Identifies which calls may share cached results.
///
/// Keys are opaque strings; cloning is a reference-count bump.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates a key from any string-like value.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for CacheKey {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

type DeriveKey<A> = dyn Fn(&A) -> Result<CacheKey> + Send + Sync;

/// How a subscriber derives its cache key.
///
/// # Examples
///
/// ```
/// use swirl::KeySpec;
///
/// let fixed: KeySpec<u32> = KeySpec::fixed("user:1");
/// let per_user: KeySpec<u32> = KeySpec::derived(|id: &u32| format!("user:{id}"));
/// # let _ = (fixed, per_user);
/// ```
pub enum KeySpec<A> {
    /// The same key for every call, available even before the first execution.
    Static(CacheKey),

    /// A key computed from the current call arguments.
    Derived(Arc<DeriveKey<A>>),
}

impl<A: 'static> KeySpec<A> {
    /// A key that never changes.
    pub fn fixed(key: impl Into<CacheKey>) -> Self {
        Self::Static(key.into())
    }

    /// A key computed from call arguments.
    pub fn derived<K, F>(derive: F) -> Self
    where
        K: Into<CacheKey>,
        F: Fn(&A) -> K + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(move |args: &A| -> Result<CacheKey> { Ok(derive(args).into()) }))
    }

    /// A key computed from call arguments by a function that may fail.
    ///
    /// A failure is reported as [`Error::KeyResolution`] to the caller and
    /// leaves the cache untouched.
    pub fn try_derived<K, E, F>(derive: F) -> Self
    where
        K: Into<CacheKey>,
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(&A) -> Result<K, E> + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(move |args: &A| -> Result<CacheKey> {
            derive(args).map(Into::into).map_err(Error::key_resolution)
        }))
    }
}

impl<A> Clone for KeySpec<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Static(key) => Self::Static(key.clone()),
            Self::Derived(derive) => Self::Derived(Arc::clone(derive)),
        }
    }
}

impl<A> fmt::Debug for KeySpec<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(key) => f.debug_tuple("Static").field(key).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

impl<A> From<CacheKey> for KeySpec<A> {
    fn from(key: CacheKey) -> Self {
        Self::Static(key)
    }
}

impl<A> From<&str> for KeySpec<A> {
    fn from(key: &str) -> Self {
        Self::Static(key.into())
    }
}

impl<A> From<String> for KeySpec<A> {
    fn from(key: String) -> Self {
        Self::Static(key.into())
    }
}

/// When a [`KeySpec::Derived`] key may be evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyGuard {
    /// Derived keys resolve only once the subscriber has finished a call or is
    /// currently executing one, so default arguments are never used as a key.
    #[default]
    RequireHistory,

    /// Derived keys are evaluated whenever arguments are available.
    Always,
}

/// What a subscriber has done so far, as seen by key resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct History {
    pub executing: bool,
    pub finished: bool,
}

impl History {
    fn has_record(self) -> bool {
        self.executing || self.finished
    }
}

/// Resolves a subscriber's cache key for the given arguments.
///
/// `Ok(None)` means the call does not participate in caching.
pub(crate) fn resolve_key<A>(spec: Option<&KeySpec<A>>, args: Option<&A>, history: History, guard: KeyGuard) -> Result<Option<CacheKey>> {
    match spec {
        None => Ok(None),
        Some(KeySpec::Static(key)) => Ok(Some(key.clone())),
        Some(KeySpec::Derived(derive)) => {
            if guard == KeyGuard::RequireHistory && !history.has_record() {
                return Ok(None);
            }
            args.map(|args| derive(args)).transpose()
        }
    }
}
