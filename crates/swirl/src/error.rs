// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors returned by stores and subscribers.

use std::sync::Arc;

type Source = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The result type for fallible `swirl` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error produced while coordinating a cached operation.
///
/// Errors are cheap to clone: a single failure of a shared operation is
/// handed to every caller that was waiting on it.
///
/// # Examples
///
/// ```
/// use swirl::Error;
///
/// let error = Error::from_source(std::io::Error::other("connection reset"));
/// assert!(!error.is_canceled());
/// assert_eq!(error.to_string(), "operation failed: connection reset");
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A derived key function failed. Cache state is left untouched.
    #[error("failed to resolve cache key: {0}")]
    KeyResolution(#[source] Source),

    /// A derived cache time function failed. Cache state is left untouched.
    #[error("failed to resolve cache time: {0}")]
    CacheTimeResolution(#[source] Source),

    /// The underlying operation failed. The failure is never cached.
    #[error("operation failed: {0}")]
    Operation(#[source] Source),

    /// The underlying operation reported that it was canceled and produced no result.
    #[error("operation was canceled")]
    Canceled,
}

impl Error {
    /// Wraps an arbitrary error raised by the underlying operation.
    pub fn from_source(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Operation(Arc::new(error))
    }

    /// Wraps an error raised while deriving a cache key.
    pub fn key_resolution(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::KeyResolution(Arc::new(error))
    }

    /// Wraps an error raised while deriving a cache time.
    pub fn cache_time_resolution(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::CacheTimeResolution(Arc::new(error))
    }

    /// Returns `true` if this is the cancellation marker rather than a failure.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Attempts to view the wrapped source as a concrete error type.
    #[must_use]
    pub fn source_as<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::KeyResolution(source) | Self::CacheTimeResolution(source) | Self::Operation(source) => {
                source.downcast_ref::<E>()
            }
            Self::Canceled => None,
        }
    }
}
