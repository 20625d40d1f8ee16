// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The single in-flight operation per cache key.

use std::fmt;

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::Result;

/// The outcome of a successful operation: the raw result and its formatted form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled<R, D> {
    /// The value produced by the underlying operation.
    pub raw: R,
    /// The value after the producing subscriber's formatter ran.
    pub data: D,
}

/// Identifies one invocation of an underlying operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct OperationId(pub u64);

/// A shared handle to an in-flight (or, under [`PendingPolicy::Retain`][crate::PendingPolicy::Retain],
/// settled) operation.
///
/// Every clone awaits the same underlying future. The future keeps making
/// progress as long as any clone is polled, so a caller that stops waiting
/// never cancels the work for the others.
pub(crate) struct PendingOperation<R, D> {
    id: OperationId,
    future: Shared<BoxFuture<'static, Result<Settled<R, D>>>>,
}

impl<R, D> PendingOperation<R, D>
where
    R: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(id: OperationId, future: BoxFuture<'static, Result<Settled<R, D>>>) -> Self {
        Self {
            id,
            future: future.shared(),
        }
    }

    /// Waits for the shared outcome.
    pub(crate) async fn outcome(self) -> Result<Settled<R, D>> {
        self.future.await
    }
}

impl<R: Clone, D: Clone> PendingOperation<R, D> {
    /// Returns the outcome if the operation has already settled.
    pub(crate) fn peek(&self) -> Option<Result<Settled<R, D>>> {
        self.future.peek().cloned()
    }
}

impl<R, D> PendingOperation<R, D> {
    pub(crate) fn id(&self) -> OperationId {
        self.id
    }
}

impl<R, D> Clone for PendingOperation<R, D> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            future: self.future.clone(),
        }
    }
}

impl<R, D> fmt::Debug for PendingOperation<R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation").field("id", &self.id.0).finish_non_exhaustive()
    }
}
