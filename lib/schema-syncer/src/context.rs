// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cooperative cancellation with optional deadlines.
//!
//! A [`Context`] pairs a [`CancellationToken`] with an optional deadline. Operations check it
//! at loop boundaries and race in-flight store calls against it with [`Context::run`].
//!
//! Scoped children are derived with [`Context::with_timeout`] or [`Context::with_deadline`].
//! A child's deadline never outlives its parent's, and the child token is cancelled as soon
//! as the returned [`ScopedContext`] is dropped, whichever way the scope is left.

use std::future::Future;
use std::ops::Deref;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Why a [`Context`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never done unless its token is cancelled by someone holding a clone.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Wrap an existing token, e.g. the shutdown token of the owning runtime.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child bounded by `timeout` from now and by this context's own deadline.
    pub fn with_timeout(&self, timeout: Duration) -> ScopedContext {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child bounded by `deadline` and by this context's own deadline.
    pub fn with_deadline(&self, deadline: Instant) -> ScopedContext {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        let token = self.token.child_token();
        let guard = token.clone().drop_guard();
        ScopedContext {
            ctx: Context {
                token,
                deadline: Some(deadline),
            },
            _guard: guard,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `None` while the context is live, otherwise the reason it finished.
    /// Cancellation wins over an expired deadline.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => ContextError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Drive `fut` to completion unless the context finishes first, in which case the
    /// future is dropped and the reason is returned.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            output = fut => Ok(output),
        }
    }

    /// Sleep for `duration` unless the context finishes first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        self.run(tokio::time::sleep(duration)).await
    }
}

/// A child [`Context`] that is cancelled when dropped.
#[derive(Debug)]
pub struct ScopedContext {
    ctx: Context,
    _guard: DropGuard,
}

impl Deref for ScopedContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.ctx
    }
}
