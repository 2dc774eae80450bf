// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Retry budget for store writes.

use std::future::Future;
use std::time::Duration;

use crate::context::Context;
use crate::error::{AttemptTimedOut, SyncerError};

/// Attempt count that in practice never runs out.
pub const UNLIMITED_ATTEMPTS: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Treated as at least one.
    pub max_attempts: u64,
    /// Bound on every single attempt.
    pub attempt_timeout: Duration,
    /// Pause after a failed attempt when budget remains.
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u64, attempt_timeout: Duration, interval: Duration) -> Self {
        Self {
            max_attempts,
            attempt_timeout,
            interval,
        }
    }

    /// Run `attempt` until it succeeds, the budget is spent or `ctx` finishes.
    ///
    /// `ctx` is checked before every attempt and while sleeping between attempts. Each
    /// attempt runs under a child of `ctx` bounded by `attempt_timeout`; an attempt that
    /// hits that bound counts as a failed attempt and fails with [`AttemptTimedOut`]. If
    /// `ctx` itself finishes mid-attempt, its error is returned at once.
    pub async fn run<F, Fut>(
        &self,
        ctx: &Context,
        op: &'static str,
        key: &str,
        mut attempt: F,
    ) -> Result<(), SyncerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0u64;

        loop {
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }

            attempts += 1;
            let result = {
                let scope = ctx.with_timeout(self.attempt_timeout);
                match scope.run(attempt()).await {
                    Ok(result) => result,
                    Err(_) => {
                        if let Some(err) = ctx.err() {
                            return Err(err.into());
                        }
                        Err(AttemptTimedOut(self.attempt_timeout).into())
                    }
                }
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            let chain = format!("{err:#}");
            tracing::warn!(op, key, attempt = attempts, error = %chain, "schema version write failed");

            if attempts >= max_attempts {
                return Err(SyncerError::RetriesExhausted {
                    op,
                    key: key.to_string(),
                    attempts,
                    source: err,
                });
            }

            ctx.sleep(self.interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;
    use futures::FutureExt;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn policy(max_attempts: u64) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_secs(2),
            Duration::from_millis(30),
        )
    }

    /// An attempt closure that fails the first `failures` calls.
    fn flaky(failures: u64, calls: Arc<AtomicU64>) -> impl FnMut() -> futures::future::Ready<anyhow::Result<()>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                futures::future::ready(Err(anyhow::anyhow!("attempt {n} failed")))
            } else {
                futures::future::ready(Ok(()))
            }
        }
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(7)]
    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_attempt(#[case] budget: u64) {
        let calls = Arc::new(AtomicU64::new(0));
        policy(budget)
            .run(&Context::background(), "put", "/k", flaky(budget - 1, calls.clone()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), budget);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_returns_last_error(#[case] budget: u64) {
        let calls = Arc::new(AtomicU64::new(0));
        let err = policy(budget)
            .run(&Context::background(), "put", "/k", flaky(u64::MAX, calls.clone()))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), budget);
        match err {
            SyncerError::RetriesExhausted {
                attempts, source, ..
            } => {
                assert_eq!(attempts, budget);
                assert_eq!(source.to_string(), format!("attempt {budget} failed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_context_makes_no_attempt() {
        let calls = Arc::new(AtomicU64::new(0));
        let ctx = Context::background();
        ctx.cancel();
        let err = policy(UNLIMITED_ATTEMPTS)
            .run(&ctx, "put", "/k", flaky(0, calls.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncerError::Context(ContextError::Canceled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_budget_stops_on_deadline() {
        let calls = Arc::new(AtomicU64::new(0));
        let parent = Context::background();
        let ctx = parent.with_timeout(Duration::from_millis(100));
        let err = policy(UNLIMITED_ATTEMPTS)
            .run(&ctx, "put", "/k", flaky(u64::MAX, calls.clone()))
            .await
            .unwrap_err();
        assert!(err.is_context_finished());
        // one attempt every 30ms within 100ms
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_and_is_retried() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::new(3, Duration::from_millis(50), Duration::from_millis(30));
        policy
            .run(&Context::background(), "put", "/k", move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_attempts_are_not_cancellation() {
        let policy = RetryPolicy::new(2, Duration::from_millis(50), Duration::from_millis(30));
        let err = policy
            .run(&Context::background(), "put", "/k", || {
                tokio::time::sleep(Duration::from_secs(10)).then(|_| futures::future::ok(()))
            })
            .await
            .unwrap_err();
        assert!(!err.is_context_finished());
        match err {
            SyncerError::RetriesExhausted {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(
                    source.downcast_ref::<AttemptTimedOut>(),
                    Some(&AttemptTimedOut(Duration::from_millis(50)))
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_attempt_wins_over_attempt_timeout() {
        let ctx = Context::background();
        let canceller = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ctx.cancel();
            })
        };
        let err = policy(1)
            .run(&ctx, "put", "/k", || {
                tokio::time::sleep(Duration::from_millis(500)).then(|_| futures::future::ok(()))
            })
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, SyncerError::Context(ContextError::Canceled)));
    }
}
