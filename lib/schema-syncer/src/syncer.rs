// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The schema version synchronizer.
//!
//! Every node publishes the schema version it has applied under
//! `/tidb/ddl/all_schema_versions/<node-id>`. The DDL owner writes the cluster-wide version
//! to `/tidb/ddl/global_schema_version` and then polls the per-node records until all of
//! them report it. Followers learn about new versions through the stream returned by
//! [`SchemaSyncer::global_version_ch`].
//!
//! Nodes only share state through the store; there is no direct node to node traffic.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::SyncerConfig;
use crate::context::Context;
use crate::convergence::{ConvergenceSet, RoundOutcome};
use crate::error::{AttemptTimedOut, SyncerError};
use crate::keys::{self, SchemaVersion};
use crate::notifier::VersionChangeStream;
use crate::retry::{RetryPolicy, UNLIMITED_ATTEMPTS};
use crate::store::{KeyValue, SchemaStore};

#[async_trait]
pub trait SchemaSyncer: Send + Sync {
    /// Bootstrap the shared keys: create the global version if nobody has yet, subscribe
    /// to it, and publish this node's record at version `0`.
    ///
    /// The subscription lives until `ctx` is cancelled.
    async fn init(&self, ctx: &Context) -> Result<(), SyncerError>;

    /// Publish the version this node has applied. Single attempt.
    async fn update_self_version(
        &self,
        ctx: &Context,
        version: SchemaVersion,
    ) -> Result<(), SyncerError>;

    /// Delete this node's record so the owner stops waiting on it.
    ///
    /// Runs on its own background context so shutdown paths cannot cut it short.
    async fn remove_self_version_path(&self) -> Result<(), SyncerError>;

    /// Write the global version, retrying until it sticks or `ctx` finishes.
    async fn owner_update_global_version(
        &self,
        ctx: &Context,
        version: SchemaVersion,
    ) -> Result<(), SyncerError>;

    /// Hand out the change stream opened by [`SchemaSyncer::init`].
    ///
    /// The stream has a single consumer: `None` before `init` and once it has been taken.
    fn global_version_ch(&self) -> Option<VersionChangeStream>;

    /// Block until every node record present in the store reports `latest_ver`.
    async fn owner_check_all_versions(
        &self,
        ctx: &Context,
        latest_ver: SchemaVersion,
    ) -> Result<(), SyncerError>;

    /// Current global version, `None` if it was never written.
    async fn global_version(&self, ctx: &Context) -> Result<Option<SchemaVersion>, SyncerError>;

    /// `(node id, raw value)` of every node record, ordered by node id.
    async fn all_versions(&self, ctx: &Context) -> Result<Vec<(String, String)>, SyncerError>;

    fn node_id(&self) -> &str;

    fn self_version_key(&self) -> &str;
}

pub struct SchemaVersionSyncer {
    node_id: String,
    self_version_key: String,
    store: Arc<dyn SchemaStore>,
    config: SyncerConfig,
    global_version_ch: Mutex<Option<VersionChangeStream>>,
}

impl std::fmt::Debug for SchemaVersionSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaVersionSyncer")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SchemaVersionSyncer {
    pub fn new(store: Arc<dyn SchemaStore>, node_id: impl Into<String>, config: SyncerConfig) -> Self {
        let node_id = node_id.into();
        Self {
            self_version_key: keys::self_version_key(&node_id),
            node_id,
            store,
            config,
            global_version_ch: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncerConfig {
        &self.config
    }

    fn policy(&self, max_attempts: u64) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            self.config.key_op_timeout(),
            self.config.retry_interval(),
        )
    }

    /// Run one store call bounded by the per-call timeout.
    async fn store_call<T, Fut>(
        &self,
        ctx: &Context,
        op: &'static str,
        key: &str,
        call: Fut,
    ) -> Result<T, SyncerError>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let scope = ctx.with_timeout(self.config.key_op_timeout());
        match scope.run(call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(SyncerError::Store {
                op,
                key: key.to_string(),
                source,
            }),
            // the caller's own context wins over the per-call bound
            Err(_) => match ctx.err() {
                Some(err) => Err(err.into()),
                None => Err(SyncerError::Store {
                    op,
                    key: key.to_string(),
                    source: AttemptTimedOut(self.config.key_op_timeout()).into(),
                }),
            },
        }
    }

    async fn put_with_retry(
        &self,
        ctx: &Context,
        max_attempts: u64,
        key: &str,
        value: &str,
    ) -> Result<(), SyncerError> {
        let store = &self.store;
        self.policy(max_attempts)
            .run(ctx, "put", key, move || store.put(key, value))
            .await
    }

    /// One pass over the node records. `Ok(true)` once everything seen is at the target.
    async fn check_round(
        &self,
        ctx: &Context,
        set: &mut ConvergenceSet,
    ) -> Result<bool, SyncerError> {
        let prefix = format!("{}/", keys::ALL_SCHEMA_VERSIONS);
        let records: Vec<KeyValue> = match self
            .store_call(ctx, "get prefix", &prefix, self.store.get_prefix(&prefix))
            .await
        {
            Ok(records) => records,
            Err(err) => {
                if let Some(reason) = ctx.err() {
                    return Err(reason.into());
                }
                let chain = format!("{:#}", anyhow::Error::new(err));
                tracing::info!(error = %chain, "check all versions failed, retrying");
                return Ok(false);
            }
        };

        match set.check_round(&records) {
            RoundOutcome::Converged => Ok(true),
            RoundOutcome::Behind { key, version } => {
                tracing::info!(
                    %key,
                    current = version,
                    latest = set.target(),
                    "check all versions, node is not synced yet"
                );
                Ok(false)
            }
            RoundOutcome::Malformed { key, value } => {
                tracing::info!(%key, %value, "check all versions, version is not an integer");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl SchemaSyncer for SchemaVersionSyncer {
    #[tracing::instrument(level = "debug", skip_all, fields(node_id = %self.node_id))]
    async fn init(&self, ctx: &Context) -> Result<(), SyncerError> {
        let created = self
            .store_call(
                ctx,
                "create",
                keys::GLOBAL_SCHEMA_VERSION,
                self.store
                    .create_if_absent(keys::GLOBAL_SCHEMA_VERSION, keys::INITIAL_VERSION),
            )
            .await?;
        if created {
            tracing::info!("global schema version initialized");
        }

        let events = self
            .store_call(
                ctx,
                "watch",
                keys::GLOBAL_SCHEMA_VERSION,
                self.store.watch(keys::GLOBAL_SCHEMA_VERSION),
            )
            .await?;
        let stream = VersionChangeStream::new(events, ctx.cancellation_token().clone());
        *self.global_version_ch.lock() = Some(stream);

        self.put_with_retry(
            ctx,
            self.config.bounded_retry_count,
            &self.self_version_key,
            keys::INITIAL_VERSION,
        )
        .await
    }

    async fn update_self_version(
        &self,
        ctx: &Context,
        version: SchemaVersion,
    ) -> Result<(), SyncerError> {
        let value = keys::encode_version(version);
        self.put_with_retry(ctx, 1, &self.self_version_key, &value)
            .await
    }

    async fn remove_self_version_path(&self) -> Result<(), SyncerError> {
        let ctx = Context::background();
        let key = self.self_version_key.as_str();
        let store = &self.store;
        self.policy(self.config.bounded_retry_count)
            .run(&ctx, "delete", key, move || store.delete(key))
            .await?;
        tracing::info!(node_id = %self.node_id, "removed self schema version record");
        Ok(())
    }

    async fn owner_update_global_version(
        &self,
        ctx: &Context,
        version: SchemaVersion,
    ) -> Result<(), SyncerError> {
        let value = keys::encode_version(version);
        self.put_with_retry(ctx, UNLIMITED_ATTEMPTS, keys::GLOBAL_SCHEMA_VERSION, &value)
            .await
    }

    fn global_version_ch(&self) -> Option<VersionChangeStream> {
        self.global_version_ch.lock().take()
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    async fn owner_check_all_versions(
        &self,
        ctx: &Context,
        latest_ver: SchemaVersion,
    ) -> Result<(), SyncerError> {
        ctx.sleep(self.config.check_first_wait()).await?;

        let mut set = ConvergenceSet::new(latest_ver);
        loop {
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }
            if self.check_round(ctx, &mut set).await? {
                tracing::debug!(nodes = set.len(), "all schema versions synced");
                return Ok(());
            }
            ctx.sleep(self.config.check_interval()).await?;
        }
    }

    async fn global_version(&self, ctx: &Context) -> Result<Option<SchemaVersion>, SyncerError> {
        let kv = self
            .store_call(
                ctx,
                "get",
                keys::GLOBAL_SCHEMA_VERSION,
                self.store.get(keys::GLOBAL_SCHEMA_VERSION),
            )
            .await?;
        let Some(kv) = kv else {
            return Ok(None);
        };
        match keys::parse_version(&kv.value) {
            Some(version) => Ok(Some(version)),
            None => Err(SyncerError::MalformedVersion {
                key: kv.key,
                value: String::from_utf8_lossy(&kv.value).into_owned(),
            }),
        }
    }

    async fn all_versions(&self, ctx: &Context) -> Result<Vec<(String, String)>, SyncerError> {
        let prefix = format!("{}/", keys::ALL_SCHEMA_VERSIONS);
        let records = self
            .store_call(ctx, "get prefix", &prefix, self.store.get_prefix(&prefix))
            .await?;
        let mut versions: Vec<(String, String)> = records
            .iter()
            .filter_map(|kv| {
                let node_id = keys::node_id_from_key(&kv.key)?;
                Some((
                    node_id.to_string(),
                    String::from_utf8_lossy(&kv.value).into_owned(),
                ))
            })
            .collect();
        versions.sort();
        Ok(versions)
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn self_version_key(&self) -> &str {
        &self.self_version_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;
    use crate::store::{MemoryStore, StoreOp};
    use std::time::Duration;

    fn syncer(store: &MemoryStore, node_id: &str) -> SchemaVersionSyncer {
        SchemaVersionSyncer::new(Arc::new(store.clone()), node_id, SyncerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_version_ch_before_init_is_none() {
        let store = MemoryStore::new();
        let s = syncer(&store, "a");
        assert!(s.global_version_ch().is_none());
        s.init(&Context::background()).await.unwrap();
        assert!(s.global_version_ch().is_some());
        // single consumer
        assert!(s.global_version_ch().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_does_not_overwrite_global_version() {
        let store = MemoryStore::new();
        store.set_raw(keys::GLOBAL_SCHEMA_VERSION, "9");
        syncer(&store, "a").init(&Context::background()).await.unwrap();
        assert_eq!(store.value(keys::GLOBAL_SCHEMA_VERSION).as_deref(), Some("9"));
        assert_eq!(
            store.value(&keys::self_version_key("a")).as_deref(),
            Some("0")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_create_failure_is_wrapped() {
        let store = MemoryStore::new();
        store.fail_next(StoreOp::CreateIfAbsent, 1, "etcdserver: leader changed");
        let err = syncer(&store, "a")
            .init(&Context::background())
            .await
            .unwrap_err();
        match err {
            SyncerError::Store { op, key, source } => {
                assert_eq!(op, "create");
                assert_eq!(key, keys::GLOBAL_SCHEMA_VERSION);
                assert_eq!(source.to_string(), "etcdserver: leader changed #1");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_self_version_is_single_attempt() {
        let store = MemoryStore::new();
        let s = syncer(&store, "a");
        store.fail_next(StoreOp::Put, 1, "boom");
        let err = s
            .update_self_version(&Context::background(), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncerError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(store.calls(StoreOp::Put), 1);

        s.update_self_version(&Context::background(), 4).await.unwrap();
        assert_eq!(store.value(s.self_version_key()).as_deref(), Some("4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_is_a_store_failure() {
        let store = MemoryStore::new();
        let s = syncer(&store, "a");
        store.set_latency(StoreOp::Put, Duration::from_secs(3));
        let err = s
            .update_self_version(&Context::background(), 4)
            .await
            .unwrap_err();
        assert!(!err.is_context_finished());
        assert!(matches!(err, SyncerError::RetriesExhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_write_is_reported_as_cancellation() {
        let store = MemoryStore::new();
        let s = syncer(&store, "a");
        store.set_latency(StoreOp::Put, Duration::from_millis(500));
        let ctx = Context::background();
        let canceller = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ctx.cancel();
            })
        };
        let err = s.update_self_version(&ctx, 4).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, SyncerError::Context(ContextError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_read_is_a_store_failure() {
        let store = MemoryStore::new();
        let s = syncer(&store, "a");
        store.set_latency(StoreOp::Get, Duration::from_secs(3));
        let err = s.global_version(&Context::background()).await.unwrap_err();
        assert!(!err.is_context_finished());
        let source = match &err {
            SyncerError::Store { source, .. } => source,
            other => panic!("unexpected error: {other:?}"),
        };
        assert!(source.downcast_ref::<AttemptTimedOut>().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_retries_within_budget() {
        let store = MemoryStore::new();
        let s = syncer(&store, "a");
        s.init(&Context::background()).await.unwrap();
        store.fail_next(StoreOp::Delete, 2, "unavailable");
        s.remove_self_version_path().await.unwrap();
        assert_eq!(store.calls(StoreOp::Delete), 3);
        assert!(store.value(s.self_version_key()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_write_only_stops_on_context() {
        let store = MemoryStore::new();
        let s = syncer(&store, "owner");
        store.fail_next(StoreOp::Put, 1000, "unavailable");
        let parent = Context::background();
        let ctx = parent.with_timeout(Duration::from_millis(500));
        let err = s.owner_update_global_version(&ctx, 3).await.unwrap_err();
        assert!(matches!(
            err,
            SyncerError::Context(ContextError::DeadlineExceeded)
        ));
        assert!(store.calls(StoreOp::Put) > 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_helpers() {
        let store = MemoryStore::new();
        let s = syncer(&store, "b");
        let ctx = Context::background();
        assert_eq!(s.global_version(&ctx).await.unwrap(), None);

        s.init(&ctx).await.unwrap();
        syncer(&store, "a").init(&ctx).await.unwrap();
        store.set_raw(&format!("{}-other", keys::ALL_SCHEMA_VERSIONS), "1");
        s.owner_update_global_version(&ctx, 2).await.unwrap();

        assert_eq!(s.global_version(&ctx).await.unwrap(), Some(2));
        assert_eq!(
            s.all_versions(&ctx).await.unwrap(),
            vec![
                ("a".to_string(), "0".to_string()),
                ("b".to_string(), "0".to_string()),
            ]
        );

        store.set_raw(keys::GLOBAL_SCHEMA_VERSION, "two");
        assert!(matches!(
            s.global_version(&ctx).await,
            Err(SyncerError::MalformedVersion { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_scan_is_retried_not_fatal() {
        let store = MemoryStore::new();
        let s = syncer(&store, "a");
        let ctx = Context::background();
        s.init(&ctx).await.unwrap();
        s.update_self_version(&ctx, 1).await.unwrap();

        store.set_latency(StoreOp::GetPrefix, Duration::from_secs(3));
        let clear = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                store.clear_faults();
            })
        };
        s.owner_check_all_versions(&ctx, 1).await.unwrap();
        clear.await.unwrap();
        assert!(store.calls(StoreOp::GetPrefix) >= 2);
    }
}
