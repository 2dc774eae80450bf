// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! etcd-backed [`SchemaStore`].

mod connector;
mod error;

pub use connector::Connector;
pub use error::{EtcdErrorClass, ServerCondition, classify_error, classify_message};

use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{Compare, CompareOp, EventType, GetOptions, Txn, TxnOp};

use super::{KeyValue, SchemaStore, WatchEvent, WatchStream};
use crate::config::EtcdConfig;
use crate::{ErrorContext, Result};

#[derive(Clone)]
pub struct EtcdStore {
    connector: Arc<Connector>,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("endpoints", &self.connector.endpoints())
            .finish()
    }
}

impl EtcdStore {
    pub fn new(connector: Arc<Connector>) -> Self {
        Self { connector }
    }

    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        Ok(Self::new(Connector::connect(config).await?))
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Wrap an etcd failure for the caller. A transport failure also starts a background
    /// client refresh; the call itself never waits for it.
    fn on_error(&self, op: &str, key: &str, err: etcd_client::Error) -> crate::Error {
        report(&self.connector, op, key, &err);
        crate::Error::new(err).context(format!("etcd {op} `{key}`"))
    }

    fn to_key_value(kv: &etcd_client::KeyValue) -> Result<KeyValue> {
        let key = kv.key_str().context("etcd key is not valid utf-8")?;
        Ok(KeyValue::new(key, kv.value().to_vec(), kv.mod_revision()))
    }
}

#[async_trait]
impl SchemaStore for EtcdStore {
    async fn create_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        match self.connector.client().txn(txn).await {
            Ok(resp) => Ok(resp.succeeded()),
            Err(e) => Err(self.on_error("txn", key, e)),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        match self.connector.client().put(key, value, None).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.on_error("put", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.connector.client().delete(key, None).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.on_error("delete", key, e)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let resp = match self.connector.client().get(key, None).await {
            Ok(resp) => resp,
            Err(e) => return Err(self.on_error("get", key, e)),
        };
        resp.kvs().first().map(Self::to_key_value).transpose()
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let options = GetOptions::new().with_prefix();
        let resp = match self.connector.client().get(prefix, Some(options)).await {
            Ok(resp) => resp,
            Err(e) => return Err(self.on_error("get prefix", prefix, e)),
        };
        resp.kvs().iter().map(Self::to_key_value).collect()
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        let (watcher, mut stream) = match self.connector.client().watch(key, None).await {
            Ok(pair) => pair,
            Err(e) => return Err(self.on_error("watch", key, e)),
        };
        let watched = key.to_string();
        let connector = self.connector.clone();

        let events = async_stream::stream! {
            // the watch is cancelled server-side once the watcher is dropped
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(e) => {
                        report(&connector, "watch", &watched, &e);
                        yield Err(crate::Error::new(e).context(format!("etcd watch `{watched}`")));
                        break;
                    }
                };
                if resp.canceled() {
                    tracing::warn!(key = %watched, reason = resp.cancel_reason(), "etcd watch cancelled");
                    break;
                }
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    match event.event_type() {
                        EventType::Put => {
                            let item = Self::to_key_value(kv).map(WatchEvent::Put);
                            yield item;
                        }
                        EventType::Delete => {
                            yield Ok(WatchEvent::Delete(String::from_utf8_lossy(kv.key()).into_owned()));
                        }
                    }
                }
            }
            tracing::debug!(key = %watched, "etcd watch stream ended");
        };
        Ok(Box::pin(events))
    }
}

fn report(connector: &Arc<Connector>, op: &str, key: &str, err: &etcd_client::Error) {
    let class = classify_error(err);
    if class.needs_refresh() {
        if connector.spawn_refresh() {
            tracing::warn!(op, key, error = %err, "etcd transport failed, refreshing client");
        }
    } else if let EtcdErrorClass::Server(condition) = class {
        tracing::debug!(op, key, %condition, "etcd server busy");
    }
}
