// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process [`SchemaStore`] with fault injection.
//!
//! Every operation takes a single lock, so the store is linearizable. Clones share state,
//! which lets several syncers in one test act as different nodes of the same cluster.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{KeyValue, SchemaStore, WatchEvent, WatchStream};
use crate::{Result, error};

/// Store operations that can be counted and sabotaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    CreateIfAbsent,
    Put,
    Delete,
    Get,
    GetPrefix,
    Watch,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    mod_revision: i64,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Entry>,
    revision: i64,
    watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
    failures: HashMap<StoreOp, VecDeque<String>>,
    latency: HashMap<StoreOp, Duration>,
    calls: HashMap<StoreOp, usize>,
}

impl Inner {
    fn notify(&mut self, key: &str, event: WatchEvent) {
        self.watchers
            .retain(|(watched, tx)| watched != key || tx.send(event.clone()).is_ok());
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryStore")
            .field("keys", &inner.data.len())
            .field("revision", &inner.revision)
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls of `op` with `message`, numbered from 1.
    pub fn fail_next(&self, op: StoreOp, count: usize, message: &str) {
        let mut inner = self.inner.lock();
        let queue = inner.failures.entry(op).or_default();
        for i in 1..=count {
            queue.push_back(format!("{message} #{i}"));
        }
    }

    /// Delay every call of `op` by `latency` before it touches the data.
    pub fn set_latency(&self, op: StoreOp, latency: Duration) {
        self.inner.lock().latency.insert(op, latency);
    }

    pub fn clear_faults(&self) {
        let mut inner = self.inner.lock();
        inner.failures.clear();
        inner.latency.clear();
    }

    /// Number of times `op` has been invoked, including failed calls.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.inner.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Raw value of `key`, bypassing fault injection.
    pub fn value(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .data
            .get(key)
            .map(|e| String::from_utf8_lossy(&e.value).into_owned())
    }

    /// Write directly, bypassing fault injection. Watchers are notified.
    pub fn set_raw(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock();
        Self::write(&mut inner, key, value.as_bytes().to_vec());
    }

    /// Remove directly, bypassing fault injection. Watchers are notified.
    pub fn remove_raw(&self, key: &str) {
        let mut inner = self.inner.lock();
        Self::remove(&mut inner, key);
    }

    async fn enter(&self, op: StoreOp) -> Result<()> {
        let (latency, failure) = {
            let mut inner = self.inner.lock();
            *inner.calls.entry(op).or_default() += 1;
            let failure = inner.failures.get_mut(&op).and_then(|q| q.pop_front());
            (inner.latency.get(&op).copied(), failure)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(message) => Err(error!(message)),
            None => Ok(()),
        }
    }

    fn write(inner: &mut Inner, key: &str, value: Vec<u8>) {
        inner.revision += 1;
        let mod_revision = inner.revision;
        inner.data.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                mod_revision,
            },
        );
        inner.notify(key, WatchEvent::Put(KeyValue::new(key, value, mod_revision)));
    }

    fn remove(inner: &mut Inner, key: &str) {
        if inner.data.remove(key).is_some() {
            inner.revision += 1;
            inner.notify(key, WatchEvent::Delete(key.to_string()));
        }
    }
}

#[async_trait]
impl SchemaStore for MemoryStore {
    async fn create_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        self.enter(StoreOp::CreateIfAbsent).await?;
        let mut inner = self.inner.lock();
        if inner.data.contains_key(key) {
            return Ok(false);
        }
        Self::write(&mut inner, key, value.as_bytes().to_vec());
        Ok(true)
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.enter(StoreOp::Put).await?;
        let mut inner = self.inner.lock();
        Self::write(&mut inner, key, value.as_bytes().to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.enter(StoreOp::Delete).await?;
        let mut inner = self.inner.lock();
        Self::remove(&mut inner, key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.enter(StoreOp::Get).await?;
        let inner = self.inner.lock();
        Ok(inner
            .data
            .get(key)
            .map(|e| KeyValue::new(key, e.value.clone(), e.mod_revision)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.enter(StoreOp::GetPrefix).await?;
        let inner = self.inner.lock();
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue::new(k.clone(), e.value.clone(), e.mod_revision))
            .collect())
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        self.enter(StoreOp::Watch).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.lock().watchers.push((key.to_string(), tx));

        let stream = async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield Ok(event);
            }
        };
        Ok(Box::pin(stream))
    }
}
