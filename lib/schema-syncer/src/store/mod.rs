// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Coordination store abstraction.
//!
//! The syncer only needs a handful of primitives from a linearizable key-value store:
//! a create-if-absent transaction, point and prefix reads, put, delete and a watch on a
//! single key. [`EtcdStore`] is the production backend; [`MemoryStore`] keeps the same
//! semantics in-process for tests and local tooling.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::Result;

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::{MemoryStore, StoreOp};

/// A key and its current value as seen by a read or a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Store revision of the last modification of this key.
    pub mod_revision: i64,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, mod_revision: i64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            mod_revision,
        }
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete(String),
}

/// Ordered change events for one key. Ends when the underlying subscription is closed.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>;

#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Atomically write `value` only if `key` has never been created.
    /// Returns `true` if this call created the key.
    async fn create_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Subscribe to changes of exactly `key`, starting after the current revision.
    async fn watch(&self, key: &str) -> Result<WatchStream>;
}
