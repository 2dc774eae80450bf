// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Schema version synchronization for distributed DDL.
//!
//! The DDL owner publishes every new schema version to a global key in etcd and then
//! waits until each node has advertised the same version under its own key. Followers
//! watch the global key, apply the change locally and report back.
//!
//! ```rust,ignore
//! use schema_syncer::{Context, SchemaSyncer, SchemaVersionSyncer, SyncerConfig};
//!
//! let syncer = SchemaVersionSyncer::new(store, "node-1", SyncerConfig::default());
//! let ctx = Context::background();
//! syncer.init(&ctx).await?;
//!
//! // owner side
//! syncer.owner_update_global_version(&ctx, 5).await?;
//! syncer.owner_check_all_versions(&ctx, 5).await?;
//! ```

pub use anyhow::{Context as ErrorContext, Error, Result, anyhow as error, bail as raise};
pub use tokio_util::sync::CancellationToken;

pub mod config;
pub mod context;
pub mod convergence;
pub mod error;
pub mod keys;
pub mod logging;
pub mod notifier;
pub mod retry;
pub mod store;
pub mod syncer;

pub use config::{Config, ConfigError, EtcdConfig, SyncerConfig};
pub use context::{Context, ContextError, ScopedContext};
pub use error::{AttemptTimedOut, SyncerError};
pub use keys::SchemaVersion;
pub use notifier::{VersionChange, VersionChangeStream};
pub use store::{KeyValue, SchemaStore, WatchEvent, WatchStream};
pub use syncer::{SchemaSyncer, SchemaVersionSyncer};
