// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the schema syncer and its etcd connection.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/etc/schema-syncer/syncer.toml`
//! 3. TOML file from the `SCHEMA_SYNCER_CONFIG_PATH` environment variable
//! 4. Environment variables: `SCHEMA_SYNCER_ETCD_*` map to `etcd.*`, any other
//!    `SCHEMA_SYNCER_*` maps to `syncer.*`
//!
//! ```toml
//! [syncer]
//! check_interval_ms = 50
//!
//! [etcd]
//! endpoints = ["http://etcd-0:2379", "http://etcd-1:2379"]
//! ```

use std::time::Duration;

use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

const CONFIG_PATH_ENV: &str = "SCHEMA_SYNCER_CONFIG_PATH";
const SYSTEM_CONFIG_PATH: &str = "/etc/schema-syncer/syncer.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Timing and retry budget of the version synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SyncerConfig {
    /// Upper bound for a single store call inside a retried write.
    #[validate(range(min = 1))]
    pub key_op_timeout_ms: u64,

    /// Pause between two attempts of a retried write.
    pub retry_interval_ms: u64,

    /// Wait before the first convergence scan, giving followers time to react.
    pub check_first_wait_ms: u64,

    /// Pause between two convergence scans.
    pub check_interval_ms: u64,

    /// Attempts used by bootstrap and removal of the self version record.
    #[validate(range(min = 1, max = 100))]
    pub bounded_retry_count: u64,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            key_op_timeout_ms: 2000,
            retry_interval_ms: 30,
            check_first_wait_ms: 50,
            check_interval_ms: 20,
            bounded_retry_count: 3,
        }
    }
}

impl SyncerConfig {
    pub fn key_op_timeout(&self) -> Duration {
        Duration::from_millis(self.key_op_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn check_first_wait(&self) -> Duration {
        Duration::from_millis(self.check_first_wait_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// etcd connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EtcdConfig {
    #[validate(length(min = 1))]
    pub endpoints: Vec<String>,

    pub connect_timeout_ms: u64,

    /// Budget for refreshing the client after a transport error.
    pub reconnect_timeout_ms: u64,

    /// First pause between two refresh tries; doubles up to `reconnect_max_backoff_ms`.
    pub reconnect_initial_backoff_ms: u64,

    pub reconnect_max_backoff_ms: u64,

    pub username: Option<String>,

    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            connect_timeout_ms: 5000,
            reconnect_timeout_ms: 10_000,
            reconnect_initial_backoff_ms: 100,
            reconnect_max_backoff_ms: 2000,
            username: None,
            password: None,
        }
    }
}

impl EtcdConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn reconnect_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_backoff_ms)
    }

    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_backoff_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    #[serde(default)]
    pub syncer: SyncerConfig,

    #[validate(nested)]
    #[serde(default)]
    pub etcd: EtcdConfig,
}

impl Config {
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // SCHEMA_SYNCER_ETCD_ENDPOINTS, SCHEMA_SYNCER_ETCD_CONNECT_TIMEOUT_MS, ...
            .merge(
                Env::prefixed("SCHEMA_SYNCER_ETCD_")
                    .map(|k| format!("etcd.{}", k.as_str().to_lowercase()).into()),
            )
            // SCHEMA_SYNCER_CHECK_INTERVAL_MS, ...
            .merge(
                Env::prefixed("SCHEMA_SYNCER_")
                    .ignore(&[
                        "CONFIG_PATH",
                        "LOG",
                        "LOGGING_CONFIG_PATH",
                        "LOGGING_JSONL",
                        "LOGGING_DISABLE_ANSI",
                    ])
                    .filter(|k| !k.as_str().to_lowercase().starts_with("etcd_"))
                    .map(|k| format!("syncer.{}", k.as_str().to_lowercase()).into()),
            )
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    ///
    /// ```rust,ignore
    /// let config = Config::extract_from(
    ///     Config::figment().merge(("syncer.check_interval_ms", 5u64)),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }
}
