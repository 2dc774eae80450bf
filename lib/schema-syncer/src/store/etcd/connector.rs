// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared etcd client with background refresh.
//!
//! Store calls never wait for a reconnect. A call that sees a broken channel asks for a
//! refresh and fails right away; the refresh runs on its own task and swaps the client in
//! place, so a later retry attempt picks up the new channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use etcd_client::{Client, ConnectOptions};
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::config::EtcdConfig;
use crate::{ErrorContext, Result, raise};

pub struct Connector {
    client: RwLock<Client>,
    config: EtcdConfig,
    refreshing: AtomicBool,
    /// Bumped every time a refreshed client is swapped in.
    generation: AtomicU64,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("endpoints", &self.config.endpoints)
            .field("generation", &self.generation())
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}

impl Connector {
    pub async fn connect(config: &EtcdConfig) -> Result<Arc<Self>> {
        let client = open_client(config).await?;
        Ok(Arc::new(Self {
            client: RwLock::new(client),
            config: config.clone(),
            refreshing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }))
    }

    /// Current client. Clones share the underlying channel.
    pub fn client(&self) -> Client {
        self.client.read().clone()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.config.endpoints
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Replace the client on a background task unless a refresh is already running.
    /// Returns `true` if this call started one.
    pub fn spawn_refresh(self: &Arc<Self>) -> bool {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let _running = RefreshFlag(&this.refreshing);
            if let Err(e) = this.refresh().await {
                tracing::error!(endpoints = ?this.config.endpoints, error = %e, "etcd client refresh gave up");
            }
        });
        true
    }

    async fn refresh(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.reconnect_timeout();
        let mut delays = backoff(
            self.config.reconnect_initial_backoff(),
            self.config.reconnect_max_backoff(),
        );
        let mut tries = 0u32;

        loop {
            tries += 1;
            match open_client(&self.config).await {
                Ok(client) => {
                    *self.client.write() = client;
                    let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    tracing::info!(tries, generation, "etcd client refreshed");
                    return Ok(());
                }
                Err(e) => {
                    let delay = delays.next().unwrap_or_default();
                    if Instant::now() + delay >= deadline {
                        raise!("no etcd endpoint reachable after {tries} tries: {e:#}");
                    }
                    tracing::debug!(tries, ?delay, error = %e, "etcd client refresh failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Clears the refresh flag however the refresh task ends.
struct RefreshFlag<'a>(&'a AtomicBool);

impl Drop for RefreshFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn connect_options(config: &EtcdConfig) -> ConnectOptions {
    let options = ConnectOptions::new().with_connect_timeout(config.connect_timeout());
    match (&config.username, &config.password) {
        (Some(user), Some(password)) => options.with_user(user.clone(), password.clone()),
        _ => options,
    }
}

async fn open_client(config: &EtcdConfig) -> Result<Client> {
    Client::connect(config.endpoints.clone(), Some(connect_options(config)))
        .await
        .with_context(|| format!("connecting to etcd at {}", config.endpoints.join(", ")))
}

/// Doubling delays starting at `initial`, capped at `max`.
fn backoff(initial: Duration, max: Duration) -> impl Iterator<Item = Duration> {
    std::iter::successors(Some(initial.min(max)), move |d| Some((*d * 2).min(max)))
}
