// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream of global schema version changes handed to followers.
//!
//! The store's watch events are adapted into [`VersionChange`]s so callers never see a
//! backend-specific watch type. The stream is lazy, unbounded and single-use: once it ends
//! (the subscription is closed or the context it was opened under is cancelled) a new one
//! has to be opened.

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::keys::{self, SchemaVersion};
use crate::store::{WatchEvent, WatchStream};
use crate::{Result, error};

/// The global schema version moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionChange {
    pub version: SchemaVersion,
    /// Store revision at which the new version was written.
    pub revision: i64,
}

pub struct VersionChangeStream {
    inner: Pin<Box<dyn Stream<Item = Result<VersionChange>> + Send>>,
}

impl std::fmt::Debug for VersionChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionChangeStream").finish_non_exhaustive()
    }
}

impl VersionChangeStream {
    /// Adapt raw watch events on the global version key. The stream ends when `cancel` fires.
    pub fn new(events: WatchStream, cancel: CancellationToken) -> Self {
        let stream = async_stream::stream! {
            let mut events = events;
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.next() => event,
                };
                match event {
                    Some(Ok(WatchEvent::Put(kv))) => {
                        match keys::parse_version(&kv.value) {
                            Some(version) => {
                                yield Ok(VersionChange { version, revision: kv.mod_revision });
                            }
                            None => {
                                yield Err(error!(
                                    "global schema version {:?} at revision {} is not an integer",
                                    String::from_utf8_lossy(&kv.value),
                                    kv.mod_revision
                                ));
                            }
                        }
                    }
                    Some(Ok(WatchEvent::Delete(key))) => {
                        tracing::warn!(%key, "global schema version key was deleted");
                    }
                    Some(Err(e)) => {
                        yield Err(e.context("global schema version watch failed"));
                    }
                    None => break,
                }
            }
        };
        Self {
            inner: Box::pin(stream),
        }
    }
}

impl Stream for VersionChangeStream {
    type Item = Result<VersionChange>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyValue;

    fn put(value: &str, revision: i64) -> Result<WatchEvent> {
        Ok(WatchEvent::Put(KeyValue::new(
            keys::GLOBAL_SCHEMA_VERSION,
            value,
            revision,
        )))
    }

    #[tokio::test]
    async fn test_adapts_puts_and_skips_deletes() {
        let events: WatchStream = Box::pin(futures::stream::iter(vec![
            put("3", 10),
            Ok(WatchEvent::Delete(keys::GLOBAL_SCHEMA_VERSION.to_string())),
            put("4", 12),
        ]));
        let changes: Vec<_> = VersionChangeStream::new(events, CancellationToken::new())
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(
            changes,
            vec![
                VersionChange {
                    version: 3,
                    revision: 10
                },
                VersionChange {
                    version: 4,
                    revision: 12
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_value_is_reported_and_stream_continues() {
        let events: WatchStream = Box::pin(futures::stream::iter(vec![put("x", 1), put("2", 2)]));
        let mut changes = VersionChangeStream::new(events, CancellationToken::new());
        assert!(changes.next().await.unwrap().is_err());
        assert_eq!(changes.next().await.unwrap().unwrap().version, 2);
        assert!(changes.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let events: WatchStream = Box::pin(futures::stream::pending());
        let cancel = CancellationToken::new();
        let mut changes = VersionChangeStream::new(events, cancel.clone());
        cancel.cancel();
        assert!(changes.next().await.is_none());
    }
}
