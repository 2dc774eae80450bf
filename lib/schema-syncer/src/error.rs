// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Errors returned by the schema syncer.
//!
//! Store backends report failures as [`anyhow::Error`]; the syncer wraps them with the
//! operation and key that failed. Cancellation is kept as its own variant so callers can
//! tell "give up now" apart from "the store had a bad moment".

use std::time::Duration;

use crate::context::ContextError;

/// One store call ran past its own bound while the caller's context was still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("did not finish within {0:?}")]
pub struct AttemptTimedOut(pub Duration);

#[derive(Debug, thiserror::Error)]
pub enum SyncerError {
    /// The caller's context was cancelled or ran past its deadline.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// A single store operation failed.
    #[error("{op} `{key}` failed")]
    Store {
        op: &'static str,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Every attempt of a retried write failed; `source` is the last failure.
    #[error("{op} `{key}` failed after {attempts} attempt(s)")]
    RetriesExhausted {
        op: &'static str,
        key: String,
        attempts: u64,
        #[source]
        source: anyhow::Error,
    },

    /// A stored version is not a decimal integer.
    #[error("value {value:?} under `{key}` is not a schema version")]
    MalformedVersion { key: String, value: String },
}

impl SyncerError {
    /// True when the error means the caller's context is finished and retrying is pointless.
    pub fn is_context_finished(&self) -> bool {
        match self {
            SyncerError::Context(_) => true,
            SyncerError::Store { source, .. } | SyncerError::RetriesExhausted { source, .. } => {
                is_context_finished(source)
            }
            SyncerError::MalformedVersion { .. } => false,
        }
    }
}

/// Walk an error chain looking for a [`ContextError`].
pub fn is_context_finished(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ContextError>().is_some())
}
