// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! What an etcd failure means for the next attempt.
//!
//! Raft-level conditions clear up on their own, so the next attempt reuses the client. A
//! transport failure means the channel is bad and the client has to be replaced.

use std::fmt;

/// Conditions reported by the etcd server while the cluster is electing or overloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCondition {
    LeaderChanged,
    NoLeader,
    RequestTimedOut,
    TooManyRequests,
}

impl fmt::Display for ServerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LeaderChanged => "leader changed",
            Self::NoLeader => "no leader",
            Self::RequestTimedOut => "request timed out",
            Self::TooManyRequests => "too many requests",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtcdErrorClass {
    /// Retry on the same client.
    Server(ServerCondition),
    /// Refresh the client before it is useful again.
    Transport,
    /// Retrying will not help: auth, permissions, bad requests.
    Fatal,
}

impl EtcdErrorClass {
    pub fn needs_refresh(&self) -> bool {
        matches!(self, EtcdErrorClass::Transport)
    }
}

const SERVER_CONDITIONS: &[(&str, ServerCondition)] = &[
    ("etcdserver: leader changed", ServerCondition::LeaderChanged),
    ("etcdserver: no leader", ServerCondition::NoLeader),
    // also matches "..., possibly due to previous leader failure" and "..., possibly due to connection lost"
    ("etcdserver: request timed out", ServerCondition::RequestTimedOut),
    ("etcdserver: too many requests", ServerCondition::TooManyRequests),
];

const TRANSPORT_MARKERS: &[&str] = &[
    "transport error",
    "error trying to connect",
    "connection refused",
    "broken pipe",
    "h2 protocol error",
    "etcdserver: server stopped",
];

pub fn classify_message(message: &str) -> EtcdErrorClass {
    let message = message.to_lowercase();
    if let Some((_, condition)) = SERVER_CONDITIONS
        .iter()
        .find(|(marker, _)| message.contains(marker))
    {
        return EtcdErrorClass::Server(*condition);
    }
    if TRANSPORT_MARKERS.iter().any(|m| message.contains(m)) {
        return EtcdErrorClass::Transport;
    }
    EtcdErrorClass::Fatal
}

pub fn classify_error(err: &etcd_client::Error) -> EtcdErrorClass {
    match err {
        etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_) => {
            EtcdErrorClass::Transport
        }
        etcd_client::Error::GRpcStatus(status) => classify_message(status.message()),
        other => classify_message(&other.to_string()),
    }
}
