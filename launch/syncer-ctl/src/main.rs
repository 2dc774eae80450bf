// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use schema_syncer::keys::{self, SchemaVersion};
use schema_syncer::store::EtcdStore;
use schema_syncer::{
    CancellationToken, Config, Context, ErrorContext, Result, SchemaSyncer, SchemaVersionSyncer,
    logging, raise,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// etcd endpoints, overrides the configured ones
    #[arg(long, value_delimiter = ',', env = "SCHEMA_SYNCER_CTL_ENDPOINTS")]
    endpoints: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the global version and the version reported by every node
    Status {
        /// Print one JSON document instead of a table
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Wait until every node reports `version`
    Wait {
        #[arg(long)]
        version: SchemaVersion,

        /// Give up after this many milliseconds
        #[arg(long, default_value = "60000")]
        timeout_ms: u64,
    },

    /// Delete the version record of a node that is gone for good
    Remove {
        #[arg(long)]
        node_id: String,
    },
}

#[derive(Debug, Serialize)]
struct NodeStatus {
    node_id: String,
    value: String,
    state: NodeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum NodeState {
    Synced,
    Behind,
    Ahead,
    Malformed,
}

#[derive(Debug, Serialize)]
struct Status {
    global_version: Option<SchemaVersion>,
    nodes: Vec<NodeStatus>,
}

fn node_state(global: Option<SchemaVersion>, value: &str) -> NodeState {
    match (keys::parse_version(value.as_bytes()), global) {
        (None, _) => NodeState::Malformed,
        (Some(v), Some(g)) if v < g => NodeState::Behind,
        (Some(v), Some(g)) if v > g => NodeState::Ahead,
        _ => NodeState::Synced,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if !args.endpoints.is_empty() {
        config.etcd.endpoints = args.endpoints.clone();
    }

    let store = EtcdStore::connect(&config.etcd)
        .await
        .with_context(|| format!("connecting to {:?}", config.etcd.endpoints))?;
    let store = Arc::new(store);

    let shutdown = CancellationToken::new();
    let ctx = Context::with_token(shutdown.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    match args.command {
        Command::Status { json } => {
            let syncer = SchemaVersionSyncer::new(store, "syncer-ctl", config.syncer);
            let status = status(&syncer, &ctx).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Command::Wait {
            version,
            timeout_ms,
        } => {
            let syncer = SchemaVersionSyncer::new(store, "syncer-ctl", config.syncer);
            let scope = ctx.with_timeout(Duration::from_millis(timeout_ms));
            match syncer.owner_check_all_versions(&scope, version).await {
                Ok(()) => println!("all nodes at version {version}"),
                Err(e) if e.is_context_finished() => {
                    raise!("nodes did not reach version {version} within {timeout_ms}ms: {e}")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Remove { node_id } => {
            let syncer = SchemaVersionSyncer::new(store, node_id, config.syncer);
            syncer.remove_self_version_path().await?;
            println!("removed {}", syncer.self_version_key());
        }
    }

    Ok(())
}

async fn status(syncer: &SchemaVersionSyncer, ctx: &Context) -> Result<Status> {
    let global_version = syncer.global_version(ctx).await?;
    let nodes = syncer
        .all_versions(ctx)
        .await?
        .into_iter()
        .map(|(node_id, value)| NodeStatus {
            state: node_state(global_version, &value),
            node_id,
            value,
        })
        .collect();
    Ok(Status {
        global_version,
        nodes,
    })
}

fn print_status(status: &Status) {
    match status.global_version {
        Some(v) => println!("global version: {v}"),
        None => println!("global version: <unset>"),
    }
    if status.nodes.is_empty() {
        println!("no nodes registered");
        return;
    }
    let width = status
        .nodes
        .iter()
        .map(|n| n.node_id.len())
        .max()
        .unwrap_or(0);
    for node in &status.nodes {
        let flag = match node.state {
            NodeState::Synced => "",
            NodeState::Behind => "  (behind)",
            NodeState::Ahead => "  (ahead)",
            NodeState::Malformed => "  (malformed)",
        };
        println!("{:<width$}  {}{}", node.node_id, node.value, flag);
    }
}
