// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-call bookkeeping for the owner's convergence barrier.

use std::collections::HashSet;

use crate::keys::{self, SchemaVersion};
use crate::store::KeyValue;

/// Outcome of comparing one scan against the target version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every record seen in this scan is at the target version.
    Converged,
    /// `key` holds a different version; the rest of the scan was not inspected.
    Behind { key: String, version: SchemaVersion },
    /// `key` holds something that is not a version; the rest of the scan was not inspected.
    Malformed { key: String, value: String },
}

/// Keys already confirmed at the target version during one wait.
///
/// Entries are never removed. This relies on a node never moving its record away from the
/// target version while the owner is still waiting on that version, so a confirmed key can
/// be skipped in every later scan of the same wait.
#[derive(Debug)]
pub struct ConvergenceSet {
    target: SchemaVersion,
    confirmed: HashSet<String>,
}

impl ConvergenceSet {
    pub fn new(target: SchemaVersion) -> Self {
        Self {
            target,
            confirmed: HashSet::new(),
        }
    }

    pub fn target(&self) -> SchemaVersion {
        self.target
    }

    pub fn contains(&self, key: &str) -> bool {
        self.confirmed.contains(key)
    }

    pub fn len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty()
    }

    /// Compare one scan, remembering every newly confirmed key and stopping at the first
    /// record that is not at the target.
    pub fn check_round(&mut self, records: &[KeyValue]) -> RoundOutcome {
        for kv in records {
            if self.confirmed.contains(&kv.key) {
                continue;
            }
            match keys::parse_version(&kv.value) {
                None => {
                    return RoundOutcome::Malformed {
                        key: kv.key.clone(),
                        value: String::from_utf8_lossy(&kv.value).into_owned(),
                    };
                }
                Some(version) if version != self.target => {
                    return RoundOutcome::Behind {
                        key: kv.key.clone(),
                        version,
                    };
                }
                Some(_) => {
                    self.confirmed.insert(kv.key.clone());
                }
            }
        }
        RoundOutcome::Converged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(node: &str, value: &str) -> KeyValue {
        KeyValue::new(keys::self_version_key(node), value, 1)
    }

    #[test]
    fn test_empty_scan_converges() {
        let mut set = ConvergenceSet::new(5);
        assert_eq!(set.check_round(&[]), RoundOutcome::Converged);
        assert!(set.is_empty());
    }

    #[test]
    fn test_stops_at_first_lagging_record() {
        let mut set = ConvergenceSet::new(5);
        let scan = [record("a", "5"), record("b", "4"), record("c", "5")];

        assert_eq!(
            set.check_round(&scan),
            RoundOutcome::Behind {
                key: keys::self_version_key("b"),
                version: 4
            }
        );
        // `c` was never looked at
        assert!(set.contains(&keys::self_version_key("a")));
        assert!(!set.contains(&keys::self_version_key("c")));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_malformed_value_is_not_converged() {
        let mut set = ConvergenceSet::new(5);
        assert_eq!(
            set.check_round(&[record("a", "abc")]),
            RoundOutcome::Malformed {
                key: keys::self_version_key("a"),
                value: "abc".to_string()
            }
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_confirmed_records_are_not_rechecked() {
        let mut set = ConvergenceSet::new(5);
        assert!(matches!(
            set.check_round(&[record("a", "5"), record("b", "4")]),
            RoundOutcome::Behind { .. }
        ));

        // a record already confirmed is skipped even if a later scan shows otherwise
        let outcome = set.check_round(&[record("a", "3"), record("b", "5")]);
        assert_eq!(outcome, RoundOutcome::Converged);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_removed_node_no_longer_blocks() {
        let mut set = ConvergenceSet::new(5);
        assert!(matches!(
            set.check_round(&[record("a", "5"), record("b", "4")]),
            RoundOutcome::Behind { .. }
        ));
        assert_eq!(set.check_round(&[record("a", "5")]), RoundOutcome::Converged);
    }

    #[test]
    fn test_node_joining_mid_wait_blocks_until_caught_up() {
        let mut set = ConvergenceSet::new(5);
        assert_eq!(set.check_round(&[record("a", "5")]), RoundOutcome::Converged);

        let mut set = ConvergenceSet::new(5);
        assert!(matches!(
            set.check_round(&[record("a", "5"), record("z", "0")]),
            RoundOutcome::Behind { version: 0, .. }
        ));
        assert_eq!(
            set.check_round(&[record("a", "5"), record("z", "5")]),
            RoundOutcome::Converged
        );
    }
}
