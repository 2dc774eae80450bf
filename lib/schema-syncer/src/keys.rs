// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key layout and value encoding shared by every node in the cluster.

/// Monotonically increasing identifier of a catalog snapshot.
pub type SchemaVersion = i64;

/// Prefix under which every node publishes its own applied version.
pub const ALL_SCHEMA_VERSIONS: &str = "/tidb/ddl/all_schema_versions";

/// Key holding the cluster-wide schema version written by the DDL owner.
pub const GLOBAL_SCHEMA_VERSION: &str = "/tidb/ddl/global_schema_version";

/// Value written by bootstrap for both the global and the per-node records.
pub const INITIAL_VERSION: &str = "0";

pub fn self_version_key(node_id: &str) -> String {
    format!("{}/{}", ALL_SCHEMA_VERSIONS, node_id)
}

/// Node id from a key under [`ALL_SCHEMA_VERSIONS`], or `None` for foreign keys.
pub fn node_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(ALL_SCHEMA_VERSIONS)?.strip_prefix('/')
}

pub fn encode_version(version: SchemaVersion) -> String {
    version.to_string()
}

pub fn parse_version(raw: &[u8]) -> Option<SchemaVersion> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_self_version_key_layout() {
        assert_eq!(
            self_version_key("3f1a-node"),
            "/tidb/ddl/all_schema_versions/3f1a-node"
        );
        assert_eq!(node_id_from_key(&self_version_key("a")), Some("a"));
        assert_eq!(node_id_from_key(GLOBAL_SCHEMA_VERSION), None);
        assert_eq!(node_id_from_key("/tidb/ddl/all_schema_versions_x/a"), None);
    }

    #[rstest]
    #[case(b"0", Some(0))]
    #[case(b"42", Some(42))]
    #[case(b"-1", Some(-1))]
    #[case(b"abc", None)]
    #[case(b"", None)]
    #[case(b" 7", None)]
    #[case(&[0xff, 0xfe], None)]
    fn test_parse_version(#[case] raw: &[u8], #[case] expected: Option<SchemaVersion>) {
        assert_eq!(parse_version(raw), expected);
    }

    #[test]
    fn test_encode_is_decimal() {
        assert_eq!(encode_version(1_234_567), "1234567");
        assert_eq!(INITIAL_VERSION, encode_version(0));
    }
}
