use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp comparison format used by the differ and the restore engine.
///
/// Microsecond precision sidesteps filesystem timestamp-precision
/// mismatches between the walk that recorded a time and the stat that
/// re-reads it.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

pub fn timestamps_equal(a: &DateTime<Utc>, b: &DateTime<Utc>) -> bool {
    format_timestamp(a) == format_timestamp(b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
}

/// Reference to one chunk of a file's content.
///
/// `etag` is the lowercase hex MD5 of the chunk bytes and doubles as the
/// object-store key. Within a file, refs are non-overlapping and
/// contiguous in `start` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub start: u64,
    pub length: u32,
    pub etag: String,
}

/// One filesystem entity of a recovery point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub absolute_path: String,
    pub relative_path: String,
    pub base_path: String,
    pub name: String,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub access_time: DateTime<Utc>,
    pub mod_time: DateTime<Utc>,
    pub change_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// Whole-file SHA-256 (lowercase hex); files only, filled in by the
    /// chunk pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_hash: Option<String>,
    /// Ordered chunk list; files only. Concatenating the chunks at their
    /// `start` offsets reproduces the bytes hashed into `sha256_hash`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ChunkRef>,
}

/// The per-recovery-point tree of Nodes, in walk order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    pub backup_directory_id: String,
    pub recovery_point_id: String,
    pub total_files: u64,
    pub items: Vec<Node>,
}

impl Index {
    pub fn new(backup_directory_id: &str, recovery_point_id: &str) -> Self {
        Self {
            backup_directory_id: backup_directory_id.to_string(),
            recovery_point_id: recovery_point_id.to_string(),
            total_files: 0,
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, node: Node) {
        if node.kind == NodeKind::File {
            self.total_files += 1;
        }
        self.items.push(node);
    }

    /// Lookup table by relative path, used to match prior-RP Nodes.
    pub fn by_relative_path(&self) -> HashMap<&str, &Node> {
        self.items
            .iter()
            .map(|n| (n.relative_path.as_str(), n))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn node(rel: &str, kind: NodeKind) -> Node {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Node {
            absolute_path: format!("/data/{rel}"),
            relative_path: rel.to_string(),
            base_path: "/data".to_string(),
            name: rel.rsplit('/').next().unwrap().to_string(),
            kind,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            access_time: t,
            mod_time: t,
            change_time: t,
            link_target: None,
            sha256_hash: None,
            content: Vec::new(),
        }
    }

    #[test]
    fn timestamp_format_carries_microseconds() {
        let t = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(format_timestamp(&t), "2023-11-14 22:13:20.123456");
    }

    #[test]
    fn sub_microsecond_differences_compare_equal() {
        let a = Utc.timestamp_opt(1_700_000_000, 123_456_111).unwrap();
        let b = Utc.timestamp_opt(1_700_000_000, 123_456_999).unwrap();
        assert!(timestamps_equal(&a, &b));

        let c = Utc.timestamp_opt(1_700_000_000, 123_457_000).unwrap();
        assert!(!timestamps_equal(&a, &c));
    }

    #[test]
    fn index_counts_files_only() {
        let mut index = Index::new("bd-1", "rp-1");
        index.push(node("docs", NodeKind::Dir));
        index.push(node("docs/a.txt", NodeKind::File));
        index.push(node("docs/b.txt", NodeKind::File));
        assert_eq!(index.total_files, 2);
        assert_eq!(index.items.len(), 3);
    }

    #[test]
    fn relative_paths_are_unique_lookup_keys() {
        let mut index = Index::new("bd-1", "rp-1");
        index.push(node("a", NodeKind::File));
        index.push(node("b", NodeKind::File));
        let map = index.by_relative_path();
        assert_eq!(map.len(), index.items.len());
        assert!(map.contains_key("a"));
        assert!(map.contains_key("b"));
    }

    #[test]
    fn node_serialization_omits_empty_file_fields() {
        let n = node("docs", NodeKind::Dir);
        let json = serde_json::to_string(&n).unwrap();
        assert!(!json.contains("sha256_hash"));
        assert!(!json.contains("\"content\""));
        assert!(json.contains("\"kind\":\"dir\""));

        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, NodeKind::Dir);
        assert!(back.content.is_empty());
    }
}
