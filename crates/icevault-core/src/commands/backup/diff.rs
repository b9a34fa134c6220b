use crate::index::{timestamps_equal, Node, NodeKind};

/// What the differ decided for one walked item.
#[derive(Debug, PartialEq)]
pub(crate) enum ItemPlan<'a> {
    /// New or changed: chunk the file's content from scratch. For
    /// non-file items this degrades to metadata-only (there is no data).
    Chunk,
    /// Non-file item matching its prior: metadata is already captured by
    /// the walk, nothing else to do.
    CopyMetadata,
    /// Unchanged file: copy `content` and `sha256_hash` from the prior
    /// Node and re-emit its chunk references into the manifest stream so
    /// the server's per-RP reference counts stay correct.
    Reuse(&'a Node),
}

/// Decide whether an item must be re-chunked or can reference the prior
/// recovery point's chunk list. Modification times compare by formatted
/// string at microsecond precision; a content rewrite that preserves
/// mtime is therefore reused — that is the accepted trade-off of
/// mtime-based differencing.
pub(crate) fn plan_item<'a>(node: &Node, prior: Option<&'a Node>) -> ItemPlan<'a> {
    let Some(prior) = prior else {
        return ItemPlan::Chunk;
    };
    if prior.kind != node.kind {
        return ItemPlan::Chunk;
    }
    if node.kind != NodeKind::File {
        return ItemPlan::CopyMetadata;
    }
    if timestamps_equal(&prior.mod_time, &node.mod_time) {
        ItemPlan::Reuse(prior)
    } else {
        ItemPlan::Chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn node(kind: NodeKind, mtime_offset_us: i64) -> Node {
        let base = Utc.with_ymd_and_hms(2024, 5, 20, 10, 0, 0).unwrap();
        let t = base + Duration::microseconds(mtime_offset_us);
        Node {
            absolute_path: "/data/f".into(),
            relative_path: "f".into(),
            base_path: "/data".into(),
            name: "f".into(),
            kind,
            mode: 0o644,
            uid: 0,
            gid: 0,
            access_time: t,
            mod_time: t,
            change_time: t,
            link_target: None,
            sha256_hash: Some("abc".into()),
            content: vec![crate::index::ChunkRef {
                start: 0,
                length: 5,
                etag: "e1".into(),
            }],
        }
    }

    #[test]
    fn missing_prior_chunks() {
        assert_eq!(plan_item(&node(NodeKind::File, 0), None), ItemPlan::Chunk);
    }

    #[test]
    fn type_mismatch_chunks() {
        let prior = node(NodeKind::Dir, 0);
        assert_eq!(
            plan_item(&node(NodeKind::File, 0), Some(&prior)),
            ItemPlan::Chunk
        );
    }

    #[test]
    fn matching_non_file_copies_metadata() {
        let prior = node(NodeKind::Dir, 0);
        assert_eq!(
            plan_item(&node(NodeKind::Dir, 500), Some(&prior)),
            ItemPlan::CopyMetadata
        );
    }

    #[test]
    fn changed_mtime_chunks() {
        let prior = node(NodeKind::File, 0);
        assert_eq!(
            plan_item(&node(NodeKind::File, 1), Some(&prior)),
            ItemPlan::Chunk
        );
    }

    #[test]
    fn equal_mtime_reuses_the_prior() {
        let prior = node(NodeKind::File, 0);
        let current = node(NodeKind::File, 0);
        match plan_item(&current, Some(&prior)) {
            ItemPlan::Reuse(p) => {
                assert_eq!(p.sha256_hash.as_deref(), Some("abc"));
                assert_eq!(p.content.len(), 1);
            }
            other => panic!("expected reuse, got {other:?}"),
        }
    }

    #[test]
    fn sub_microsecond_skew_still_reuses() {
        let base = node(NodeKind::File, 0);
        let mut skewed = node(NodeKind::File, 0);
        skewed.mod_time = base.mod_time + Duration::nanoseconds(400);
        assert!(matches!(
            plan_item(&skewed, Some(&base)),
            ItemPlan::Reuse(_)
        ));
    }
}
