use std::path::Path;

use tracing::warn;
use walkdir::WalkDir;

use crate::error::Result;
use crate::index::{Node, NodeKind};
use crate::platform::fs;

/// Walk a backup directory into Nodes, in stable walk order.
///
/// The root itself is not an item; every entry below it becomes one Node.
/// Entries that vanish mid-walk or cannot be stat'ed are skipped with a
/// warning — the chunk pipeline re-checks each file when it opens it.
pub(crate) fn walk_directory(base_path: &Path) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();

    for entry in WalkDir::new(base_path)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable walk entry");
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        match node_from_entry(base_path, &entry) {
            Ok(Some(node)) => nodes.push(node),
            Ok(None) => {}
            Err(e) => warn!(path = %entry.path().display(), error = %e, "skipping walk entry"),
        }
    }

    Ok(nodes)
}

fn node_from_entry(base_path: &Path, entry: &walkdir::DirEntry) -> Result<Option<Node>> {
    let file_type = entry.file_type();
    let kind = if file_type.is_symlink() {
        NodeKind::Symlink
    } else if file_type.is_dir() {
        NodeKind::Dir
    } else if file_type.is_file() {
        NodeKind::File
    } else {
        // Sockets, FIFOs and the like are not backed up.
        return Ok(None);
    };

    let metadata = entry.metadata().map_err(|e| {
        std::io::Error::other(format!("stat {}: {e}", entry.path().display()))
    })?;
    let summary = fs::summarize_metadata(&metadata);

    let link_target = if kind == NodeKind::Symlink {
        Some(
            std::fs::read_link(entry.path())?
                .to_string_lossy()
                .into_owned(),
        )
    } else {
        None
    };

    let relative_path = entry
        .path()
        .strip_prefix(base_path)
        .unwrap_or(entry.path())
        .to_string_lossy()
        .into_owned();

    Ok(Some(Node {
        absolute_path: entry.path().to_string_lossy().into_owned(),
        relative_path,
        base_path: base_path.to_string_lossy().into_owned(),
        name: entry.file_name().to_string_lossy().into_owned(),
        kind,
        mode: summary.mode,
        uid: summary.uid,
        gid: summary.gid,
        access_time: summary.access_time,
        mod_time: summary.mod_time,
        change_time: summary.change_time,
        link_target,
        sha256_hash: None,
        content: Vec::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn walk_captures_the_tree_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"beta").unwrap();

        let nodes = walk_directory(dir.path()).unwrap();
        let rels: Vec<&str> = nodes.iter().map(|n| n.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["a.txt", "sub", "sub/b.txt"]);

        assert_eq!(nodes[0].kind, NodeKind::File);
        assert_eq!(nodes[1].kind, NodeKind::Dir);
        assert_eq!(nodes[0].name, "a.txt");
        assert_eq!(nodes[0].base_path, dir.path().to_string_lossy());
    }

    #[test]
    fn relative_paths_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("x/y")).unwrap();
        std::fs::write(dir.path().join("x/f"), b"1").unwrap();
        std::fs::write(dir.path().join("x/y/f"), b"2").unwrap();

        let nodes = walk_directory(dir.path()).unwrap();
        let unique: HashSet<&str> = nodes.iter().map(|n| n.relative_path.as_str()).collect();
        assert_eq!(unique.len(), nodes.len());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_carry_their_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();
        std::os::unix::fs::symlink("file", dir.path().join("link")).unwrap();

        let nodes = walk_directory(dir.path()).unwrap();
        let link = nodes.iter().find(|n| n.name == "link").unwrap();
        assert_eq!(link.kind, NodeKind::Symlink);
        assert_eq!(link.link_target.as_deref(), Some("file"));
    }
}
