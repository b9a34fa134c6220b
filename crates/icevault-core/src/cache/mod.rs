use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IcevaultError, Result};
use crate::index::Index;

/// Vault key of the per-RP chunk manifest blob.
pub fn chunk_manifest_key(recovery_point_id: &str) -> String {
    format!("{recovery_point_id}/chunk.json")
}

/// Vault key of the per-RP item catalogue blob (the full Index).
pub fn item_catalogue_key(recovery_point_id: &str) -> String {
    format!("{recovery_point_id}/index.json")
}

/// Aggregated reference count and byte length for one etag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCount {
    pub count: u64,
    pub length: u32,
}

/// The per-RP chunk manifest uploaded for server-side reconciliation:
/// etag -> (reference count within this RP, chunk byte length).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub backup_directory_id: String,
    pub recovery_point_id: String,
    pub chunks: BTreeMap<String, ChunkCount>,
}

/// Concurrent streaming sink for chunk manifest records.
///
/// Writers append from any thread; records are coalesced by etag, summing
/// multiplicity. A record whose length disagrees with an earlier record
/// for the same etag is rejected — content-addressed chunks cannot change
/// size.
pub struct ManifestSink {
    backup_directory_id: String,
    recovery_point_id: String,
    chunks: Mutex<BTreeMap<String, ChunkCount>>,
}

impl ManifestSink {
    pub fn new(backup_directory_id: &str, recovery_point_id: &str) -> Self {
        Self {
            backup_directory_id: backup_directory_id.to_string(),
            recovery_point_id: recovery_point_id.to_string(),
            chunks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, etag: &str, length: u32) -> Result<()> {
        let mut chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        match chunks.get_mut(etag) {
            Some(entry) => {
                if entry.length != length {
                    return Err(IcevaultError::ManifestConflict {
                        etag: etag.to_string(),
                        seen: length,
                        recorded: entry.length,
                    });
                }
                entry.count += 1;
            }
            None => {
                chunks.insert(etag.to_string(), ChunkCount { count: 1, length });
            }
        }
        Ok(())
    }

    pub fn finalize(&self) -> ChunkManifest {
        ChunkManifest {
            backup_directory_id: self.backup_directory_id.clone(),
            recovery_point_id: self.recovery_point_id.clone(),
            chunks: self
                .chunks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

/// One streamed chunk reference, as appended to the local cache journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    etag: String,
    length: u32,
}

/// Append-only journal of chunk references for one RP record, kept next
/// to the cached index for post-backup reconciliation.
pub struct ChunkJournal {
    writer: Mutex<BufWriter<File>>,
}

impl ChunkJournal {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn append(&self, etag: &str, length: u32) -> Result<()> {
        let line = serde_json::to_string(&JournalEntry {
            etag: etag.to_string(),
            length,
        })?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{line}")?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.flush()?;
        Ok(())
    }
}

/// Local repository of recovery point records.
///
/// Layout: `<root>/<backup_directory_id>/<recovery_point_id>/` holding
/// `index.json` and `chunks.jsonl`, plus a `latest` pointer per backup
/// directory naming its most recently finalized RP.
pub struct CacheRepository {
    root: PathBuf,
}

impl CacheRepository {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn record_dir(&self, backup_directory_id: &str, recovery_point_id: &str) -> PathBuf {
        self.root.join(backup_directory_id).join(recovery_point_id)
    }

    pub fn chunk_journal(
        &self,
        backup_directory_id: &str,
        recovery_point_id: &str,
    ) -> Result<ChunkJournal> {
        let dir = self.record_dir(backup_directory_id, recovery_point_id);
        std::fs::create_dir_all(&dir)?;
        ChunkJournal::open(&dir.join("chunks.jsonl"))
    }

    /// Replay a record's journal into a coalesced manifest.
    pub fn load_journal(
        &self,
        backup_directory_id: &str,
        recovery_point_id: &str,
    ) -> Result<ChunkManifest> {
        let path = self
            .record_dir(backup_directory_id, recovery_point_id)
            .join("chunks.jsonl");
        let sink = ManifestSink::new(backup_directory_id, recovery_point_id);
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line)?;
            sink.record(&entry.etag, entry.length)?;
        }
        Ok(sink.finalize())
    }

    pub fn save_index(&self, index: &Index) -> Result<()> {
        let dir = self.record_dir(&index.backup_directory_id, &index.recovery_point_id);
        std::fs::create_dir_all(&dir)?;
        let file = File::create(dir.join("index.json"))?;
        serde_json::to_writer(BufWriter::new(file), index)?;
        debug!(
            backup_directory_id = %index.backup_directory_id,
            recovery_point_id = %index.recovery_point_id,
            items = index.items.len(),
            "cached recovery point index"
        );
        Ok(())
    }

    pub fn load_index(
        &self,
        backup_directory_id: &str,
        recovery_point_id: &str,
    ) -> Result<Index> {
        let path = self
            .record_dir(backup_directory_id, recovery_point_id)
            .join("index.json");
        let file = File::open(&path).map_err(|e| {
            IcevaultError::Cache(format!(
                "no cached index for {backup_directory_id}/{recovery_point_id}: {e}"
            ))
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Record `recovery_point_id` as the directory's most recent RP.
    pub fn mark_latest(&self, backup_directory_id: &str, recovery_point_id: &str) -> Result<()> {
        let dir = self.root.join(backup_directory_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("latest"), recovery_point_id)?;
        Ok(())
    }

    pub fn latest_recovery_point(&self, backup_directory_id: &str) -> Result<Option<String>> {
        let path = self.root.join(backup_directory_id).join("latest");
        match std::fs::read_to_string(&path) {
            Ok(id) => Ok(Some(id.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The immediately preceding RP's index for a backup directory, if any.
    pub fn load_latest_index(&self, backup_directory_id: &str) -> Result<Option<Index>> {
        match self.latest_recovery_point(backup_directory_id)? {
            Some(rp_id) => Ok(Some(self.load_index(backup_directory_id, &rp_id)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sink_coalesces_by_etag() {
        let sink = ManifestSink::new("bd-1", "rp-1");
        sink.record("aa", 100).unwrap();
        sink.record("bb", 200).unwrap();
        sink.record("aa", 100).unwrap();

        let manifest = sink.finalize();
        assert_eq!(manifest.chunks["aa"], ChunkCount { count: 2, length: 100 });
        assert_eq!(manifest.chunks["bb"], ChunkCount { count: 1, length: 200 });
    }

    #[test]
    fn sink_rejects_conflicting_lengths() {
        let sink = ManifestSink::new("bd-1", "rp-1");
        sink.record("aa", 100).unwrap();
        let err = sink.record("aa", 101).unwrap_err();
        assert!(matches!(err, IcevaultError::ManifestConflict { .. }));
    }

    #[test]
    fn sink_accepts_concurrent_writers() {
        let sink = Arc::new(ManifestSink::new("bd-1", "rp-1"));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let sink = Arc::clone(&sink);
                s.spawn(move || {
                    for _ in 0..500 {
                        sink.record("shared", 64).unwrap();
                    }
                });
            }
        });
        assert_eq!(sink.finalize().chunks["shared"].count, 2000);
    }

    #[test]
    fn journal_replay_matches_sink() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheRepository::new(dir.path()).unwrap();

        let journal = cache.chunk_journal("bd-1", "rp-1").unwrap();
        journal.append("aa", 100).unwrap();
        journal.append("aa", 100).unwrap();
        journal.append("bb", 50).unwrap();
        journal.flush().unwrap();

        let manifest = cache.load_journal("bd-1", "rp-1").unwrap();
        assert_eq!(manifest.chunks["aa"].count, 2);
        assert_eq!(manifest.chunks["bb"].length, 50);
    }

    #[test]
    fn index_roundtrip_and_latest_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheRepository::new(dir.path()).unwrap();

        assert!(cache.load_latest_index("bd-1").unwrap().is_none());

        let index = Index::new("bd-1", "rp-1");
        cache.save_index(&index).unwrap();
        cache.mark_latest("bd-1", "rp-1").unwrap();

        assert_eq!(
            cache.latest_recovery_point("bd-1").unwrap().as_deref(),
            Some("rp-1")
        );
        let loaded = cache.load_latest_index("bd-1").unwrap().unwrap();
        assert_eq!(loaded.recovery_point_id, "rp-1");
    }

    #[test]
    fn well_known_keys() {
        assert_eq!(chunk_manifest_key("rp-9"), "rp-9/chunk.json");
        assert_eq!(item_catalogue_key("rp-9"), "rp-9/index.json");
    }
}
