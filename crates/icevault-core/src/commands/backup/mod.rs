mod diff;
mod pipeline;
mod walk;

use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::cache::{chunk_manifest_key, item_catalogue_key, CacheRepository, ChunkManifest, ManifestSink};
use crate::cancel::CancelScope;
use crate::error::Result;
use crate::index::{Index, NodeKind};
use crate::progress::{Progress, Stat};
use crate::storage::StorageVault;

use diff::ItemPlan;
use pipeline::{FileChunkContext, CHUNK_RETRY_INTERVAL};

const DEFAULT_CHUNK_WORKERS: usize = 4;

/// Filesystem snapshot fallback for files that cannot be opened while in
/// use. Platform implementations live outside the core.
pub trait SnapshotProvider: Send + Sync {
    /// Path of a snapshotted copy of `path` that can be opened for read.
    fn snapshot_path(&self, path: &Path) -> Result<PathBuf>;
}

/// Identity of the recovery point being produced and its data sources.
pub struct BackupRequest<'a> {
    pub backup_directory_id: &'a str,
    pub recovery_point_id: &'a str,
    pub base_path: &'a Path,
    /// Index of the immediately preceding RP for this backup directory.
    pub prior_index: Option<&'a Index>,
}

pub struct BackupOptions {
    /// Upload pool size; 0 selects the default.
    pub chunk_workers: usize,
    /// Allow snapshot-provider fallback on source open failures.
    pub force: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            chunk_workers: 0,
            force: false,
        }
    }
}

#[derive(Debug)]
pub struct BackupSummary {
    pub index: Index,
    pub manifest: ChunkManifest,
    /// Bytes that reached the vault (deduplicated chunks count zero).
    pub storage_bytes: u64,
    /// True if any file was skipped or abandoned with its error flag set.
    pub errors: bool,
}

/// Produce one recovery point: walk the directory, decide per item
/// whether to re-chunk or reference the prior RP, stream chunk uploads
/// through the bounded pool, then finalize and upload the chunk manifest
/// and item catalogue.
///
/// File-level failures set the error flag and continue with the next
/// item; only cancellation aborts the session.
#[allow(clippy::too_many_arguments)]
pub fn run_backup(
    request: &BackupRequest<'_>,
    options: &BackupOptions,
    vault: &dyn StorageVault,
    cache: &CacheRepository,
    progress: &Progress,
    cancel: &CancelScope,
    snapshot_provider: Option<&dyn SnapshotProvider>,
) -> Result<BackupSummary> {
    let backup_directory_id = request.backup_directory_id;
    let recovery_point_id = request.recovery_point_id;

    let nodes = walk::walk_directory(request.base_path)?;
    let prior_by_path = request
        .prior_index
        .map(|index| index.by_relative_path())
        .unwrap_or_default();

    let sink = ManifestSink::new(backup_directory_id, recovery_point_id);
    let journal = cache.chunk_journal(backup_directory_id, recovery_point_id)?;
    let mut index = Index::new(backup_directory_id, recovery_point_id);
    let mut storage_bytes = 0u64;
    let mut file_errors = 0u64;

    let workers = if options.chunk_workers == 0 {
        DEFAULT_CHUNK_WORKERS
    } else {
        options.chunk_workers
    };

    std::thread::scope(|s| -> Result<()> {
        let pool = pipeline::spawn_chunk_workers(s, workers, vault, progress);

        for mut node in nodes {
            cancel.check()?;

            if node.kind != NodeKind::File {
                // Directories and symlinks carry metadata only; the differ
                // outcome is the same either way.
                index.push(node);
                progress.report(Stat {
                    items: 1,
                    ..Stat::default()
                });
                continue;
            }

            let plan = diff::plan_item(&node, prior_by_path.get(node.relative_path.as_str()).copied());
            match plan {
                ItemPlan::Reuse(prior) => {
                    node.content = prior.content.clone();
                    node.sha256_hash = prior.sha256_hash.clone();
                    // Re-emit every reference so the server's per-RP
                    // chunk counts include this file.
                    for chunk in &node.content {
                        sink.record(&chunk.etag, chunk.length)?;
                        journal.append(&chunk.etag, chunk.length)?;
                    }
                    index.push(node);
                }
                ItemPlan::Chunk | ItemPlan::CopyMetadata => {
                    let ctx = FileChunkContext {
                        pool: &pool,
                        cancel,
                        progress,
                        force: options.force,
                        snapshot_provider,
                        chunk_retry_interval: CHUNK_RETRY_INTERVAL,
                    };
                    match pipeline::chunk_file_to_backup(&ctx, &mut node) {
                        Ok(uploaded) => {
                            storage_bytes += uploaded;
                            if node.sha256_hash.is_some() {
                                for chunk in &node.content {
                                    sink.record(&chunk.etag, chunk.length)?;
                                    journal.append(&chunk.etag, chunk.length)?;
                                }
                                index.push(node);
                            } else {
                                // Source vanished; already reported.
                                file_errors += 1;
                            }
                        }
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) => {
                            error!(
                                path = %node.absolute_path,
                                error = %e,
                                "backing up file failed"
                            );
                            progress.report(Stat {
                                errors: true,
                                item_names: vec![node.absolute_path.clone()],
                                ..Stat::default()
                            });
                            file_errors += 1;
                        }
                    }
                }
            }
            progress.report(Stat {
                items: 1,
                ..Stat::default()
            });
        }
        Ok(())
        // The pool sender drops here; workers drain and the scope joins them.
    })?;

    cancel.check()?;
    journal.flush()?;

    let manifest = sink.finalize();
    vault.put_object(
        &chunk_manifest_key(recovery_point_id),
        &serde_json::to_vec(&manifest)?,
    )?;
    vault.put_object(
        &item_catalogue_key(recovery_point_id),
        &serde_json::to_vec(&index)?,
    )?;

    cache.save_index(&index)?;
    cache.mark_latest(backup_directory_id, recovery_point_id)?;

    info!(
        backup_directory_id,
        recovery_point_id,
        items = index.items.len(),
        files = index.total_files,
        storage_bytes,
        errors = file_errors,
        "recovery point finalized"
    );

    Ok(BackupSummary {
        index,
        manifest,
        storage_bytes,
        errors: file_errors > 0,
    })
}
