use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use md5::{Digest, Md5};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::cancel::CancelScope;
use crate::chunker::Chunker;
use crate::commands::concurrency::JobTracker;
use crate::error::{IcevaultError, Result};
use crate::index::{ChunkRef, Node};
use crate::progress::{Progress, Stat};
use crate::storage::StorageVault;

use super::SnapshotProvider;

/// A mid-file chunker failure triggers a full re-chunk of the file, up
/// to this many attempts spaced by the constant interval.
pub(crate) const MAX_CHUNK_ATTEMPTS: u32 = 3;
pub(crate) const CHUNK_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// One chunk upload handed to the worker pool.
pub(crate) struct ChunkJob {
    data: Vec<u8>,
    etag: String,
    length: u32,
    state: Arc<FileUploadState>,
}

/// Per-file state shared between the chunking loop and its upload jobs.
struct FileUploadState {
    cancel: CancelScope,
    first_error: Mutex<Option<IcevaultError>>,
    uploaded: AtomicU64,
    tracker: JobTracker,
}

impl FileUploadState {
    fn new(cancel: CancelScope) -> Self {
        Self {
            cancel,
            first_error: Mutex::new(None),
            uploaded: AtomicU64::new(0),
            tracker: JobTracker::new(),
        }
    }
}

/// Spawn the session-wide bounded chunk upload pool onto `scope`.
///
/// Workers exit once every clone of the returned sender is dropped and
/// the channel drains; the enclosing scope then joins them.
pub(crate) fn spawn_chunk_workers<'scope, 'env>(
    scope: &'scope std::thread::Scope<'scope, 'env>,
    workers: usize,
    vault: &'env dyn StorageVault,
    progress: &'env Progress,
) -> Sender<ChunkJob> {
    debug_assert!(workers > 0, "chunk pool needs at least one worker");
    let (tx, rx) = crossbeam_channel::bounded::<ChunkJob>(workers * 2);

    for _ in 0..workers {
        let rx: Receiver<ChunkJob> = rx.clone();
        scope.spawn(move || {
            for job in rx {
                run_chunk_job(job, vault, progress);
            }
        });
    }

    tx
}

fn run_chunk_job(job: ChunkJob, vault: &dyn StorageVault, progress: &Progress) {
    if job.state.cancel.is_cancelled() {
        job.state.tracker.finish();
        return;
    }

    match vault.put_object(&job.etag, &job.data) {
        Ok(()) => {
            let stored = job.length as u64;
            job.state.uploaded.fetch_add(stored, Ordering::Relaxed);
            progress.report(Stat {
                bytes: job.length as u64,
                storage: stored,
                ..Stat::default()
            });
        }
        Err(e) => {
            warn!(etag = %job.etag, error = %e, "chunk upload failed");
            let mut slot = job
                .state
                .first_error
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                *slot = Some(e);
            }
            drop(slot);
            job.state.cancel.cancel();
        }
    }
    job.state.tracker.finish();
}

/// Everything a single file's chunking run needs from the session.
pub(crate) struct FileChunkContext<'a> {
    pub pool: &'a Sender<ChunkJob>,
    pub cancel: &'a CancelScope,
    pub progress: &'a Progress,
    pub force: bool,
    pub snapshot_provider: Option<&'a dyn SnapshotProvider>,
    pub chunk_retry_interval: Duration,
}

/// Open a source file, optionally falling back to the snapshot provider
/// when `force` is set and the plain open fails.
fn open_source(
    path: &Path,
    force: bool,
    provider: Option<&dyn SnapshotProvider>,
) -> Result<File> {
    match File::open(path) {
        Ok(file) => Ok(file),
        Err(open_err) => {
            if force {
                if let Some(provider) = provider {
                    debug!(path = %path.display(), "open failed, retrying via snapshot provider");
                    let snapshot = provider.snapshot_path(path)?;
                    return Ok(File::open(snapshot)?);
                }
            }
            Err(open_err.into())
        }
    }
}

/// Chunk one file and submit every chunk to the upload pool.
///
/// The chunker loop is sequential, so `content` ends up in start order
/// and the file hash digests chunk payloads in start order; upload
/// completion order is unconstrained. Returns the bytes that reached the
/// vault. A source file that has vanished is reported with the error
/// flag and skipped (`Ok(0)`, no hash finalized).
pub(crate) fn chunk_file_to_backup(ctx: &FileChunkContext<'_>, node: &mut Node) -> Result<u64> {
    ctx.cancel.check()?;
    let state = Arc::new(FileUploadState::new(ctx.cancel.child()));

    let mut attempt = 0u32;
    let mut hasher;
    loop {
        attempt += 1;

        let file = match open_source(
            Path::new(&node.absolute_path),
            ctx.force,
            ctx.snapshot_provider,
        ) {
            Ok(file) => file,
            Err(e) if e.is_soft_file_error() => {
                warn!(path = %node.absolute_path, error = %e, "source unreadable, skipping file");
                ctx.progress.report(Stat {
                    errors: true,
                    item_names: vec![node.absolute_path.clone()],
                    ..Stat::default()
                });
                state.tracker.wait();
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut chunker = Chunker::new(file);
        hasher = Sha256::new();
        node.content.clear();

        let mut chunk_failure: Option<std::io::Error> = None;
        loop {
            if state.cancel.is_cancelled() {
                break;
            }
            match chunker.next_chunk() {
                Ok(None) => break,
                Ok(Some(chunk)) => {
                    hasher.update(&chunk.data);
                    let etag = hex::encode(Md5::digest(&chunk.data));
                    node.content.push(ChunkRef {
                        start: chunk.start,
                        length: chunk.length,
                        etag: etag.clone(),
                    });
                    state.tracker.add();
                    let job = ChunkJob {
                        data: chunk.data,
                        etag,
                        length: chunk.length,
                        state: Arc::clone(&state),
                    };
                    if ctx.pool.send(job).is_err() {
                        state.tracker.finish();
                        node.content.clear();
                        return Err(IcevaultError::Other("chunk worker pool is closed".into()));
                    }
                }
                Err(e) => {
                    chunk_failure = Some(e);
                    break;
                }
            }
        }

        match chunk_failure {
            None => break,
            Some(e) => {
                if attempt >= MAX_CHUNK_ATTEMPTS {
                    state.tracker.wait();
                    node.content.clear();
                    return Err(IcevaultError::ChunkRetriesExhausted {
                        path: node.absolute_path.clone(),
                        attempts: attempt,
                        source: e,
                    });
                }
                // Re-chunk the whole file from the start. Chunks already
                // uploaded by this attempt stay valid (content-keyed puts
                // are idempotent); the ref list and hash start over.
                warn!(
                    path = %node.absolute_path,
                    attempt,
                    error = %e,
                    "chunking failed, re-chunking file"
                );
                std::thread::sleep(ctx.chunk_retry_interval);
            }
        }
    }

    state.tracker.wait();

    if let Some(e) = state
        .first_error
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take()
    {
        node.content.clear();
        return Err(e);
    }
    if state.cancel.is_cancelled() {
        node.content.clear();
        return Err(IcevaultError::Cancelled);
    }

    node.sha256_hash = Some(hex::encode(hasher.finalize()));
    Ok(state.uploaded.load(Ordering::Relaxed))
}
