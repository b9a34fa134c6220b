use std::fs::File;
#[cfg(not(unix))]
use std::io::{Seek, Write};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, error, info};

use crate::cancel::CancelScope;
use crate::commands::concurrency::Semaphore;
use crate::error::{IcevaultError, Result};
use crate::index::{timestamps_equal, Index, Node, NodeKind};
use crate::platform::fs;
use crate::progress::{Progress, Stat};
use crate::storage::StorageVault;

pub struct RestoreOptions {
    /// Concurrent item tasks; 0 selects the automatic bound.
    pub workers: usize,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self { workers: 0 }
    }
}

/// Automatic restore parallelism: a fifth of the CPUs, at least two.
pub(crate) fn worker_count(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    ((cpus as f64 * 0.2) as usize).max(2)
}

/// Reconstruct a directory tree from a recovery point index.
///
/// One task per top-level index item, gated by a counted semaphore.
/// Item failures are independent: the failing item reports its error and
/// the rest keep going; the first error is returned once every task has
/// finished. Session cancellation stops everything.
pub fn run_restore(
    index: &Index,
    dest: &Path,
    vault: &dyn StorageVault,
    progress: &Progress,
    cancel: &CancelScope,
    options: &RestoreOptions,
) -> Result<()> {
    let workers = worker_count(options.workers);
    let semaphore = Semaphore::new(workers);
    let first_error: Mutex<Option<IcevaultError>> = Mutex::new(None);

    info!(
        recovery_point_id = %index.recovery_point_id,
        items = index.items.len(),
        workers,
        dest = %dest.display(),
        "restoring recovery point"
    );

    std::thread::scope(|s| {
        for item in &index.items {
            if cancel.is_cancelled() {
                break;
            }
            let guard = semaphore.acquire();
            let first_error = &first_error;
            s.spawn(move || {
                let _guard = guard;
                match restore_item(dest, item, vault, progress, cancel) {
                    Ok(()) => {
                        progress.report(Stat {
                            items: 1,
                            ..Stat::default()
                        });
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        error!(item = %item.absolute_path, error = %e, "restore item failed");
                        progress.report(Stat {
                            errors: true,
                            item_names: vec![item.absolute_path.clone()],
                            ..Stat::default()
                        });
                        let mut slot = first_error.lock().unwrap_or_else(|p| p.into_inner());
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            });
        }
    });

    cancel.check()?;
    match first_error.into_inner().unwrap_or_else(|p| p.into_inner()) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Destination path rule: restoring into the original base path places
/// items at their recorded absolute paths; any other destination gets
/// the relative tree joined under it.
fn target_path(dest: &Path, item: &Node) -> PathBuf {
    if dest == Path::new(&item.base_path) {
        PathBuf::from(&item.absolute_path)
    } else {
        dest.join(&item.relative_path)
    }
}

fn restore_item(
    dest: &Path,
    item: &Node,
    vault: &dyn StorageVault,
    progress: &Progress,
    cancel: &CancelScope,
) -> Result<()> {
    cancel.check()?;
    let target = target_path(dest, item);
    match item.kind {
        NodeKind::Symlink => restore_symlink(&target, item),
        NodeKind::Dir => restore_directory(&target, item),
        NodeKind::File => restore_file(&target, item, vault, progress, cancel),
    }
}

fn restore_symlink(target: &Path, item: &Node) -> Result<()> {
    match std::fs::symlink_metadata(target) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(target = %target.display(), "symlink missing, creating");
            let link_target = item.link_target.as_deref().ok_or_else(|| {
                IcevaultError::Other(format!(
                    "symlink item '{}' has no link target",
                    item.relative_path
                ))
            })?;
            ensure_parent(target)?;
            fs::create_symlink(Path::new(link_target), target)?;
            // chmod on a link path would follow it and race the target
            // file's own restore task; ownership is applied link-local.
            let _ = fs::apply_symlink_ownership(target, item.uid, item.gid);
            Ok(())
        }
        Err(e) => Err(e.into()),
        Ok(metadata) => {
            let on_disk = fs::summarize_metadata(&metadata);
            if !timestamps_equal(&on_disk.change_time, &item.change_time) {
                debug!(target = %target.display(), "symlink ctime changed, updating ownership");
                let _ = fs::apply_symlink_ownership(target, item.uid, item.gid);
            }
            Ok(())
        }
    }
}

fn restore_directory(target: &Path, item: &Node) -> Result<()> {
    match std::fs::metadata(target) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(target = %target.display(), "directory missing, creating");
            std::fs::create_dir_all(target)?;
            fs::apply_mode(target, item.mode)?;
            let _ = fs::apply_ownership(target, item.uid, item.gid);
            fs::set_file_times(target, &item.access_time, &item.mod_time)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
        Ok(metadata) => {
            let on_disk = fs::summarize_metadata(&metadata);
            if !timestamps_equal(&on_disk.change_time, &item.change_time) {
                debug!(target = %target.display(), "directory ctime changed, updating metadata");
                fs::apply_mode(target, item.mode)?;
                let _ = fs::apply_ownership(target, item.uid, item.gid);
            }
            Ok(())
        }
    }
}

/// What to do with a file that may already exist at the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileAction {
    Create,
    Skip,
    Replace,
    RefreshMetadata,
}

fn file_restore_action(present: bool, ctime_equal: bool, mtime_equal: bool) -> FileAction {
    if !present {
        FileAction::Create
    } else if ctime_equal {
        FileAction::Skip
    } else if mtime_equal {
        FileAction::RefreshMetadata
    } else {
        FileAction::Replace
    }
}

fn restore_file(
    target: &Path,
    item: &Node,
    vault: &dyn StorageVault,
    progress: &Progress,
    cancel: &CancelScope,
) -> Result<()> {
    cancel.check()?;

    let on_disk = match std::fs::metadata(target) {
        Ok(metadata) => Some(fs::summarize_metadata(&metadata)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let action = file_restore_action(
        on_disk.is_some(),
        on_disk
            .as_ref()
            .is_some_and(|d| timestamps_equal(&d.change_time, &item.change_time)),
        on_disk
            .as_ref()
            .is_some_and(|d| timestamps_equal(&d.mod_time, &item.mod_time)),
    );

    match action {
        FileAction::Skip => {
            debug!(target = %target.display(), "file unchanged, skipping");
            Ok(())
        }
        FileAction::RefreshMetadata => {
            debug!(target = %target.display(), "file ctime changed, updating metadata");
            fs::apply_mode(target, item.mode)?;
            let _ = fs::apply_ownership(target, item.uid, item.gid);
            fs::set_file_times(target, &item.access_time, &item.mod_time)?;
            Ok(())
        }
        FileAction::Create => {
            debug!(target = %target.display(), "file missing, creating");
            let file = create_file(target, item)?;
            download_file(&file, target, item, vault, progress, cancel)
        }
        FileAction::Replace => {
            debug!(target = %target.display(), "file changed, replacing");
            std::fs::remove_file(target)?;
            let file = create_file(target, item)?;
            download_file(&file, target, item, vault, progress, cancel)
        }
    }
}

fn create_file(target: &Path, item: &Node) -> Result<File> {
    ensure_parent(target)?;
    let file = File::create(target)?;
    fs::apply_mode(target, item.mode)?;
    let _ = fs::apply_ownership(target, item.uid, item.gid);
    Ok(file)
}

fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Fetch every chunk in start order and write it at its recorded offset,
/// then apply the item's mode, ownership and timestamps. A single chunk
/// failure aborts the file.
fn download_file(
    file: &File,
    target: &Path,
    item: &Node,
    vault: &dyn StorageVault,
    progress: &Progress,
    cancel: &CancelScope,
) -> Result<()> {
    for chunk in &item.content {
        cancel.check()?;
        let data = vault.get_object(&chunk.etag)?;
        write_at(file, &data, chunk.start)?;
        progress.report(Stat {
            bytes: chunk.length as u64,
            storage: chunk.length as u64,
            ..Stat::default()
        });
    }

    fs::apply_mode(target, item.mode)?;
    let _ = fs::apply_ownership(target, item.uid, item.gid);
    fs::set_file_times(target, &item.access_time, &item.mod_time)?;
    Ok(())
}

fn write_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        file.write_all_at(data, offset)
    }

    #[cfg(not(unix))]
    {
        let mut file = file;
        file.seek(std::io::SeekFrom::Start(offset))?;
        file.write_all(data)
    }
}
