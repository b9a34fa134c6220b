mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use icevault_core::cache::CacheRepository;
use icevault_core::cancel::CancelScope;
use icevault_core::commands::backup::{run_backup, BackupOptions, BackupRequest};
use icevault_core::commands::restore::{run_restore, RestoreOptions};
use icevault_core::config::AgentConfig;
use icevault_core::control::{ActionStatus, Credential, StaticCredentials};
use icevault_core::progress::Progress;
use icevault_core::storage::s3::{new_s3_vault, S3Vault, S3VaultOptions};

use cli::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    let cache = CacheRepository::new(&config.cache_dir)?;

    match cli.command {
        Commands::Backup {
            backup_directory_id,
            recovery_point_id,
            path,
            full,
        } => {
            let vault = build_vault(&config, &recovery_point_id)?;
            backup(
                &config,
                &cache,
                &vault,
                &backup_directory_id,
                &recovery_point_id,
                Path::new(&path),
                full,
            )
        }
        Commands::Restore {
            backup_directory_id,
            recovery_point_id,
            destination,
        } => {
            let vault = build_vault(&config, &recovery_point_id)?;
            restore(
                &config,
                &cache,
                &vault,
                &backup_directory_id,
                &recovery_point_id,
                Path::new(&destination),
            )
        }
    }
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(explicit: Option<&str>) -> anyhow::Result<AgentConfig> {
    let path = match explicit {
        Some(path) => path.to_string(),
        None => std::env::var("ICEVAULT_CONFIG").unwrap_or_else(|_| "icevault.yaml".to_string()),
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading configuration file '{path}'"))?;
    let config: AgentConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing configuration '{path}'"))?;
    Ok(config)
}

fn build_vault(config: &AgentConfig, action_id: &str) -> anyhow::Result<S3Vault> {
    let credential = Credential {
        access_key: config.vault.access_key.clone(),
        secret_key: config.vault.secret_key.clone(),
        session_token: config.vault.session_token.clone(),
        region: config.vault.region.clone(),
        endpoint: config.vault.endpoint.clone(),
    };
    let options = S3VaultOptions {
        vault_id: config.vault.id.clone(),
        action_id: action_id.to_string(),
        bucket: config.vault.bucket.clone(),
        credential_kind: config.vault.credential_kind,
        credential: credential.clone(),
        limit_upload: config.limit_upload,
        limit_download: config.limit_download,
        retry: config.vault.retry.clone(),
    };
    Ok(new_s3_vault(
        options,
        Arc::new(StaticCredentials(credential)),
        config,
    )?)
}

#[allow(clippy::too_many_arguments)]
fn backup(
    config: &AgentConfig,
    cache: &CacheRepository,
    vault: &S3Vault,
    backup_directory_id: &str,
    recovery_point_id: &str,
    path: &Path,
    full: bool,
) -> anyhow::Result<()> {
    let prior_index = if full {
        None
    } else {
        cache.load_latest_index(backup_directory_id)?
    };
    if prior_index.is_none() {
        info!("no prior recovery point, chunking everything");
    }

    info!(status = ?ActionStatus::Uploading, recovery_point_id, "backup started");
    let progress = Progress::new();
    let summary = run_backup(
        &BackupRequest {
            backup_directory_id,
            recovery_point_id,
            base_path: path,
            prior_index: prior_index.as_ref(),
        },
        &BackupOptions {
            chunk_workers: 0,
            force: config.force,
        },
        vault,
        cache,
        &progress,
        &CancelScope::new(),
        None,
    )?;

    let snapshot = progress.snapshot();
    info!(
        status = ?ActionStatus::Completed,
        items = snapshot.items,
        bytes = snapshot.bytes,
        storage_bytes = summary.storage_bytes,
        unique_chunks = summary.manifest.chunks.len(),
        "backup finished"
    );
    if summary.errors {
        warn!(failed_items = ?snapshot.item_names, "some items were skipped with errors");
        bail!("backup finished with errors");
    }
    Ok(())
}

fn restore(
    config: &AgentConfig,
    cache: &CacheRepository,
    vault: &S3Vault,
    backup_directory_id: &str,
    recovery_point_id: &str,
    destination: &Path,
) -> anyhow::Result<()> {
    let index = cache
        .load_index(backup_directory_id, recovery_point_id)
        .context("recovery point is not in the local cache")?;

    info!(status = ?ActionStatus::Restoring, recovery_point_id, "restore started");
    let progress = Progress::new();
    run_restore(
        &index,
        destination,
        vault,
        &progress,
        &CancelScope::new(),
        &RestoreOptions {
            workers: config.restore_workers,
        },
    )?;

    let snapshot = progress.snapshot();
    info!(
        status = ?ActionStatus::Completed,
        items = snapshot.items,
        bytes = snapshot.bytes,
        "restore finished"
    );
    Ok(())
}
