use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "icevault",
    version,
    about = "Deduplicating backup agent with content-addressed vault storage",
    after_help = "\
Configuration file lookup order:
  1. --config <path>          (explicit flag)
  2. $ICEVAULT_CONFIG         (environment variable)
  3. ./icevault.yaml          (working directory)"
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides ICEVAULT_CONFIG and the default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Produce a new recovery point for a backup directory
    Backup {
        /// Backup directory identifier
        #[arg(long = "directory-id")]
        backup_directory_id: String,

        /// Identifier of the recovery point to create
        #[arg(long = "recovery-point-id")]
        recovery_point_id: String,

        /// Walk root of the backup directory
        path: String,

        /// Ignore the prior recovery point and re-chunk everything
        #[arg(long)]
        full: bool,
    },

    /// Reconstruct a recovery point into a destination directory
    Restore {
        /// Backup directory identifier
        #[arg(long = "directory-id")]
        backup_directory_id: String,

        /// Recovery point to restore
        #[arg(long = "recovery-point-id")]
        recovery_point_id: String,

        /// Destination directory
        destination: String,
    },
}
