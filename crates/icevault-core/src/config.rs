use serde::{Deserialize, Serialize};

use crate::control::CredentialKind;

/// Agent configuration. Bandwidth limits are KB/s with 0 meaning
/// unlimited; `restore_workers` 0 selects the automatic bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub limit_upload: u64,
    #[serde(default)]
    pub limit_download: u64,
    #[serde(default)]
    pub restore_workers: usize,
    /// Retry failed source opens through the snapshot provider, when one
    /// is configured.
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_vault_id")]
    pub id: String,
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
    #[serde(default)]
    pub credential_kind: CredentialKind,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Budgets for the vault client's exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_retry_max_interval_secs")]
    pub max_interval_secs: u64,
    #[serde(default = "default_retry_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_retry_initial_delay_ms(),
            max_interval_secs: default_retry_max_interval_secs(),
            max_elapsed_secs: default_retry_max_elapsed_secs(),
        }
    }
}

fn default_cache_dir() -> String {
    ".icevault-cache".to_string()
}

fn default_vault_id() -> String {
    "default".to_string()
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

// Both backoff budgets default to three minutes.
fn default_retry_max_interval_secs() -> u64 {
    180
}

fn default_retry_max_elapsed_secs() -> u64 {
    180
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let yaml_ish = r#"{
            "vault": {
                "bucket": "backups",
                "region": "hn-1",
                "endpoint": "https://s3.example.com"
            }
        }"#;
        let config: AgentConfig = serde_json::from_str(yaml_ish).unwrap();
        assert_eq!(config.limit_upload, 0);
        assert_eq!(config.limit_download, 0);
        assert_eq!(config.restore_workers, 0);
        assert!(!config.force);
        assert_eq!(config.cache_dir, ".icevault-cache");
        assert_eq!(config.vault.id, "default");
        assert_eq!(config.vault.credential_kind, CredentialKind::Static);
        assert_eq!(config.vault.retry.max_interval_secs, 180);
        assert_eq!(config.vault.retry.max_elapsed_secs, 180);
    }
}
