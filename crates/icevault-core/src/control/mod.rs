use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Static signing material for one storage vault session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    pub region: String,
    pub endpoint: String,
}

/// How a vault's credentials are managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialKind {
    /// Control-plane delegated: refreshed from the control plane when the
    /// vault reports an authorization failure.
    Default,
    /// Operator-provided; never refreshed automatically.
    Static,
}

impl Default for CredentialKind {
    fn default() -> Self {
        CredentialKind::Static
    }
}

/// Source of fresh vault credentials, consulted on authorization failures.
pub trait CredentialSource: Send + Sync {
    fn storage_vault_credential(&self, vault_id: &str, action_id: &str) -> Result<Credential>;
}

/// Credential source for operator-provided credentials: always hands back
/// the same material.
pub struct StaticCredentials(pub Credential);

impl CredentialSource for StaticCredentials {
    fn storage_vault_credential(&self, _vault_id: &str, _action_id: &str) -> Result<Credential> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPointInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDirectoryInfo {
    pub id: String,
    /// Walk root of the directory on the agent host.
    pub path: String,
}

/// The control-plane operations the core consumes.
pub trait ControlPlane: CredentialSource {
    fn create_recovery_point(
        &self,
        backup_directory_id: &str,
        policy_id: &str,
    ) -> Result<RecoveryPointInfo>;

    fn get_backup_directory(&self, id: &str) -> Result<BackupDirectoryInfo>;
}

/// Status transitions published on the event broker while an action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    ZipFile,
    Uploading,
    Completed,
    Downloading,
    Restoring,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ActionStatus::ZipFile).unwrap(),
            "\"ZIP_FILE\""
        );
        assert_eq!(
            serde_json::to_string(&ActionStatus::Downloading).unwrap(),
            "\"DOWNLOADING\""
        );
    }

    #[test]
    fn credential_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&CredentialKind::Default).unwrap(),
            "\"DEFAULT\""
        );
        let parsed: CredentialKind = serde_json::from_str("\"STATIC\"").unwrap();
        assert_eq!(parsed, CredentialKind::Static);
    }

    #[test]
    fn static_source_hands_back_its_material() {
        let source = StaticCredentials(Credential {
            access_key: "ak".into(),
            secret_key: "sk".into(),
            session_token: None,
            region: "us-east-1".into(),
            endpoint: "https://s3.example.com".into(),
        });
        let cred = source.storage_vault_credential("vault-1", "action-1").unwrap();
        assert_eq!(cred.access_key, "ak");
    }
}
