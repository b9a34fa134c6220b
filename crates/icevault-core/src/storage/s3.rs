use std::io::Read;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rusty_s3::actions::S3Action;
use rusty_s3::{Bucket, Credentials, UrlStyle};
use tracing::info;
use url::Url;

use crate::config::{AgentConfig, RetryConfig};
use crate::control::{Credential, CredentialKind, CredentialSource};
use crate::error::{IcevaultError, Result};
use crate::limits::{LimitedReader, TransportLimits, DRAIN_BLOCK_SIZE};
use crate::storage::{HeadOutcome, ObjectApi, StoreError, Vault};

const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection parameters for one storage vault.
#[derive(Debug, Clone)]
pub struct S3VaultOptions {
    pub vault_id: String,
    pub action_id: String,
    pub bucket: String,
    pub credential_kind: CredentialKind,
    pub credential: Credential,
    /// KB/s; 0 resolves to the configured default at construction time.
    pub limit_upload: u64,
    pub limit_download: u64,
    pub retry: RetryConfig,
}

/// The retry-wrapped S3 vault client handed to backup and restore.
pub type S3Vault = Vault<S3Api>;

/// Build an [`S3Vault`]. Bandwidth limits of 0 are resolved against the
/// agent configuration once, here; credential refreshes keep the resolved
/// limiters.
pub fn new_s3_vault(
    options: S3VaultOptions,
    credential_source: Arc<dyn CredentialSource>,
    config: &AgentConfig,
) -> Result<S3Vault> {
    let limits = TransportLimits::resolve(
        options.limit_upload,
        options.limit_download,
        config.limit_upload,
        config.limit_download,
    );
    let session = build_session(&options.bucket, &options.credential)?;
    let retry = options.retry.clone();
    Ok(Vault::new(
        S3Api {
            vault_id: options.vault_id,
            action_id: options.action_id,
            bucket_name: options.bucket,
            credential_kind: options.credential_kind,
            credential_source,
            session: RwLock::new(session),
            limits,
        },
        retry,
    ))
}

/// Signing context plus HTTP client; replaced wholesale on credential
/// refresh. All members are cheap to clone (the agent shares its
/// connection pool internally), so operations snapshot the session and
/// keep using it even if a refresh lands mid-flight.
#[derive(Clone, Debug)]
struct S3Session {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
}

fn build_session(bucket_name: &str, credential: &Credential) -> Result<S3Session> {
    let endpoint: Url = credential.endpoint.parse().map_err(|e| {
        IcevaultError::Config(format!(
            "invalid vault endpoint URL '{}': {e}",
            credential.endpoint
        ))
    })?;

    // Endpoint is always explicit; use path-style addressing.
    let bucket = Bucket::new(
        endpoint,
        UrlStyle::Path,
        bucket_name.to_string(),
        credential.region.clone(),
    )
    .map_err(|e| IcevaultError::Config(format!("failed to create bucket handle: {e}")))?;

    let credentials = match &credential.session_token {
        Some(token) => Credentials::new_with_token(
            credential.access_key.clone(),
            credential.secret_key.clone(),
            token.clone(),
        ),
        None => Credentials::new(credential.access_key.clone(), credential.secret_key.clone()),
    };

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .timeout_read(RESPONSE_TIMEOUT)
        .timeout_write(RESPONSE_TIMEOUT)
        .build();

    Ok(S3Session {
        bucket,
        credentials,
        agent,
    })
}

pub struct S3Api {
    vault_id: String,
    action_id: String,
    bucket_name: String,
    credential_kind: CredentialKind,
    credential_source: Arc<dyn CredentialSource>,
    session: RwLock<S3Session>,
    limits: TransportLimits,
}

impl S3Api {
    fn snapshot(&self) -> S3Session {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ObjectApi for S3Api {
    fn head(&self, key: &str) -> std::result::Result<HeadOutcome, StoreError> {
        let session = self.snapshot();
        let url = session
            .bucket
            .head_object(Some(&session.credentials), key)
            .sign(PRESIGN_DURATION);

        match session.agent.head(url.as_str()).call() {
            Ok(resp) => Ok(HeadOutcome {
                exists: true,
                etag: resp.header("ETag").map(|e| e.trim_matches('"').to_string()),
            }),
            Err(ureq::Error::Status(404, _)) => Ok(HeadOutcome {
                exists: false,
                etag: None,
            }),
            Err(e) => Err(classify("HEAD", e)),
        }
    }

    fn get(&self, key: &str) -> std::result::Result<Vec<u8>, StoreError> {
        let session = self.snapshot();
        let url = session
            .bucket
            .get_object(Some(&session.credentials), key)
            .sign(PRESIGN_DURATION);

        match session.agent.get(url.as_str()).call() {
            Ok(resp) => {
                // Drain through the download limiter in bounded slices so
                // throughput capping never buffers the body ahead of time.
                let mut reader = LimitedReader::new(
                    resp.into_reader(),
                    self.limits.download.as_deref(),
                );
                let mut body = Vec::new();
                let mut block = vec![0u8; DRAIN_BLOCK_SIZE];
                loop {
                    match reader.read(&mut block) {
                        Ok(0) => break,
                        Ok(n) => body.extend_from_slice(&block[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            return Err(StoreError::Transient(format!("GET body read: {e}")))
                        }
                    }
                }
                Ok(body)
            }
            Err(ureq::Error::Status(404, _)) => Err(StoreError::NoSuchKey),
            Err(e) => Err(classify("GET", e)),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> std::result::Result<(), StoreError> {
        let session = self.snapshot();
        let url = session
            .bucket
            .put_object(Some(&session.credentials), key)
            .sign(PRESIGN_DURATION);

        let body = LimitedReader::new(data, self.limits.upload.as_deref());
        match session
            .agent
            .put(url.as_str())
            .set("Content-Length", &data.len().to_string())
            .send(body)
        {
            Ok(_) => Ok(()),
            Err(e) => Err(classify("PUT", e)),
        }
    }

    fn credential_kind(&self) -> CredentialKind {
        self.credential_kind
    }

    fn fresh_credential(&self) -> Result<Credential> {
        self.credential_source
            .storage_vault_credential(&self.vault_id, &self.action_id)
    }

    fn apply_credential(&self, credential: Credential) -> Result<()> {
        let session = build_session(&self.bucket_name, &credential)
            .map_err(|e| IcevaultError::CredentialRefresh(e.to_string()))?;
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = session;
        info!(vault_id = %self.vault_id, "storage vault credential refreshed");
        Ok(())
    }
}

fn classify(op: &str, err: ureq::Error) -> StoreError {
    match err {
        ureq::Error::Status(403, _) => StoreError::AccessDenied(format!("{op}: HTTP 403")),
        ureq::Error::Status(code, _) if code == 429 || code >= 500 => {
            StoreError::Transient(format!("{op}: HTTP {code}"))
        }
        ureq::Error::Status(code, _) => StoreError::Permanent(format!("{op}: HTTP {code}")),
        ureq::Error::Transport(t) => StoreError::Transient(format!("{op}: {t}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_error() -> ureq::Error {
        // Force a transport error without any network: invalid DNS name.
        ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(100))
            .build()
            .get("http://invalid.invalid./x")
            .call()
            .unwrap_err()
    }

    #[test]
    fn classification_table() {
        assert!(matches!(
            classify("PUT", transport_error()),
            StoreError::Transient(_)
        ));
    }

    #[test]
    fn session_build_rejects_bad_endpoint() {
        let credential = Credential {
            access_key: "ak".into(),
            secret_key: "sk".into(),
            session_token: None,
            region: "hn-1".into(),
            endpoint: "not a url".into(),
        };
        let err = build_session("bucket", &credential).unwrap_err();
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn session_build_supports_session_tokens() {
        let credential = Credential {
            access_key: "ak".into(),
            secret_key: "sk".into(),
            session_token: Some("token".into()),
            region: "hn-1".into(),
            endpoint: "https://s3.example.com".into(),
        };
        build_session("bucket", &credential).unwrap();
    }
}
