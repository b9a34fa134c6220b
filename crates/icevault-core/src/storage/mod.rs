pub mod retry;
pub mod s3;

use std::fmt;

use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::control::CredentialKind;
use crate::error::{IcevaultError, Result};

use retry::Backoff;

/// Abstract vault of opaque blobs keyed by content hash.
pub trait StorageVault: Send + Sync {
    fn head_object(&self, key: &str) -> Result<HeadOutcome>;

    /// Head plus the end-to-end integrity check: a stored single-part
    /// object's ETag must contain the key (the key is the MD5 of the
    /// body, so this validates payload integrity without reading it).
    fn verify_object(&self, key: &str) -> Result<VerifyOutcome>;

    fn put_object(&self, key: &str, data: &[u8]) -> Result<()>;

    fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    fn refresh_credential(&self, credential: crate::control::Credential) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HeadOutcome {
    pub exists: bool,
    pub etag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub exists: bool,
    pub integrity: bool,
    pub etag: Option<String>,
}

/// The well-known per-RP manifest blobs skip the after-put verify cycle.
pub fn is_manifest_key(key: &str) -> bool {
    key.contains("chunk.json") || key.contains("index.json") || key.contains("file.csv")
}

/// Classified outcome of a single vault attempt, before retry policy.
#[derive(Debug)]
pub enum StoreError {
    /// Missing object on a get; terminal, surfaced to the caller.
    NoSuchKey,
    AccessDenied(String),
    /// Worth retrying under the backoff budget.
    Transient(String),
    /// Never retried.
    Permanent(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NoSuchKey => write!(f, "no such key"),
            StoreError::AccessDenied(msg) => write!(f, "access denied: {msg}"),
            StoreError::Transient(msg) => write!(f, "transient: {msg}"),
            StoreError::Permanent(msg) => write!(f, "{msg}"),
        }
    }
}

/// A single-attempt object API plus the credential hooks the retry
/// driver needs. Implementations classify their transport errors into
/// [`StoreError`]; a missing object on head is reported as
/// `HeadOutcome { exists: false, .. }`, not as an error.
pub(crate) trait ObjectApi: Send + Sync {
    fn head(&self, key: &str) -> std::result::Result<HeadOutcome, StoreError>;
    fn get(&self, key: &str) -> std::result::Result<Vec<u8>, StoreError>;
    fn put(&self, key: &str, data: &[u8]) -> std::result::Result<(), StoreError>;

    fn credential_kind(&self) -> CredentialKind;
    /// Fetch fresh credentials from the credential source.
    fn fresh_credential(&self) -> Result<crate::control::Credential>;
    /// Atomically swap the signing context and HTTP client. In-flight
    /// operations keep the session they snapshotted.
    fn apply_credential(&self, credential: crate::control::Credential) -> Result<()>;
}

/// Retry/refresh driver wrapping an [`ObjectApi`] into a [`StorageVault`].
///
/// Policy, per operation: exponential backoff for transient errors until
/// the elapsed budget runs out; on authorization failures, refresh
/// through the credential source when the credential kind allows it,
/// otherwise grant one extra attempt after a short randomized delay.
pub struct Vault<A> {
    api: A,
    retry: RetryConfig,
}

impl<A: ObjectApi> Vault<A> {
    pub fn new(api: A, retry: RetryConfig) -> Self {
        Self { api, retry }
    }

    fn run_with_retry<T>(
        &self,
        op_name: &str,
        key: &str,
        op: impl Fn(&A) -> std::result::Result<T, StoreError>,
    ) -> Result<T> {
        let mut backoff = Backoff::new(&self.retry);
        let mut denied_once = false;

        loop {
            let err = match op(&self.api) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match err {
                StoreError::NoSuchKey => {
                    return Err(IcevaultError::NoSuchKey(key.to_string()));
                }
                StoreError::AccessDenied(msg) => {
                    if self.api.credential_kind() == CredentialKind::Default {
                        info!(op = op_name, key, "vault access denied, refreshing credential");
                        let credential = self.api.fresh_credential()?;
                        self.api.apply_credential(credential)?;
                    } else if !denied_once {
                        denied_once = true;
                        warn!(op = op_name, key, "vault access denied, retrying once");
                        std::thread::sleep(retry::denied_retry_delay());
                        continue;
                    } else {
                        return Err(IcevaultError::AccessDenied(format!(
                            "{op_name} '{key}': {msg}"
                        )));
                    }
                    match backoff.next() {
                        Some(delay) => std::thread::sleep(delay),
                        None => {
                            return Err(IcevaultError::AccessDenied(format!(
                                "{op_name} '{key}': {msg}"
                            )))
                        }
                    }
                }
                StoreError::Transient(msg) => match backoff.next() {
                    Some(delay) => {
                        warn!(
                            op = op_name,
                            key,
                            delay_ms = delay.as_millis() as u64,
                            "vault error, retrying: {msg}"
                        );
                        std::thread::sleep(delay);
                    }
                    None => {
                        return Err(IcevaultError::Vault(format!(
                            "{op_name} '{key}': retry budget exhausted: {msg}"
                        )))
                    }
                },
                StoreError::Permanent(msg) => {
                    return Err(IcevaultError::Vault(format!("{op_name} '{key}': {msg}")));
                }
            }
        }
    }
}

impl<A: ObjectApi> StorageVault for Vault<A> {
    fn head_object(&self, key: &str) -> Result<HeadOutcome> {
        self.run_with_retry("head", key, |api| api.head(key))
    }

    fn verify_object(&self, key: &str) -> Result<VerifyOutcome> {
        let head = self.head_object(key)?;
        let integrity = head.exists
            && head
                .etag
                .as_deref()
                .is_some_and(|etag| etag.contains(key));
        Ok(VerifyOutcome {
            exists: head.exists,
            integrity,
            etag: head.etag,
        })
    }

    fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        let pre = self.verify_object(key)?;
        if pre.exists && pre.integrity {
            debug!(key, "object already present with integrity, skipping put");
            return Ok(());
        }

        self.run_with_retry("put", key, |api| api.put(key, data))?;

        if is_manifest_key(key) {
            return Ok(());
        }

        let post = self.verify_object(key)?;
        if post.exists && !post.integrity {
            warn!(
                key,
                etag = post.etag.as_deref().unwrap_or(""),
                "stored object failed the integrity check, re-putting"
            );
            self.run_with_retry("put", key, |api| api.put(key, data))?;
        }
        Ok(())
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        self.run_with_retry("get", key, |api| api.get(key))
    }

    fn refresh_credential(&self, credential: crate::control::Credential) -> Result<()> {
        self.api.apply_credential(credential)
    }
}
