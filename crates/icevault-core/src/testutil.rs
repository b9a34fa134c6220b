use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use md5::{Digest, Md5};

use crate::control::Credential;
use crate::error::{IcevaultError, Result};
use crate::storage::{HeadOutcome, StorageVault, VerifyOutcome};

/// In-memory storage vault for tests, with call recording and failure
/// injection. ETags are honest MD5s so the integrity contract holds.
pub(crate) struct MemoryVault {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    put_keys: Mutex<Vec<String>>,
    failing_puts: AtomicUsize,
    missing_gets: Mutex<Vec<String>>,
    refreshes: AtomicUsize,
}

impl MemoryVault {
    pub(crate) fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            put_keys: Mutex::new(Vec::new()),
            failing_puts: AtomicUsize::new(0),
            missing_gets: Mutex::new(Vec::new()),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Keys of every put call, in call order.
    pub(crate) fn put_keys(&self) -> Vec<String> {
        self.put_keys.lock().unwrap().clone()
    }

    /// Fail the next `n` put calls with a vault error.
    pub(crate) fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Make gets of `key` report NoSuchKey even if the object exists.
    pub(crate) fn lose_object(&self, key: &str) {
        self.missing_gets.lock().unwrap().push(key.to_string());
    }

    pub(crate) fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl StorageVault for MemoryVault {
    fn head_object(&self, key: &str) -> Result<HeadOutcome> {
        let objects = self.objects.lock().unwrap();
        Ok(match objects.get(key) {
            Some(body) => HeadOutcome {
                exists: true,
                etag: Some(hex::encode(Md5::digest(body))),
            },
            None => HeadOutcome {
                exists: false,
                etag: None,
            },
        })
    }

    fn verify_object(&self, key: &str) -> Result<VerifyOutcome> {
        let head = self.head_object(key)?;
        let integrity = head.exists && head.etag.as_deref().is_some_and(|e| e.contains(key));
        Ok(VerifyOutcome {
            exists: head.exists,
            integrity,
            etag: head.etag,
        })
    }

    fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        self.put_keys.lock().unwrap().push(key.to_string());
        if self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(IcevaultError::Vault(format!(
                "put '{key}': injected failure"
            )));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        if self.missing_gets.lock().unwrap().iter().any(|k| k == key) {
            return Err(IcevaultError::NoSuchKey(key.to_string()));
        }
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| IcevaultError::NoSuchKey(key.to_string()))
    }

    fn refresh_credential(&self, _credential: Credential) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
