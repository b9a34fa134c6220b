use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// One progress report from a task.
#[derive(Debug, Default, Clone)]
pub struct Stat {
    /// Completed top-level items.
    pub items: u64,
    /// Logical bytes processed (chunk payload bytes).
    pub bytes: u64,
    /// Bytes that actually hit the storage vault.
    pub storage: u64,
    /// Names of items that hit an error while being processed.
    pub item_names: Vec<String>,
    pub errors: bool,
}

/// Aggregating progress sink shared by all tasks of a session.
///
/// Counters are plain atomics so workers never contend on a lock for the
/// hot path; only error item names take a mutex.
#[derive(Debug, Default)]
pub struct Progress {
    items: AtomicU64,
    bytes: AtomicU64,
    storage: AtomicU64,
    errors: AtomicU64,
    item_names: Mutex<Vec<String>>,
}

/// A point-in-time copy of the sink, sampled by UI consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub items: u64,
    pub bytes: u64,
    pub storage: u64,
    pub errors: u64,
    pub item_names: Vec<String>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, stat: Stat) {
        self.items.fetch_add(stat.items, Ordering::Relaxed);
        self.bytes.fetch_add(stat.bytes, Ordering::Relaxed);
        self.storage.fetch_add(stat.storage, Ordering::Relaxed);
        if stat.errors {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        if !stat.item_names.is_empty() {
            let mut names = self.item_names.lock().unwrap_or_else(|e| e.into_inner());
            names.extend(stat.item_names);
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errors.load(Ordering::Relaxed) > 0
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            items: self.items.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            storage: self.storage.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            item_names: self
                .item_names
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}
