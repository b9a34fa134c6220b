use std::sync::{Condvar, Mutex};

// ---------------------------------------------------------------------------
// Counted semaphore — gates the restore engine's per-item tasks
// ---------------------------------------------------------------------------

pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    freed: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        debug_assert!(permits > 0, "semaphore needs at least one permit");
        Self {
            permits: Mutex::new(permits),
            freed: Condvar::new(),
        }
    }

    /// Block until a permit is available. The permit is released when the
    /// returned guard drops.
    pub(crate) fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        while *permits == 0 {
            permits = self
                .freed
                .wait(permits)
                .unwrap_or_else(|e| e.into_inner());
        }
        *permits -= 1;
        SemaphoreGuard { semaphore: self }
    }

    fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *permits += 1;
        self.freed.notify_one();
    }
}

pub(crate) struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

// ---------------------------------------------------------------------------
// Job tracker — lets a file wait for its outstanding chunk uploads
// ---------------------------------------------------------------------------

pub(crate) struct JobTracker {
    outstanding: Mutex<usize>,
    done: Condvar,
}

impl JobTracker {
    pub(crate) fn new() -> Self {
        Self {
            outstanding: Mutex::new(0),
            done: Condvar::new(),
        }
    }

    pub(crate) fn add(&self) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        *outstanding += 1;
    }

    pub(crate) fn finish(&self) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.done.notify_all();
        }
    }

    /// Block until every added job has finished.
    pub(crate) fn wait(&self) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        while *outstanding > 0 {
            outstanding = self
                .done
                .wait(outstanding)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}
