use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{IcevaultError, Result};

/// Explicit cancellation scope threaded through every task.
///
/// Scopes nest: the backup/restore session owns the root, each file owns a
/// child. Cancelling a scope is observed by all of its descendants;
/// cancelling a child never affects the parent or siblings.
#[derive(Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    cancelled: AtomicBool,
    parent: Option<Arc<ScopeInner>>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                cancelled: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// Create a child scope that observes this scope's cancellation.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                cancelled: AtomicBool::new(false),
                parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut cursor = Some(&self.inner);
        while let Some(scope) = cursor {
            if scope.cancelled.load(Ordering::Acquire) {
                return true;
            }
            cursor = scope.parent.as_ref();
        }
        false
    }

    /// Surface the canonical cancellation failure if the scope is closed.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(IcevaultError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_observes_parent_cancellation() {
        let root = CancelScope::new();
        let child = root.child();
        let grandchild = child.child();

        assert!(!grandchild.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_cancellation_stays_local() {
        let root = CancelScope::new();
        let a = root.child();
        let b = root.child();

        a.cancel();
        assert!(a.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[test]
    fn check_returns_the_sentinel() {
        let scope = CancelScope::new();
        assert!(scope.check().is_ok());
        scope.cancel();
        assert!(scope.check().unwrap_err().is_cancelled());
    }

    #[test]
    fn clones_share_the_same_flag() {
        let scope = CancelScope::new();
        let other = scope.clone();
        other.cancel();
        assert!(scope.is_cancelled());
    }
}
