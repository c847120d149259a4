//! Cooperative abort signalling.
//!
//! A single [`AbortSignal`] is shared by the operator surface, the sweep
//! executor and the stabilization loop. It is only ever polled; nothing
//! interrupts an in-flight hardware call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Shared cancellation flag with an optional human-readable reason.
#[derive(Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
    reason: Arc<RwLock<Option<String>>>,
}

impl AbortSignal {
    /// Create a cleared signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn set(&self, reason: impl Into<String>) {
        self.flag.store(true, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.write() {
            *r = Some(reason.into());
        }
    }

    /// Check whether cancellation has been requested.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Reason passed to the last [`set`](Self::set), if any.
    pub fn reason(&self) -> Option<String> {
        self.reason.read().ok().and_then(|r| r.clone())
    }

    /// Clear the flag. Only top-level measurements do this, at their start.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.write() {
            *r = None;
        }
    }

    /// True when both handles refer to the same underlying flag.
    pub fn same_as(&self, other: &AbortSignal) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("set", &self.is_set())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_are_visible_through_clones() {
        let signal = AbortSignal::new();
        let remote = signal.clone();

        assert!(!signal.is_set());
        remote.set("operator pressed stop");
        assert!(signal.is_set());
        assert_eq!(signal.reason().as_deref(), Some("operator pressed stop"));
        assert!(signal.same_as(&remote));

        signal.clear();
        assert!(!remote.is_set());
        assert!(remote.reason().is_none());
    }

    #[test]
    fn independent_signals_do_not_share_state() {
        let a = AbortSignal::new();
        let b = AbortSignal::new();
        a.set("stop");
        assert!(!b.is_set());
        assert!(!a.same_as(&b));
    }
}
