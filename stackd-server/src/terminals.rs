//! Process-wide count of live PTY sessions.
//!
//! While at least one session is active the reconciler must not rewrite
//! manifests, so the counter gates every tick. Decrement happens through a
//! guard whose release is idempotent: both explicit teardown and `Drop` may
//! fire, the counter moves exactly once.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ActiveTerminals {
    count: AtomicI64,
}

impl ActiveTerminals {
    #[must_use]
    pub fn active(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Register a new session. The returned guard decrements on release or
    /// drop, whichever comes first.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> TerminalGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        TerminalGuard {
            terminals: Arc::clone(self),
            released: AtomicBool::new(false),
        }
    }
}

#[derive(Debug)]
pub struct TerminalGuard {
    terminals: Arc<ActiveTerminals>,
    released: AtomicBool,
}

impl TerminalGuard {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.terminals.count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.release();
    }
}
