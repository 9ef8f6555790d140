//! # In-process control flags.
//!
//! Signal listeners and external callers only ever *set* these flags; the main
//! loop of the supervisor or worker polls them and wakes on [`ControlFlags::changed`].

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Shutdown and reload requests for the current process.
#[derive(Debug, Default)]
pub struct ControlFlags {
    shutdown: AtomicBool,
    reload: AtomicBool,
    notify: Notify,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. Idempotent; returns `true` only for the first request.
    pub fn request_shutdown(&self) -> bool {
        let first = !self.shutdown.swap(true, Ordering::SeqCst);
        self.notify.notify_one();
        first
    }

    /// Requests a configuration reload. Repeated requests before the loop
    /// consumes the flag collapse into one.
    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Consumes a pending reload request.
    #[inline]
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    /// Resolves after the next request (or immediately if one arrived since the
    /// last call).
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}
