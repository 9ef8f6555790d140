//! # OS signal handling.
//!
//! [`spawn_listener`] installs handlers and forwards signals into
//! [`ControlFlags`]; nothing else happens in signal context.
//!
//! | signal                     | effect                 |
//! |----------------------------|------------------------|
//! | `SIGTERM`, `SIGINT`, `SIGQUIT` | `request_shutdown()` |
//! | `SIGHUP`                   | `request_reload()`     |
//!
//! Child exits are observed by polling `try_wait` in the supervisor loop, so
//! `SIGCHLD` needs no handler.

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::substrate::ControlFlags;

/// Installs the handlers and spawns the forwarding task; it ends when `token` is
/// cancelled. Fails if any handler cannot be registered.
pub fn spawn_listener(
    flags: Arc<ControlFlags>,
    token: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = token.cancelled() => break,
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
                _ = sigquit.recv() => "SIGQUIT",
                _ = sighup.recv() => {
                    tracing::info!(signal = "SIGHUP", "reload signal received");
                    flags.request_reload();
                    continue;
                }
            };
            if flags.request_shutdown() {
                tracing::info!(signal = name, "termination signal received");
            } else {
                tracing::debug!(signal = name, "termination signal repeated");
            }
        }
    }))
}
