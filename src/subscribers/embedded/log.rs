//! # LogWriter: renders supervisor events through `tracing`
//!
//! Crashes, forced kills and heartbeat timeouts are warnings; worker error
//! reports are errors; the rest is info or debug.
//!
//! ## Example output (compact format)
//! ```text
//! INFO  worker spawned worker_id=1 pid=4242 restart_count=0
//! WARN  worker exited unexpectedly; respawning worker_id=2 pid=4243 restart_count=1 status=signal: 9 (SIGKILL)
//! WARN  heartbeat timeout; terminating worker_id=3 pid=4244 age_ms=61020
//! INFO  shutdown requested
//! INFO  all workers stopped within grace
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let reason = e.reason.as_deref().unwrap_or("");
        match e.kind {
            EventKind::WorkerSpawned => tracing::info!(
                worker_id = e.worker_id,
                pid = e.pid,
                restart_count = e.restart_count,
                "worker spawned"
            ),
            EventKind::SpawnFailed => tracing::error!(
                worker_id = e.worker_id,
                error = reason,
                "failed to spawn worker"
            ),
            EventKind::WorkerExited => tracing::info!(
                worker_id = e.worker_id,
                pid = e.pid,
                status = reason,
                "worker exited"
            ),
            EventKind::WorkerCrashed => tracing::warn!(
                worker_id = e.worker_id,
                pid = e.pid,
                restart_count = e.restart_count,
                status = reason,
                "worker exited unexpectedly; respawning"
            ),
            EventKind::RespawnScheduled => tracing::info!(
                worker_id = e.worker_id,
                restart_count = e.restart_count,
                delay_ms = e.delay_ms,
                "respawn delayed by backoff"
            ),
            EventKind::SlotRetired => tracing::error!(
                worker_id = e.worker_id,
                restart_count = e.restart_count,
                "restart limit reached; slot retired"
            ),
            EventKind::StatusChanged => tracing::debug!(
                worker_id = e.worker_id,
                pid = e.pid,
                status = e.status.map(|s| s.as_label()),
                "worker status changed"
            ),
            EventKind::WorkerErrorReported => tracing::error!(
                worker_id = e.worker_id,
                pid = e.pid,
                error = reason,
                "worker reported error"
            ),
            EventKind::HeartbeatTimeout => tracing::warn!(
                worker_id = e.worker_id,
                pid = e.pid,
                age_ms = e.delay_ms,
                "heartbeat timeout; terminating"
            ),
            EventKind::ForceKilled => tracing::warn!(
                worker_id = e.worker_id,
                pid = e.pid,
                cause = reason,
                "worker force-killed"
            ),
            EventKind::ShutdownRequested => tracing::info!("shutdown requested"),
            EventKind::AllStoppedWithin => tracing::info!("all workers stopped within grace"),
            EventKind::GraceExceeded => {
                tracing::warn!(stuck = reason, "grace exceeded; killing remaining workers")
            }
            EventKind::ReloadRequested => tracing::info!("reload requested"),
            EventKind::ReloadApplied => tracing::info!("configuration reloaded"),
            EventKind::ReloadFailed => {
                tracing::error!(error = reason, "reload failed; keeping previous configuration")
            }
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked => {
                tracing::warn!(detail = reason, kind = ?e.kind, "subscriber problem")
            }
        }
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}
