//! # Lifecycle events emitted by the supervisor.
//!
//! The [`EventKind`] enum classifies events in four groups:
//! - **Slot events**: spawn, crash, respawn, retirement of worker slots
//! - **Liveness events**: heartbeat timeouts and forced kills
//! - **Control events**: shutdown and reload progress
//! - **Subscriber events**: overflow and panics inside subscribers
//!
//! The [`Event`] struct carries the optional metadata (worker id, pid, restart
//! count, delay, status, reason) relevant to its kind.
//!
//! ## Ordering guarantees
//! Each event has a process-wide unique sequence number (`seq`) that increases
//! monotonically; use it to restore order after fan-out.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use procvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::WorkerCrashed)
//!     .with_worker(2)
//!     .with_pid(4242)
//!     .with_restart_count(1)
//!     .with_reason("exit status: 1");
//!
//! assert_eq!(ev.kind, EventKind::WorkerCrashed);
//! assert_eq!(ev.worker_id, Some(2));
//! assert_eq!(ev.reason.as_deref(), Some("exit status: 1"));
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::substrate::ProcessStatus;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of supervisor events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked while handling an event.
    ///
    /// Sets: `reason` (subscriber name and panic info)
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets: `reason` (subscriber name and cause)
    SubscriberOverflow,

    // === Slot events ===
    /// A worker process was started for a slot.
    ///
    /// Sets: `worker_id`, `pid`, `restart_count`
    WorkerSpawned,

    /// Starting a worker process failed.
    ///
    /// Sets: `worker_id`, `reason`
    SpawnFailed,

    /// A worker exited while the supervisor was shutting down.
    ///
    /// Sets: `worker_id`, `pid`, `reason` (exit status)
    WorkerExited,

    /// A worker exited while the supervisor was running; it will be respawned
    /// unless the slot is retired.
    ///
    /// Sets: `worker_id`, `pid`, `restart_count` (after increment), `reason`
    WorkerCrashed,

    /// Respawn of a crashed slot deferred by backoff.
    ///
    /// Sets: `worker_id`, `restart_count`, `delay_ms`
    RespawnScheduled,

    /// Slot exceeded its restart ceiling and is no longer managed.
    ///
    /// Sets: `worker_id`, `restart_count`
    SlotRetired,

    /// A worker reported a status transition.
    ///
    /// Sets: `worker_id`, `pid`, `status`
    StatusChanged,

    /// A worker sent an error report.
    ///
    /// Sets: `worker_id`, `pid`, `reason`
    WorkerErrorReported,

    // === Liveness events ===
    /// A `Running` worker missed its heartbeat deadline and was sent SIGTERM.
    ///
    /// Sets: `worker_id`, `pid`, `delay_ms` (heartbeat age)
    HeartbeatTimeout,

    /// A worker was sent SIGKILL (shutdown grace exceeded, or SIGTERM ignored
    /// after a heartbeat timeout).
    ///
    /// Sets: `worker_id`, `pid`, `reason`
    ForceKilled,

    // === Control events ===
    /// Shutdown requested (signal, message or handle).
    ShutdownRequested,

    /// Every worker exited within the grace window.
    AllStoppedWithin,

    /// Grace window elapsed with workers still alive.
    ///
    /// Sets: `reason` (stuck worker ids)
    GraceExceeded,

    /// Reload requested.
    ReloadRequested,

    /// New configuration applied and workers signalled.
    ReloadApplied,

    /// Reload failed; the previous configuration stays in effect.
    ///
    /// Sets: `reason`
    ReloadFailed,
}

/// Supervisor event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    pub kind: EventKind,

    /// Worker slot, if applicable.
    pub worker_id: Option<u32>,
    /// OS pid of the worker incarnation, if applicable.
    pub pid: Option<u32>,
    pub restart_count: Option<u32>,
    /// Delay or age in milliseconds (compact).
    pub delay_ms: Option<u32>,
    pub status: Option<ProcessStatus>,
    /// Human-readable detail (exit status, error text, ...).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates an event of the given kind with the current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            worker_id: None,
            pid: None,
            restart_count: None,
            delay_ms: None,
            status: None,
            reason: None,
        }
    }

    #[inline]
    pub fn with_worker(mut self, worker_id: u32) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    #[inline]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    #[inline]
    pub fn with_restart_count(mut self, n: u32) -> Self {
        self.restart_count = Some(n);
        self
    }

    /// Attaches a delay (stored as milliseconds, saturating).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(d.as_millis().min(u128::from(u32::MAX)) as u32);
        self
    }

    #[inline]
    pub fn with_status(mut self, status: ProcessStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_reason(format!("subscriber={subscriber} info={info}"))
    }

    /// True for events about subscribers themselves.
    #[inline]
    pub fn is_subscriber_event(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked
        )
    }
}
