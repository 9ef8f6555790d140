//! # Shared-state data model.
//!
//! [`SharedState`] is the single value that lives in the shared region. It is only
//! ever touched through [`Substrate::with_lock`](crate::substrate::Substrate::with_lock)
//! or [`Substrate::read`](crate::substrate::Substrate::read), so every reader sees
//! either the state before or after a mutation, never a half-written record.
//!
//! ## Rules
//! - At most one [`ProcessRecord`] per `worker_id`.
//! - `records.len() <= capacity`.
//! - [`GlobalStatistics`] counters never decrease; they are only ever increased by
//!   [`GlobalStatistics::merge`].
//! - Timestamps are unix milliseconds so that every process agrees on them.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::SubstrateError;

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Lifecycle status of a worker process as seen in the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ProcessStatus {
    /// `Stopped` is the only terminal status; every other status belongs to a live process.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessStatus::Stopped)
    }

    /// Returns a short stable label for logs.
    pub fn as_label(self) -> &'static str {
        match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Error => "error",
        }
    }
}

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// OS process id of the current incarnation.
    pub pid: u32,
    /// Stable slot index, `1..=N`.
    pub worker_id: u32,
    pub status: ProcessStatus,
    /// Unix millis when this incarnation was spawned.
    pub started_at: u64,
    /// Unix millis of the last heartbeat observed for this incarnation.
    pub last_heartbeat_at: u64,
    /// How many times this slot has been respawned.
    pub restart_count: u32,
}

impl ProcessRecord {
    /// Fresh record for a just-spawned process.
    pub fn starting(worker_id: u32, pid: u32, restart_count: u32) -> Self {
        let now = now_millis();
        Self {
            pid,
            worker_id,
            status: ProcessStatus::Starting,
            started_at: now,
            last_heartbeat_at: now,
            restart_count,
        }
    }

    /// Time since the last heartbeat, relative to `now` (unix millis).
    #[inline]
    pub fn heartbeat_age(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.last_heartbeat_at))
    }
}

/// Increment of worker counters since the worker's previous report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub messages_processed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub errors: u64,
}

impl StatsSnapshot {
    /// True when nothing happened since the last report.
    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == StatsSnapshot::default()
    }
}

/// Aggregate counters across every worker of this supervisor lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStatistics {
    pub messages_processed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    /// Unix millis of the last merge.
    pub last_update: u64,
}

impl GlobalStatistics {
    /// Adds a worker increment (saturating).
    pub fn merge(&mut self, delta: &StatsSnapshot, now: u64) {
        self.messages_processed = self
            .messages_processed
            .saturating_add(delta.messages_processed);
        self.bytes_received = self.bytes_received.saturating_add(delta.bytes_received);
        self.bytes_sent = self.bytes_sent.saturating_add(delta.bytes_sent);
        self.errors = self.errors.saturating_add(delta.errors);
        self.last_update = self.last_update.max(now);
    }
}

/// Contents of the shared region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedState {
    /// Maximum number of records (the effective worker count).
    pub capacity: usize,
    /// Process table, at most one row per slot.
    pub records: Vec<ProcessRecord>,
    pub stats: GlobalStatistics,
    pub shutdown_requested: bool,
    pub reload_requested: bool,
    /// Pid of the supervisor that created the region.
    pub supervisor_pid: u32,
    /// Unix millis when the region was created.
    pub created_at: u64,
    /// Bumped on every reload.
    pub config_version: u64,
}

impl SharedState {
    /// Empty table for a supervisor with `capacity` slots.
    pub fn new(capacity: usize, supervisor_pid: u32) -> Self {
        Self {
            capacity,
            records: Vec::with_capacity(capacity),
            stats: GlobalStatistics::default(),
            shutdown_requested: false,
            reload_requested: false,
            supervisor_pid,
            created_at: now_millis(),
            config_version: 0,
        }
    }

    /// Inserts `record` or replaces the existing record of the same slot.
    ///
    /// Fails with [`SubstrateError::TableFull`] when the slot is new and the table
    /// is at capacity.
    pub fn upsert(&mut self, record: ProcessRecord) -> Result<(), SubstrateError> {
        if let Some(existing) = self.slot_mut(record.worker_id) {
            *existing = record;
            return Ok(());
        }
        if self.records.len() >= self.capacity {
            return Err(SubstrateError::TableFull {
                capacity: self.capacity,
            });
        }
        self.records.push(record);
        self.records.sort_by_key(|r| r.worker_id);
        Ok(())
    }

    /// Removes the record of a slot, returning it.
    pub fn remove_slot(&mut self, worker_id: u32) -> Option<ProcessRecord> {
        let idx = self.records.iter().position(|r| r.worker_id == worker_id)?;
        Some(self.records.remove(idx))
    }

    /// Removes the record owned by `pid`, returning it.
    pub fn remove_pid(&mut self, pid: u32) -> Option<ProcessRecord> {
        let idx = self.records.iter().position(|r| r.pid == pid)?;
        Some(self.records.remove(idx))
    }

    pub fn slot(&self, worker_id: u32) -> Option<&ProcessRecord> {
        self.records.iter().find(|r| r.worker_id == worker_id)
    }

    pub fn slot_mut(&mut self, worker_id: u32) -> Option<&mut ProcessRecord> {
        self.records.iter_mut().find(|r| r.worker_id == worker_id)
    }

    /// Record of `worker_id` if it belongs to the incarnation `pid`.
    pub fn incarnation_mut(&mut self, worker_id: u32, pid: u32) -> Option<&mut ProcessRecord> {
        self.records
            .iter_mut()
            .find(|r| r.worker_id == worker_id && r.pid == pid)
    }

    /// Number of records whose status is not terminal.
    pub fn live_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .count()
    }

    /// Number of records per status label, for summaries.
    pub fn status_counts(&self) -> [(ProcessStatus, usize); 5] {
        let count = |s: ProcessStatus| self.records.iter().filter(|r| r.status == s).count();
        [
            (ProcessStatus::Starting, count(ProcessStatus::Starting)),
            (ProcessStatus::Running, count(ProcessStatus::Running)),
            (ProcessStatus::Stopping, count(ProcessStatus::Stopping)),
            (ProcessStatus::Stopped, count(ProcessStatus::Stopped)),
            (ProcessStatus::Error, count(ProcessStatus::Error)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_keeps_one_record_per_slot() {
        let mut st = SharedState::new(2, 1);
        st.upsert(ProcessRecord::starting(1, 100, 0)).unwrap();
        st.upsert(ProcessRecord::starting(1, 101, 1)).unwrap();

        assert_eq!(st.records.len(), 1);
        let rec = st.slot(1).unwrap();
        assert_eq!(rec.pid, 101);
        assert_eq!(rec.restart_count, 1);
    }

    #[test]
    fn upsert_rejects_new_slot_when_full() {
        let mut st = SharedState::new(1, 1);
        st.upsert(ProcessRecord::starting(1, 100, 0)).unwrap();
        let err = st.upsert(ProcessRecord::starting(2, 200, 0)).unwrap_err();
        assert!(matches!(err, SubstrateError::TableFull { capacity: 1 }));
    }

    #[test]
    fn records_stay_sorted_by_slot() {
        let mut st = SharedState::new(3, 1);
        st.upsert(ProcessRecord::starting(3, 300, 0)).unwrap();
        st.upsert(ProcessRecord::starting(1, 100, 0)).unwrap();
        st.upsert(ProcessRecord::starting(2, 200, 0)).unwrap();
        let ids: Vec<u32> = st.records.iter().map(|r| r.worker_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn live_count_ignores_stopped() {
        let mut st = SharedState::new(3, 1);
        st.upsert(ProcessRecord::starting(1, 100, 0)).unwrap();
        st.upsert(ProcessRecord::starting(2, 200, 0)).unwrap();
        st.slot_mut(2).unwrap().status = ProcessStatus::Stopped;
        assert_eq!(st.live_count(), 1);

        assert!(st.remove_pid(100).is_some());
        assert!(st.remove_pid(100).is_none());
        assert_eq!(st.live_count(), 0);
    }

    #[test]
    fn incarnation_lookup_checks_pid() {
        let mut st = SharedState::new(1, 1);
        st.upsert(ProcessRecord::starting(1, 100, 0)).unwrap();
        assert!(st.incarnation_mut(1, 99).is_none());
        assert!(st.incarnation_mut(1, 100).is_some());
    }

    #[test]
    fn statistics_are_monotonic() {
        let mut stats = GlobalStatistics::default();
        stats.merge(
            &StatsSnapshot {
                messages_processed: 10,
                bytes_received: 100,
                bytes_sent: 50,
                errors: 1,
            },
            1_000,
        );
        stats.merge(&StatsSnapshot::default(), 500);
        stats.merge(
            &StatsSnapshot {
                messages_processed: u64::MAX,
                ..StatsSnapshot::default()
            },
            2_000,
        );

        assert_eq!(stats.messages_processed, u64::MAX);
        assert_eq!(stats.bytes_received, 100);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.last_update, 2_000);
    }

    #[test]
    fn heartbeat_age_saturates() {
        let mut rec = ProcessRecord::starting(1, 1, 0);
        rec.last_heartbeat_at = 5_000;
        assert_eq!(rec.heartbeat_age(4_000), Duration::ZERO);
        assert_eq!(rec.heartbeat_age(7_500), Duration::from_millis(2_500));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ProcessStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        assert!(ProcessStatus::Stopped.is_terminal());
        assert!(!ProcessStatus::Error.is_terminal());
    }
}
