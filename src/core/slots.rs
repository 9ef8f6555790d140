//! # Slot table: the supervisor's private view of its worker processes.
//!
//! The shared process table says what workers report; this table holds what only
//! the parent can know: the child handle used for reaping, restart bookkeeping,
//! pending respawns and outstanding kill escalations.
//!
//! ## Rules
//! - A slot has at most one tracked child; its `pid` is the current incarnation.
//! - `consecutive` counts crashes since the slot last reported `Running`.
//! - A retired slot is never respawned.

use std::process::ExitStatus;

use tokio::process::Child;
use tokio::time::Instant;

/// One worker slot.
#[derive(Debug)]
pub(crate) struct Slot {
    pub worker_id: u32,
    pub child: Option<Child>,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub consecutive: u32,
    /// Pending respawn (backoff or failed spawn).
    pub respawn_at: Option<Instant>,
    /// SIGTERM sent after a heartbeat timeout.
    pub term_sent_at: Option<Instant>,
    pub kill_sent: bool,
    pub retired: bool,
}

impl Slot {
    fn new(worker_id: u32) -> Self {
        Self {
            worker_id,
            child: None,
            pid: None,
            restart_count: 0,
            consecutive: 0,
            respawn_at: None,
            term_sent_at: None,
            kill_sent: false,
            retired: false,
        }
    }

    /// Starts tracking a new incarnation.
    pub fn track(&mut self, child: Child, pid: u32) {
        self.child = Some(child);
        self.pid = Some(pid);
        self.respawn_at = None;
        self.term_sent_at = None;
        self.kill_sent = false;
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.child.is_some()
    }
}

/// A reaped child.
#[derive(Debug)]
pub(crate) struct Exit {
    pub worker_id: u32,
    pub pid: u32,
    /// Exit status, or the reason it could not be read.
    pub status: String,
}

impl Exit {
    fn new(worker_id: u32, pid: u32, status: Result<ExitStatus, std::io::Error>) -> Self {
        let status = match status {
            Ok(s) => s.to_string(),
            Err(e) => format!("unknown ({e})"),
        };
        Self {
            worker_id,
            pid,
            status,
        }
    }
}

/// Slots `1..=count`.
#[derive(Debug)]
pub(crate) struct Slots {
    slots: Vec<Slot>,
}

impl Slots {
    pub fn new(count: u32) -> Self {
        Self {
            slots: (1..=count).map(Slot::new).collect(),
        }
    }

    pub fn get(&self, worker_id: u32) -> Option<&Slot> {
        self.slots.get(worker_id.checked_sub(1)? as usize)
    }

    pub fn get_mut(&mut self, worker_id: u32) -> Option<&mut Slot> {
        self.slots.get_mut(worker_id.checked_sub(1)? as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut()
    }

    /// True if `pid` is the current incarnation of `worker_id`.
    pub fn is_current(&self, worker_id: u32, pid: u32) -> bool {
        self.get(worker_id).and_then(|s| s.pid) == Some(pid)
    }

    /// Number of tracked children.
    pub fn alive(&self) -> usize {
        self.slots.iter().filter(|s| s.is_alive()).count()
    }

    /// Ids of slots with a tracked child.
    pub fn alive_ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|s| s.is_alive())
            .map(|s| s.worker_id)
            .collect()
    }

    pub fn all_retired(&self) -> bool {
        !self.slots.is_empty() && self.slots.iter().all(|s| s.retired)
    }

    /// Collects every child that has exited, without blocking.
    pub fn reap(&mut self) -> Vec<Exit> {
        let mut exits = Vec::new();
        for slot in &mut self.slots {
            let Some(child) = slot.child.as_mut() else {
                continue;
            };
            let status = match child.try_wait() {
                Ok(None) => continue,
                Ok(Some(status)) => Ok(status),
                Err(e) => Err(e),
            };
            let pid = slot.pid.unwrap_or_default();
            slot.child = None;
            slot.pid = None;
            slot.term_sent_at = None;
            slot.kill_sent = false;
            exits.push(Exit::new(slot.worker_id, pid, status));
        }
        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::process::Command;

    #[test]
    fn slots_are_one_based() {
        let slots = Slots::new(3);
        assert!(slots.get(0).is_none());
        assert_eq!(slots.get(1).map(|s| s.worker_id), Some(1));
        assert_eq!(slots.get(3).map(|s| s.worker_id), Some(3));
        assert!(slots.get(4).is_none());
        assert!(!slots.all_retired());
    }

    #[tokio::test]
    async fn reap_collects_exited_children_once() {
        let mut slots = Slots::new(2);
        let child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        slots.get_mut(2).unwrap().track(child, pid);
        assert!(slots.is_current(2, pid));
        assert_eq!(slots.alive_ids(), vec![2]);

        let mut exits = Vec::new();
        for _ in 0..200 {
            exits = slots.reap();
            if !exits.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].worker_id, 2);
        assert_eq!(exits[0].pid, pid);
        assert_eq!(slots.alive(), 0);
        assert!(!slots.is_current(2, pid));
        assert!(slots.reap().is_empty());
    }
}
