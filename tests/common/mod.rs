#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use procvisor::config::Config;
use procvisor::substrate::{Role, Substrate};
use procvisor::{Event, EventKind, Subscribe};

static NEXT: AtomicU32 = AtomicU32::new(0);

/// Namespace unique to this process and call, so tests can run in parallel.
pub fn unique_namespace(prefix: &str) -> String {
    format!("{prefix}{}-{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Fast timings suitable for tests.
pub fn test_config(dir: &Path, workers: u32) -> Config {
    let mut cfg = Config::default();
    cfg.supervisor.workers = workers;
    cfg.supervisor.tick_ms = 50;
    cfg.supervisor.heartbeat_timeout_ms = 2_000;
    cfg.supervisor.grace_ms = 3_000;
    cfg.supervisor.kill_grace_ms = 1_000;
    cfg.substrate.runtime_dir = dir.to_path_buf();
    cfg.substrate.namespace = unique_namespace("pvit");
    cfg
}

pub fn observer(cfg: &Config) -> Substrate {
    Substrate::attach(cfg.substrate.options(), Role::Observer).unwrap()
}

/// Polls `check` every 20ms until it returns true or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Subscriber keeping every event it sees.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.kind == kind).count()
    }

    pub fn count_for(&self, kind: EventKind, worker_id: u32) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind && e.worker_id == Some(worker_id))
            .count()
    }

    pub fn first(&self, kind: EventKind, worker_id: u32) -> Option<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.kind == kind && e.worker_id == Some(worker_id))
            .cloned()
    }
}

#[async_trait]
impl Subscribe for Recorder {
    async fn on_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn name(&self) -> &'static str {
        "recorder"
    }

    fn queue_capacity(&self) -> usize {
        4096
    }
}
