mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;

use common::{eventually, observer, test_config, Recorder};
use procvisor::config::Config;
use procvisor::substrate::{now_millis, ControlMessage, ProcessStatus, Target};
use procvisor::{EventKind, ExecLauncher, FnLauncher, Subscribe, Supervisor, EXIT_ALL_RETIRED};

fn sleeper(_id: u32) -> Command {
    let mut cmd = Command::new("sleep");
    cmd.arg("30");
    cmd
}

/// Slot 2 ignores SIGTERM; the others do not.
fn one_wedged(id: u32) -> Command {
    if id == 2 {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("trap '' TERM; exec sleep 30");
        cmd
    } else {
        sleeper(id)
    }
}

fn start(
    cfg: Config,
    launcher: impl procvisor::Launcher,
) -> (
    Arc<Recorder>,
    procvisor::SupervisorHandle,
    tokio::task::JoinHandle<Result<i32, procvisor::RuntimeError>>,
) {
    let rec = Arc::new(Recorder::default());
    let subs: Vec<Arc<dyn Subscribe>> = vec![rec.clone()];
    let sup = Supervisor::builder(cfg)
        .with_launcher(launcher)
        .with_subscribers(subs)
        .with_os_signals(false)
        .build()
        .unwrap();
    let handle = sup.handle();
    let join = tokio::spawn(sup.run());
    (rec, handle, join)
}

fn pid_of(cfg: &Config, worker_id: u32) -> Option<u32> {
    observer(cfg)
        .read(|st| st.slot(worker_id).map(|r| r.pid))
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_worker_is_respawned_in_its_slot() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), 2);
    let (rec, handle, join) = start(cfg.clone(), FnLauncher::new(sleeper));

    assert!(eventually(Duration::from_secs(5), || rec.count(EventKind::WorkerSpawned) == 2).await);
    let old_pid = pid_of(&cfg, 1).unwrap();
    let other_pid = pid_of(&cfg, 2).unwrap();

    kill(Pid::from_raw(old_pid as i32), Signal::SIGKILL).unwrap();

    let respawned = eventually(Duration::from_secs(5), || {
        observer(&cfg)
            .read(|st| st.slot(1).is_some_and(|r| r.pid != old_pid && r.restart_count == 1))
            .unwrap()
    })
    .await;
    assert!(respawned, "slot 1 was not respawned");

    let st = observer(&cfg).snapshot().unwrap();
    assert_eq!(st.records.len(), 2);
    assert_eq!(st.slot(2).unwrap().pid, other_pid);
    assert_eq!(st.slot(2).unwrap().restart_count, 0);
    assert_eq!(st.live_count(), 2);

    let crash = rec.first(EventKind::WorkerCrashed, 1).unwrap();
    assert_eq!(crash.pid, Some(old_pid));
    assert_eq!(crash.restart_count, Some(1));

    handle.request_shutdown();
    let code = tokio::time::timeout(Duration::from_secs(10), join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(code, 0);
    assert_eq!(rec.count(EventKind::ForceKilled), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_worker_is_terminated_and_respawned() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), 3);
    cfg.supervisor.tick_ms = 100;
    cfg.supervisor.heartbeat_timeout_ms = 2_000;
    let (rec, handle, join) = start(cfg.clone(), FnLauncher::new(sleeper));

    assert!(eventually(Duration::from_secs(5), || rec.count(EventKind::WorkerSpawned) == 3).await);
    let frozen_pid = pid_of(&cfg, 2).unwrap();

    // Slot 2 claims to run but its last heartbeat is well past the timeout.
    observer(&cfg)
        .with_lock(|st| {
            let record = st.slot_mut(2).unwrap();
            record.status = ProcessStatus::Running;
            record.last_heartbeat_at = now_millis() - 10_000;
        })
        .unwrap();
    let marked = Instant::now();

    assert!(
        eventually(Duration::from_secs(3), || {
            rec.count_for(EventKind::HeartbeatTimeout, 2) == 1
        })
        .await
    );
    assert!(marked.elapsed() < Duration::from_secs(1), "timeout not detected within one sweep");

    let timeout = rec.first(EventKind::HeartbeatTimeout, 2).unwrap();
    assert_eq!(timeout.pid, Some(frozen_pid));

    let respawned = eventually(Duration::from_secs(5), || {
        observer(&cfg)
            .read(|st| st.slot(2).is_some_and(|r| r.pid != frozen_pid && r.restart_count == 1))
            .unwrap()
    })
    .await;
    assert!(respawned);
    assert_eq!(rec.count_for(EventKind::HeartbeatTimeout, 1), 0);
    assert_eq!(rec.count_for(EventKind::HeartbeatTimeout, 3), 0);
    assert_eq!(rec.count(EventKind::ForceKilled), 0);

    handle.request_shutdown();
    let code = tokio::time::timeout(Duration::from_secs(10), join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(code, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_of_responsive_workers_needs_no_force() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), 3);
    let (rec, handle, join) = start(cfg.clone(), FnLauncher::new(sleeper));

    assert!(eventually(Duration::from_secs(5), || rec.count(EventKind::WorkerSpawned) == 3).await);

    let started = Instant::now();
    handle.request_shutdown();
    handle.request_shutdown();
    let code = tokio::time::timeout(Duration::from_secs(10), join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(code, 0);
    assert!(started.elapsed() < cfg.supervisor.grace());
    assert_eq!(rec.count(EventKind::ShutdownRequested), 1);
    assert_eq!(rec.count(EventKind::WorkerExited), 3);
    assert_eq!(rec.count(EventKind::AllStoppedWithin), 1);
    assert_eq!(rec.count(EventKind::GraceExceeded), 0);
    assert_eq!(rec.count(EventKind::ForceKilled), 0);
    assert_eq!(rec.count(EventKind::WorkerCrashed), 0);

    let gone = procvisor::Substrate::attach(cfg.substrate.options(), procvisor::substrate::Role::Observer);
    assert!(gone.err().unwrap().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wedged_worker_is_force_killed_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), 3);
    cfg.supervisor.grace_ms = 1_000;
    cfg.supervisor.kill_grace_ms = 1_000;
    let (rec, handle, join) = start(cfg.clone(), FnLauncher::new(one_wedged));

    assert!(eventually(Duration::from_secs(5), || rec.count(EventKind::WorkerSpawned) == 3).await);
    // Let the shell install its trap before it is tested.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let started = Instant::now();
    handle.request_shutdown();
    let code = tokio::time::timeout(Duration::from_secs(10), join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let took = started.elapsed();

    assert_eq!(code, 0);
    assert!(took >= cfg.supervisor.grace());
    assert!(took < cfg.supervisor.grace() + cfg.supervisor.kill_grace() + Duration::from_millis(500));
    assert_eq!(rec.count(EventKind::GraceExceeded), 1);
    assert_eq!(rec.count(EventKind::ForceKilled), 1);
    assert_eq!(rec.count_for(EventKind::ForceKilled, 2), 1);
    assert_eq!(rec.count(EventKind::WorkerExited), 3);
    assert_eq!(rec.count(EventKind::AllStoppedWithin), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slots_past_their_restart_limit_are_retired() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), 2);
    cfg.supervisor.respawn.max_restarts = 2;
    let failing = FnLauncher::new(|_| Command::new("false"));
    let (rec, _handle, join) = start(cfg.clone(), failing);

    let code = tokio::time::timeout(Duration::from_secs(10), join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(code, EXIT_ALL_RETIRED);
    for id in [1, 2] {
        assert_eq!(rec.count_for(EventKind::WorkerSpawned, id), 3);
        assert_eq!(rec.count_for(EventKind::WorkerCrashed, id), 3);
        assert_eq!(rec.count_for(EventKind::SlotRetired, id), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backoff_delays_respawn() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), 1);
    cfg.supervisor.respawn.first_delay_ms = 400;
    let (rec, handle, join) = start(cfg.clone(), FnLauncher::new(|_| Command::new("false")));

    assert!(eventually(Duration::from_secs(5), || rec.count(EventKind::RespawnScheduled) >= 1).await);
    let scheduled = rec.first(EventKind::RespawnScheduled, 1).unwrap();
    assert_eq!(scheduled.delay_ms, Some(400));

    // Meanwhile the record is terminal, so it does not count as live.
    let st = observer(&cfg).snapshot().unwrap();
    if let Some(r) = st.slot(1) {
        if rec.count(EventKind::WorkerSpawned) == 1 {
            assert_eq!(r.status, ProcessStatus::Stopped);
        }
    }

    handle.request_shutdown();
    tokio::time::timeout(Duration::from_secs(10), join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_respawn_leaves_no_live_record_behind() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), 1);
    let launches = Arc::new(AtomicU32::new(0));
    let counter = launches.clone();
    // First launch works; every later one points at a missing program.
    let launcher = FnLauncher::new(move |id| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            sleeper(id)
        } else {
            Command::new("/nonexistent/procvisor-worker")
        }
    });
    let (rec, handle, join) = start(cfg.clone(), launcher);

    assert!(eventually(Duration::from_secs(5), || rec.count(EventKind::WorkerSpawned) == 1).await);
    let dead = pid_of(&cfg, 1).unwrap();
    kill(Pid::from_raw(dead as i32), Signal::SIGKILL).unwrap();

    assert!(eventually(Duration::from_secs(5), || rec.count(EventKind::SpawnFailed) >= 1).await);
    let st = observer(&cfg).snapshot().unwrap();
    let record = st.slot(1).unwrap();
    assert_eq!(record.pid, dead);
    assert_eq!(record.status, ProcessStatus::Stopped);
    assert_eq!(record.restart_count, 1);
    assert_eq!(st.live_count(), 0);

    handle.request_shutdown();
    tokio::time::timeout(Duration::from_secs(10), join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_channel_shutdown_and_stale_messages() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), 1);
    let (rec, _handle, join) = start(cfg.clone(), FnLauncher::new(sleeper));

    assert!(eventually(Duration::from_secs(5), || rec.count(EventKind::WorkerSpawned) == 1).await);

    let obs = observer(&cfg);
    // Sent from a pid that is not slot 1's incarnation: dropped.
    obs.send(
        &ControlMessage::error_report(1, "not from the worker"),
        Target::Supervisor,
    )
    .unwrap();
    obs.send(&ControlMessage::Shutdown, Target::Supervisor).unwrap();

    let code = tokio::time::timeout(Duration::from_secs(10), join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(code, 0);
    assert_eq!(rec.count(EventKind::WorkerErrorReported), 0);
    assert_eq!(rec.count(EventKind::AllStoppedWithin), 1);
}

/// Real worker processes: the binary re-executed in worker mode.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn real_workers_report_heartbeats_stats_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), 2);
    cfg.worker.heartbeat_interval_ms = 100;
    cfg.worker.stats_interval_ms = 200;
    cfg.worker.flush_interval_ms = 100;
    cfg.worker.feed_interval_ms = 10;
    cfg.worker.batch_size = 10;

    let config_path = dir.path().join("procvisor.toml");
    std::fs::write(&config_path, toml::to_string(&cfg).unwrap()).unwrap();

    let launcher = ExecLauncher::new(env!("CARGO_BIN_EXE_procvisor"), Some(&config_path), &cfg.substrate);
    let rec = Arc::new(Recorder::default());
    let subs: Vec<Arc<dyn Subscribe>> = vec![rec.clone()];
    let sup = Supervisor::builder(cfg.clone())
        .with_config_path(Some(config_path))
        .with_launcher(launcher)
        .with_subscribers(subs)
        .with_os_signals(false)
        .build()
        .unwrap();
    let handle = sup.handle();
    let join = tokio::spawn(sup.run());

    let running = eventually(Duration::from_secs(10), || {
        observer(&cfg)
            .read(|st| {
                st.records.len() == 2
                    && st.records.iter().all(|r| r.status == ProcessStatus::Running)
            })
            .unwrap()
    })
    .await;
    assert!(running, "workers did not reach Running");

    let counted = eventually(Duration::from_secs(10), || {
        observer(&cfg)
            .read(|st| st.stats.messages_processed > 0 && st.stats.bytes_sent > 0)
            .unwrap()
    })
    .await;
    assert!(counted, "no statistics reached the supervisor");

    let before = observer(&cfg).read(|st| st.records.iter().map(|r| r.last_heartbeat_at).min()).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let after = observer(&cfg).read(|st| st.records.iter().map(|r| r.last_heartbeat_at).min()).unwrap();
    assert!(after > before, "heartbeats did not advance");

    handle.request_reload();
    assert!(eventually(Duration::from_secs(5), || rec.count(EventKind::ReloadApplied) == 1).await);
    assert_eq!(observer(&cfg).read(|st| st.config_version).unwrap(), 1);

    handle.request_shutdown();
    let code = tokio::time::timeout(Duration::from_secs(15), join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(code, 0);
    assert_eq!(rec.count(EventKind::ForceKilled), 0);
    assert_eq!(rec.count(EventKind::WorkerCrashed), 0);
    assert_eq!(rec.count(EventKind::AllStoppedWithin), 1);
}
