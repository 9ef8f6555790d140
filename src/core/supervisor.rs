//! # Supervisor: spawns worker processes, watches them, respawns and stops them.
//!
//! The [`Supervisor`] owns the substrate (it created it), the slot table with
//! every child handle, and the event [`Bus`] whose events are fanned out to
//! subscribers by a [`SubscriberSet`].
//!
//! ## High-level architecture
//! ```text
//! build():  Substrate::create ─► signal listener (flags) ─► Bus ─► SubscriberSet listener
//!
//! run():
//!   spawn slots 1..=N ──► Launcher::command(i).spawn() ─► ProcessRecord{Starting}
//!
//!   every tick:
//!     1. reap        try_wait() each child ─► crash ─► RespawnPolicy ─► respawn / schedule / retire
//!     2. drain       channel ─► Heartbeat | StatusUpdate | ErrorReport | Statistics | Shutdown | Reload
//!                    (sender pid must be the slot's current pid)
//!     3. sweep       Running && heartbeat age > timeout ─► SIGTERM ─(kill_grace)─► SIGKILL
//!     4. respawn     slots whose backoff elapsed
//!     5. reload      re-read config, bump config_version, SIGHUP workers
//!   every stats_interval: summary log line
//!
//! shutdown:
//!   shutdown_requested = true ─► broadcast Shutdown ─► SIGTERM all
//!     ─► reap until empty or grace ─┬─ AllStoppedWithin
//!                                   └─ GraceExceeded ─► SIGKILL rest ─► reap up to kill_grace
//!     ─► destroy substrate
//! ```
//!
//! ## Rules
//! - Only this process spawns, signals and reaps workers.
//! - Crashes and heartbeat timeouts are events, never errors; `run` fails only on
//!   substrate errors.
//! - No shutdown waits longer than `grace + kill_grace` plus a tick.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::launcher::Launcher;
use super::slots::{Exit, Slots};
use crate::config::Config;
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::policies::{RespawnDecision, RespawnPolicy};
use crate::substrate::{
    now_millis, ControlFlags, ControlMessage, Envelope, MessageFilter, ProcessRecord,
    ProcessStatus, Substrate, Target,
};

/// Exit code when every slot was retired.
pub const EXIT_ALL_RETIRED: i32 = 1;

/// Cloneable remote control for a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    flags: Arc<ControlFlags>,
    bus: Bus,
}

impl SupervisorHandle {
    /// Starts the shutdown protocol. Idempotent.
    pub fn request_shutdown(&self) {
        self.flags.request_shutdown();
    }

    /// Schedules a configuration reload on the next tick.
    pub fn request_reload(&self) {
        self.flags.request_reload();
    }

    /// Receiver of every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }
}

/// Everything the builder assembles.
pub(super) struct Parts {
    pub cfg: Config,
    pub config_path: Option<PathBuf>,
    pub worker_count: u32,
    pub substrate: Substrate,
    pub launcher: Arc<dyn Launcher>,
    pub bus: Bus,
    pub listener: JoinHandle<()>,
    pub token: CancellationToken,
}

/// Parent process of all workers.
pub struct Supervisor {
    cfg: Config,
    config_path: Option<PathBuf>,
    worker_count: u32,
    substrate: Substrate,
    launcher: Arc<dyn Launcher>,
    bus: Bus,
    listener: JoinHandle<()>,
    token: CancellationToken,
    slots: Slots,
    policy: RespawnPolicy,
}

impl Supervisor {
    pub(super) fn from_parts(p: Parts) -> Self {
        Self {
            policy: p.cfg.supervisor.respawn.policy(),
            slots: Slots::new(p.worker_count),
            cfg: p.cfg,
            config_path: p.config_path,
            worker_count: p.worker_count,
            substrate: p.substrate,
            launcher: p.launcher,
            bus: p.bus,
            listener: p.listener,
            token: p.token,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            flags: Arc::clone(self.substrate.flags()),
            bus: self.bus.clone(),
        }
    }

    /// Effective number of worker slots.
    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    /// The substrate this supervisor created.
    pub fn substrate(&self) -> &Substrate {
        &self.substrate
    }

    /// Spawns the workers and supervises them until shutdown.
    ///
    /// Returns the process exit code: `0` after a requested shutdown,
    /// [`EXIT_ALL_RETIRED`] when every slot exhausted its restarts. The substrate
    /// is destroyed before returning, also on error.
    pub async fn run(mut self) -> Result<i32, RuntimeError> {
        tracing::info!(
            workers = self.worker_count,
            pid = std::process::id(),
            namespace = %self.substrate.options().namespace,
            "supervisor starting"
        );
        let result = self.supervise().await;

        // Children must be gone before the resources they use.
        if let Err(e) = self.shutdown().await {
            tracing::error!(error = %e, "shutdown protocol failed");
        }

        let Self {
            substrate,
            listener,
            token,
            ..
        } = self;
        token.cancel();
        let destroyed = substrate.destroy();
        let _ = listener.await;

        let code = result?;
        destroyed?;
        tracing::info!(exit_code = code, "supervisor stopped");
        Ok(code)
    }

    async fn supervise(&mut self) -> Result<i32, RuntimeError> {
        let flags = Arc::clone(self.substrate.flags());
        for worker_id in 1..=self.worker_count {
            self.spawn_slot(worker_id)?;
        }

        let (mut tick, mut summary) = self.timers();
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = flags.changed() => {}
                _ = summary.tick() => {
                    self.log_summary()?;
                    continue;
                }
            }

            if flags.is_shutdown_requested() {
                return Ok(0);
            }
            self.reap_crashed()?;
            self.drain_channel(&flags)?;
            if flags.is_shutdown_requested() {
                return Ok(0);
            }
            self.sweep_heartbeats()?;
            self.respawn_due()?;
            if flags.take_reload() {
                self.reload()?;
                (tick, summary) = self.timers();
            }

            if self.slots.all_retired() {
                tracing::error!("every worker slot exhausted its restarts; shutting down");
                return Ok(EXIT_ALL_RETIRED);
            }
        }
    }

    fn timers(&self) -> (Interval, Interval) {
        let s = &self.cfg.supervisor;
        let mut tick = interval(s.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut summary = interval_at(Instant::now() + s.stats_interval(), s.stats_interval());
        summary.set_missed_tick_behavior(MissedTickBehavior::Delay);
        (tick, summary)
    }

    /// Starts an incarnation of `worker_id` and records it as `Starting`.
    ///
    /// A launch failure is published and retried on the respawn backoff; only a
    /// substrate failure is returned.
    fn spawn_slot(&mut self, worker_id: u32) -> Result<(), RuntimeError> {
        let mut cmd = self.launcher.command(worker_id);
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        let spawned = cmd.spawn().and_then(|child| match child.id() {
            Some(pid) => Ok((child, pid)),
            None => Err(std::io::Error::other("child exited before its pid was read")),
        });
        let Some(slot) = self.slots.get_mut(worker_id) else {
            return Ok(());
        };

        let (child, pid) = match spawned {
            Ok(v) => v,
            Err(source) => {
                let err = RuntimeError::Spawn { worker_id, source };
                slot.consecutive += 1;
                let delay = self
                    .policy
                    .backoff
                    .next(slot.consecutive - 1)
                    .max(self.cfg.supervisor.tick());
                slot.respawn_at = Some(Instant::now() + delay);
                let restart_count = slot.restart_count;
                // The previous incarnation, if any, is gone: it must not stay live in the table.
                self.substrate.with_lock(|st| {
                    if let Some(rec) = st.slot_mut(worker_id) {
                        rec.status = ProcessStatus::Stopped;
                        rec.restart_count = restart_count;
                    }
                })?;
                self.bus.publish(
                    Event::new(EventKind::SpawnFailed)
                        .with_worker(worker_id)
                        .with_delay(delay)
                        .with_reason(err.to_string()),
                );
                return Ok(());
            }
        };

        let restart_count = slot.restart_count;
        slot.track(child, pid);
        self.substrate
            .with_lock(|st| st.upsert(ProcessRecord::starting(worker_id, pid, restart_count)))??;
        self.bus.publish(
            Event::new(EventKind::WorkerSpawned)
                .with_worker(worker_id)
                .with_pid(pid)
                .with_restart_count(restart_count),
        );
        Ok(())
    }

    /// Reaps exited children and applies the respawn policy.
    fn reap_crashed(&mut self) -> Result<(), RuntimeError> {
        for Exit {
            worker_id,
            pid,
            status,
        } in self.slots.reap()
        {
            let Some(slot) = self.slots.get_mut(worker_id) else {
                continue;
            };
            slot.restart_count += 1;
            slot.consecutive += 1;
            let (restart_count, consecutive) = (slot.restart_count, slot.consecutive);

            self.bus.publish(
                Event::new(EventKind::WorkerCrashed)
                    .with_worker(worker_id)
                    .with_pid(pid)
                    .with_restart_count(restart_count)
                    .with_reason(status),
            );

            match self.policy.decide(restart_count, consecutive) {
                RespawnDecision::Retire => {
                    slot.retired = true;
                    self.substrate.with_lock(|st| st.remove_slot(worker_id))?;
                    self.bus.publish(
                        Event::new(EventKind::SlotRetired)
                            .with_worker(worker_id)
                            .with_restart_count(restart_count),
                    );
                }
                RespawnDecision::After(delay) if delay.is_zero() => {
                    self.spawn_slot(worker_id)?;
                }
                RespawnDecision::After(delay) => {
                    slot.respawn_at = Some(Instant::now() + delay);
                    self.substrate.with_lock(|st| {
                        if let Some(rec) = st.incarnation_mut(worker_id, pid) {
                            rec.status = ProcessStatus::Stopped;
                            rec.restart_count = restart_count;
                        }
                    })?;
                    self.bus.publish(
                        Event::new(EventKind::RespawnScheduled)
                            .with_worker(worker_id)
                            .with_restart_count(restart_count)
                            .with_delay(delay),
                    );
                }
            }
        }
        Ok(())
    }

    fn respawn_due(&mut self) -> Result<(), RuntimeError> {
        let now = Instant::now();
        let due: Vec<u32> = self
            .slots
            .iter()
            .filter(|s| !s.retired && !s.is_alive() && s.respawn_at.is_some_and(|at| at <= now))
            .map(|s| s.worker_id)
            .collect();
        for worker_id in due {
            self.spawn_slot(worker_id)?;
        }
        Ok(())
    }

    /// Routes every queued control message.
    fn drain_channel(&mut self, flags: &ControlFlags) -> Result<(), RuntimeError> {
        while let Some(env) = self.substrate.receive(MessageFilter::Any, None)? {
            self.route(env, flags)?;
        }
        Ok(())
    }

    fn route(&mut self, env: Envelope, flags: &ControlFlags) -> Result<(), RuntimeError> {
        let pid = env.sender_pid;
        if let Some(worker_id) = env.message.worker_id() {
            if !self.slots.is_current(worker_id, pid) {
                tracing::debug!(worker_id, pid, kind = ?env.message.kind(), "stale message dropped");
                return Ok(());
            }
        }

        match env.message {
            ControlMessage::Heartbeat { worker_id } => {
                self.substrate.with_lock(|st| {
                    if let Some(rec) = st.incarnation_mut(worker_id, pid) {
                        rec.last_heartbeat_at = now_millis();
                    }
                })?;
            }
            ControlMessage::StatusUpdate { worker_id, status } => {
                self.substrate.with_lock(|st| {
                    if let Some(rec) = st.incarnation_mut(worker_id, pid) {
                        rec.status = status;
                    }
                })?;
                if status == ProcessStatus::Running {
                    if let Some(slot) = self.slots.get_mut(worker_id) {
                        slot.consecutive = 0;
                    }
                }
                self.bus.publish(
                    Event::new(EventKind::StatusChanged)
                        .with_worker(worker_id)
                        .with_pid(pid)
                        .with_status(status),
                );
            }
            ControlMessage::ErrorReport { worker_id, message } => {
                self.bus.publish(
                    Event::new(EventKind::WorkerErrorReported)
                        .with_worker(worker_id)
                        .with_pid(pid)
                        .with_reason(message),
                );
            }
            ControlMessage::Statistics { snapshot, .. } => {
                self.substrate
                    .with_lock(|st| st.stats.merge(&snapshot, now_millis()))?;
            }
            ControlMessage::Shutdown => {
                tracing::info!(sender_pid = pid, "shutdown requested over the control channel");
                flags.request_shutdown();
            }
            ControlMessage::Reload => {
                tracing::info!(sender_pid = pid, "reload requested over the control channel");
                flags.request_reload();
            }
        }
        Ok(())
    }

    /// SIGTERMs `Running` workers whose heartbeat is older than the timeout and
    /// SIGKILLs those still alive `kill_grace` later.
    fn sweep_heartbeats(&mut self) -> Result<(), RuntimeError> {
        let timeout = self.cfg.supervisor.heartbeat_timeout();
        let kill_grace = self.cfg.supervisor.kill_grace();
        let now_ms = now_millis();
        let now = Instant::now();

        let stale: Vec<(u32, u32, Duration)> = self.substrate.read(|st| {
            st.records
                .iter()
                .filter(|r| r.status == ProcessStatus::Running)
                .map(|r| (r.worker_id, r.pid, r.heartbeat_age(now_ms)))
                .filter(|(_, _, age)| *age > timeout)
                .collect()
        })?;

        for (worker_id, pid, age) in stale {
            let Some(slot) = self.slots.get_mut(worker_id) else {
                continue;
            };
            if slot.pid != Some(pid) || slot.term_sent_at.is_some() {
                continue;
            }
            slot.term_sent_at = Some(now);
            send_signal(pid, Signal::SIGTERM);
            self.bus.publish(
                Event::new(EventKind::HeartbeatTimeout)
                    .with_worker(worker_id)
                    .with_pid(pid)
                    .with_delay(age),
            );
        }

        for slot in self.slots.iter_mut() {
            let (Some(pid), Some(sent)) = (slot.pid, slot.term_sent_at) else {
                continue;
            };
            if slot.kill_sent || now.duration_since(sent) < kill_grace {
                continue;
            }
            slot.kill_sent = true;
            send_signal(pid, Signal::SIGKILL);
            self.bus.publish(
                Event::new(EventKind::ForceKilled)
                    .with_worker(slot.worker_id)
                    .with_pid(pid)
                    .with_reason("SIGTERM ignored after heartbeat timeout"),
            );
        }
        Ok(())
    }

    /// Re-reads the configuration and tells every worker to reload.
    fn reload(&mut self) -> Result<(), RuntimeError> {
        self.bus.publish(Event::new(EventKind::ReloadRequested));

        if let Some(path) = &self.config_path {
            match Config::load(Some(path)) {
                Ok(next) => {
                    if next.supervisor.effective_workers() != self.worker_count {
                        tracing::warn!(
                            current = self.worker_count,
                            requested = next.supervisor.effective_workers(),
                            "worker count changes need a restart; keeping the current count"
                        );
                    }
                    self.policy = next.supervisor.respawn.policy();
                    self.cfg.supervisor = next.supervisor;
                    self.cfg.worker = next.worker;
                }
                Err(e) => {
                    self.bus.publish(Event::new(EventKind::ReloadFailed).with_reason(e.to_string()));
                    return Ok(());
                }
            }
        }

        let version = self.substrate.with_lock(|st| {
            st.reload_requested = true;
            st.config_version += 1;
            st.config_version
        })?;
        for slot in self.slots.iter() {
            if let Some(pid) = slot.pid {
                send_signal(pid, Signal::SIGHUP);
            }
        }
        self.substrate.with_lock(|st| st.reload_requested = false)?;

        self.bus.publish(
            Event::new(EventKind::ReloadApplied).with_reason(format!("config_version={version}")),
        );
        Ok(())
    }

    fn log_summary(&self) -> Result<(), RuntimeError> {
        let st = self.substrate.snapshot()?;
        let counts = st.status_counts();
        let count = |s: ProcessStatus| {
            counts
                .iter()
                .find(|(status, _)| *status == s)
                .map_or(0, |(_, n)| *n)
        };
        let restarts: u32 = self.slots.iter().map(|s| s.restart_count).sum();

        tracing::info!(
            slots = self.worker_count,
            alive = self.slots.alive(),
            starting = count(ProcessStatus::Starting),
            running = count(ProcessStatus::Running),
            stopping = count(ProcessStatus::Stopping),
            stopped = count(ProcessStatus::Stopped),
            error = count(ProcessStatus::Error),
            restarts,
            messages = st.stats.messages_processed,
            bytes_received = st.stats.bytes_received,
            bytes_sent = st.stats.bytes_sent,
            errors = st.stats.errors,
            "supervisor summary"
        );
        Ok(())
    }

    /// Terminal shutdown protocol; never waits longer than `grace + kill_grace`
    /// plus one tick.
    async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        let grace = self.cfg.supervisor.grace();
        let kill_grace = self.cfg.supervisor.kill_grace();
        let step = self.cfg.supervisor.tick();

        self.substrate.flags().request_shutdown();
        self.bus.publish(Event::new(EventKind::ShutdownRequested));
        for slot in self.slots.iter_mut() {
            slot.respawn_at = None;
        }

        self.substrate.with_lock(|st| st.shutdown_requested = true)?;
        self.substrate.send(&ControlMessage::Shutdown, Target::Broadcast)?;
        for slot in self.slots.iter() {
            if let Some(pid) = slot.pid {
                send_signal(pid, Signal::SIGTERM);
            }
        }

        if self.reap_until(Instant::now() + grace, step).await? {
            self.bus.publish(Event::new(EventKind::AllStoppedWithin));
            return Ok(());
        }

        let stuck = self.slots.alive_ids();
        self.bus.publish(
            Event::new(EventKind::GraceExceeded).with_reason(format!("stuck workers: {stuck:?}")),
        );
        for slot in self.slots.iter() {
            if let Some(pid) = slot.pid {
                send_signal(pid, Signal::SIGKILL);
                self.bus.publish(
                    Event::new(EventKind::ForceKilled)
                        .with_worker(slot.worker_id)
                        .with_pid(pid)
                        .with_reason("shutdown grace exceeded"),
                );
            }
        }

        if !self.reap_until(Instant::now() + kill_grace, step).await? {
            tracing::error!(
                workers = ?self.slots.alive_ids(),
                "workers survived SIGKILL; giving up on them"
            );
        }
        Ok(())
    }

    /// Reaps until no child is left (`true`) or `deadline` passes (`false`).
    async fn reap_until(&mut self, deadline: Instant, step: Duration) -> Result<bool, RuntimeError> {
        loop {
            for exit in self.slots.reap() {
                self.substrate.with_lock(|st| st.remove_pid(exit.pid))?;
                self.bus.publish(
                    Event::new(EventKind::WorkerExited)
                        .with_worker(exit.worker_id)
                        .with_pid(exit.pid)
                        .with_reason(exit.status),
                );
            }
            if self.slots.alive() == 0 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(step.min(deadline - now)).await;
        }
    }
}

/// Sends `sig` to `pid`; a vanished process is not an error.
fn send_signal(pid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(errno) = kill(Pid::from_raw(raw), sig) {
        tracing::debug!(pid, signal = %sig, %errno, "signal not delivered");
    }
}
