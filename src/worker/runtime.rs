//! # WorkerRuntime: the main loop of a worker process.
//!
//! One task multiplexes every recurring activity with `tokio::select!`. Every
//! unit and sink call is bounded, so a hung sink delays a heartbeat by at most
//! `call_timeout` and nothing starves.
//!
//! ```text
//! attach ─► connect + subscribe ─► Running
//!
//! loop (until Stopping) select! {
//!   tick       ─► drain inbox (Shutdown/Reload), shared flags, local flags,
//!                 flush aged buffers, drive reconnection
//!   heartbeat  ─► Heartbeat to supervisor + own last_heartbeat_at under lock
//!   stats      ─► Statistics increment to supervisor
//!   unit event ─► buffer record (flush if full) | report error | note status
//!   flags      ─► same control checks as tick, immediately
//! }
//!
//! Stopping ─► disconnect unit ─► flush all buffers ─► final stats ─► Stopped
//! ```
//!
//! ## Rules
//! - Unit and sink failures are reported as `ErrorReport`, counted, and never end
//!   the process. A failed batch is logged and dropped.
//! - `connect` is bounded by `connect_timeout`; every other unit call and each
//!   `save_batch` by `call_timeout`. A timeout counts as a failure of that call.
//! - Reconnection is scheduled, not slept: the loop keeps heartbeating while the
//!   unit is down. After `max_reconnect_attempts` consecutive failures the worker
//!   enters `Error` and keeps retrying at the same fixed interval.
//! - Substrate failures are fatal and propagate out of [`WorkerRuntime::run`].
//! - Every state transition is published as `StatusUpdate` and written to the
//!   worker's own record.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::buffer::{Batch, BatchBuffers};
use super::state::{Transition, WorkerState};
use super::stats::WorkerStats;
use super::unit::{BusinessUnit, ConnectionStatus, Sink, Subscription, UnitEvent, UnitEvents};
use crate::config::{Config, WorkerConfig};
use crate::error::{SinkError, UnitError, WorkerError};
use crate::signals;
use crate::substrate::{
    now_millis, ControlFlags, ControlMessage, MessageFilter, ProcessStatus, Substrate, Target,
};

/// Reconnection bookkeeping.
#[derive(Debug, Default)]
struct Link {
    /// When the next connect attempt is due; `None` while connected.
    retry_at: Option<Instant>,
    /// Consecutive failed attempts.
    failures: u32,
}

struct Timers {
    tick: Interval,
    heartbeat: Interval,
    stats: Interval,
}

impl Timers {
    fn new(cfg: &WorkerConfig) -> Self {
        let mut tick = interval(cfg.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First heartbeat goes out right away.
        let mut heartbeat = interval(cfg.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = interval_at(Instant::now() + cfg.stats_interval(), cfg.stats_interval());
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            tick,
            heartbeat,
            stats,
        }
    }
}

/// Runs one worker slot until shutdown.
pub struct WorkerRuntime {
    worker_id: u32,
    pid: u32,
    cfg: WorkerConfig,
    config_path: Option<PathBuf>,
    substrate: Substrate,
    unit: Box<dyn BusinessUnit>,
    sink: Arc<dyn Sink>,
    state: WorkerState,
    buffers: BatchBuffers,
    stats: WorkerStats,
    link: Link,
    events_tx: UnitEvents,
    events_rx: Option<mpsc::Receiver<UnitEvent>>,
    seen_config_version: u64,
    os_signals: bool,
}

impl WorkerRuntime {
    /// `substrate` must be attached with [`Role::Worker(worker_id)`](crate::substrate::Role::Worker).
    pub fn new(
        worker_id: u32,
        cfg: WorkerConfig,
        substrate: Substrate,
        unit: Box<dyn BusinessUnit>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(cfg.event_queue.max(1));
        Self {
            worker_id,
            pid: std::process::id(),
            buffers: BatchBuffers::new(cfg.batch_size, cfg.flush_interval()),
            cfg,
            config_path: None,
            substrate,
            unit,
            sink,
            state: WorkerState::Starting,
            stats: WorkerStats::default(),
            link: Link::default(),
            events_tx,
            events_rx: Some(events_rx),
            seen_config_version: 0,
            os_signals: true,
        }
    }

    /// Configuration file re-read on reload.
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Whether to install SIGTERM/SIGINT/SIGQUIT/SIGHUP handlers (default: yes).
    pub fn with_os_signals(mut self, enabled: bool) -> Self {
        self.os_signals = enabled;
        self
    }

    /// Flags that stop (`request_shutdown`) or reload (`request_reload`) this worker.
    pub fn flags(&self) -> Arc<ControlFlags> {
        Arc::clone(self.substrate.flags())
    }

    /// Runs until shutdown; returns after the unit is disconnected and buffers
    /// are flushed. Consumes the runtime and detaches the substrate.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let flags = self.flags();
        let token = CancellationToken::new();
        if self.os_signals {
            signals::spawn_listener(Arc::clone(&flags), token.clone()).map_err(WorkerError::Signal)?;
        }

        let result = self.run_inner(&flags).await;
        token.cancel();

        match &result {
            Ok(()) => tracing::info!(worker_id = self.worker_id, "worker stopped"),
            Err(e) => tracing::error!(worker_id = self.worker_id, error = %e, label = e.as_label(), "worker failed"),
        }
        self.substrate.detach();
        result
    }

    async fn run_inner(&mut self, flags: &ControlFlags) -> Result<(), WorkerError> {
        let Some(mut events_rx) = self.events_rx.take() else {
            return Ok(());
        };
        self.seen_config_version = self.substrate.read(|st| st.config_version)?;
        self.publish_status()?;

        if let Err(source) = self.connect_and_subscribe().await {
            self.report_error(format!("startup failed: {source}"))?;
            return Err(WorkerError::Startup {
                worker_id: self.worker_id,
                source,
            });
        }
        self.apply(Transition::Started)?;
        tracing::info!(
            worker_id = self.worker_id,
            pid = self.pid,
            unit = self.unit.name(),
            categories = ?self.cfg.categories,
            "worker running"
        );

        let mut timers = Timers::new(&self.cfg);
        while !self.state.is_winding_down() {
            let rebuild = tokio::select! {
                _ = timers.tick.tick() => self.on_tick(flags).await?,
                _ = timers.heartbeat.tick() => { self.heartbeat()?; false }
                _ = timers.stats.tick() => { self.push_stats()?; false }
                Some(ev) = events_rx.recv() => { self.on_unit_event(ev).await?; false }
                _ = flags.changed() => self.poll_control(flags).await?,
            };
            if rebuild {
                timers = Timers::new(&self.cfg);
            }
        }

        self.stop().await
    }

    /// Periodic work. Returns `true` if timers must be rebuilt (reload).
    async fn on_tick(&mut self, flags: &ControlFlags) -> Result<bool, WorkerError> {
        let reloaded = self.poll_control(flags).await?;
        if self.state.is_winding_down() {
            return Ok(reloaded);
        }

        for batch in self.buffers.take_due(Instant::now()) {
            self.flush(batch).await?;
        }
        self.maintain_link().await?;
        Ok(reloaded)
    }

    /// Inbox, shared flags and local flags. Returns `true` after a reload.
    async fn poll_control(&mut self, flags: &ControlFlags) -> Result<bool, WorkerError> {
        while let Some(env) = self.substrate.receive(MessageFilter::Any, None)? {
            match env.message {
                ControlMessage::Shutdown => {
                    flags.request_shutdown();
                }
                ControlMessage::Reload => flags.request_reload(),
                ControlMessage::Heartbeat { .. }
                | ControlMessage::StatusUpdate { .. }
                | ControlMessage::ErrorReport { .. }
                | ControlMessage::Statistics { .. } => {
                    tracing::debug!(kind = ?env.message.kind(), "unexpected message in worker inbox; ignored");
                }
            }
        }

        let (shutdown, version) = self
            .substrate
            .read(|st| (st.shutdown_requested, st.config_version))?;
        if shutdown {
            flags.request_shutdown();
        }
        if version > self.seen_config_version {
            self.seen_config_version = version;
            flags.request_reload();
        }

        if flags.is_shutdown_requested() {
            if self.state.on(Transition::ShutdownObserved).is_some() {
                tracing::info!(worker_id = self.worker_id, "shutdown observed");
                self.apply(Transition::ShutdownObserved)?;
            }
            return Ok(false);
        }
        if flags.take_reload() {
            return self.reload().await;
        }
        Ok(false)
    }

    async fn on_unit_event(&mut self, ev: UnitEvent) -> Result<(), WorkerError> {
        match ev {
            UnitEvent::Data(record) => {
                self.stats.record_message(record.size());
                if let Some(batch) = self.buffers.push(record, Instant::now()) {
                    self.flush(batch).await?;
                }
            }
            UnitEvent::Error(e) => {
                self.stats.record_error();
                tracing::warn!(worker_id = self.worker_id, error = %e, label = e.as_label(), "business unit error");
                self.report_error(e.to_string())?;
            }
            UnitEvent::Status(status) => {
                tracing::debug!(worker_id = self.worker_id, ?status, "unit connection status");
                if status != ConnectionStatus::Connected && self.link.retry_at.is_none() {
                    self.schedule_reconnect().await;
                }
            }
        }
        Ok(())
    }

    /// Notices a lost connection and runs due reconnect attempts.
    async fn maintain_link(&mut self) -> Result<(), WorkerError> {
        let Some(due) = self.link.retry_at else {
            if self.unit.status() != ConnectionStatus::Connected {
                self.schedule_reconnect().await;
            }
            return Ok(());
        };
        if Instant::now() < due {
            return Ok(());
        }

        match self.connect_and_subscribe().await {
            Ok(()) => {
                tracing::info!(
                    worker_id = self.worker_id,
                    after_failures = self.link.failures,
                    "reconnected"
                );
                self.link = Link::default();
                if self.state == WorkerState::Error {
                    self.apply(Transition::Reconnected)?;
                }
            }
            Err(e) => {
                self.link.failures += 1;
                self.stats.record_error();
                let max = self.cfg.max_reconnect_attempts;
                tracing::warn!(
                    worker_id = self.worker_id,
                    attempt = self.link.failures,
                    max,
                    error = %e,
                    "reconnect failed"
                );
                self.report_error(format!(
                    "reconnect attempt {} failed: {e}",
                    self.link.failures
                ))?;
                if max > 0 && self.link.failures >= max && self.state == WorkerState::Running {
                    self.apply(Transition::ReconnectExhausted)?;
                }
                self.disconnect_unit().await;
                self.link.retry_at = Some(Instant::now() + self.cfg.reconnect_interval());
            }
        }
        Ok(())
    }

    async fn schedule_reconnect(&mut self) {
        tracing::warn!(
            worker_id = self.worker_id,
            retry_in = ?self.cfg.reconnect_interval(),
            "unit disconnected; reconnect scheduled"
        );
        self.disconnect_unit().await;
        self.link.retry_at = Some(Instant::now() + self.cfg.reconnect_interval());
    }

    async fn connect_and_subscribe(&mut self) -> Result<(), UnitError> {
        let timeout = self.cfg.connect_timeout();
        let connect = std::panic::AssertUnwindSafe(self.unit.connect(self.events_tx.clone())).catch_unwind();
        match tokio::time::timeout(timeout, connect).await {
            Err(_) => return Err(UnitError::ConnectTimeout { timeout }),
            Ok(Err(_panic)) => {
                return Err(UnitError::Connect {
                    reason: "unit panicked during connect".to_owned(),
                })
            }
            Ok(Ok(res)) => res?,
        }

        let timeout = self.cfg.call_timeout();
        for category in self.cfg.categories.clone() {
            bounded(timeout, "subscribe", self.unit.subscribe(&Subscription::new(category))).await?;
        }
        Ok(())
    }

    async fn disconnect_unit(&mut self) {
        let timeout = self.cfg.call_timeout();
        if tokio::time::timeout(timeout, self.unit.disconnect()).await.is_err() {
            self.stats.record_error();
            tracing::warn!(worker_id = self.worker_id, ?timeout, "unit disconnect timed out");
        }
    }

    async fn flush(&mut self, batch: Batch) -> Result<(), WorkerError> {
        let bytes = batch.bytes();
        let count = batch.records.len();
        let timeout = self.cfg.call_timeout();
        let save = std::panic::AssertUnwindSafe(self.sink.save_batch(&batch.category, &batch.records))
            .catch_unwind();

        let outcome = tokio::time::timeout(timeout, save).await;

        let error = match outcome {
            Ok(Ok(Ok(()))) => {
                self.stats.record_sent(bytes);
                tracing::debug!(worker_id = self.worker_id, category = %batch.category, count, bytes, "batch flushed");
                return Ok(());
            }
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(_panic)) => "sink panicked".to_owned(),
            Err(_) => SinkError::Timeout {
                category: batch.category.clone(),
                timeout,
            }
            .to_string(),
        };

        self.stats.record_error();
        tracing::error!(
            worker_id = self.worker_id,
            category = %batch.category,
            count,
            error = %error,
            "failed to save batch; dropped"
        );
        self.report_error(format!("dropped {count} {} records: {error}", batch.category))
    }

    fn heartbeat(&mut self) -> Result<(), WorkerError> {
        let (worker_id, pid) = (self.worker_id, self.pid);
        self.substrate.with_lock(|st| {
            if let Some(rec) = st.incarnation_mut(worker_id, pid) {
                rec.last_heartbeat_at = now_millis();
            }
        })?;
        self.substrate
            .send(&ControlMessage::Heartbeat { worker_id }, Target::Supervisor)?;
        Ok(())
    }

    fn push_stats(&mut self) -> Result<(), WorkerError> {
        let snapshot = self.stats.take_delta();
        let totals = self.stats.totals();
        tracing::info!(
            worker_id = self.worker_id,
            messages = totals.messages_processed,
            bytes_received = totals.bytes_received,
            bytes_sent = totals.bytes_sent,
            errors = totals.errors,
            buffered = self.buffers.len(),
            "worker statistics"
        );
        if snapshot.is_empty() {
            return Ok(());
        }
        self.substrate.send(
            &ControlMessage::Statistics {
                worker_id: self.worker_id,
                snapshot,
            },
            Target::Supervisor,
        )?;
        Ok(())
    }

    fn report_error(&self, message: String) -> Result<(), WorkerError> {
        self.substrate.send(
            &ControlMessage::error_report(self.worker_id, message),
            Target::Supervisor,
        )?;
        Ok(())
    }

    fn apply(&mut self, t: Transition) -> Result<(), WorkerError> {
        match self.state.on(t) {
            Some(next) => {
                tracing::debug!(worker_id = self.worker_id, from = ?self.state, to = ?next, "worker state");
                self.state = next;
                self.publish_status()
            }
            None => {
                tracing::debug!(worker_id = self.worker_id, state = ?self.state, transition = ?t, "transition ignored");
                Ok(())
            }
        }
    }

    fn publish_status(&self) -> Result<(), WorkerError> {
        let status = ProcessStatus::from(self.state);
        let (worker_id, pid) = (self.worker_id, self.pid);
        self.substrate.with_lock(|st| {
            if let Some(rec) = st.incarnation_mut(worker_id, pid) {
                rec.status = status;
            }
        })?;
        self.substrate
            .send(&ControlMessage::StatusUpdate { worker_id, status }, Target::Supervisor)?;
        Ok(())
    }

    /// Re-reads configuration and re-subscribes. Returns `true` if timers changed.
    async fn reload(&mut self) -> Result<bool, WorkerError> {
        let next = match &self.config_path {
            Some(path) => match Config::load(Some(path)) {
                Ok(cfg) => cfg.worker,
                Err(e) => {
                    tracing::error!(worker_id = self.worker_id, error = %e, "reload failed; keeping configuration");
                    self.report_error(format!("reload failed: {e}"))?;
                    return Ok(false);
                }
            },
            None => self.cfg.clone(),
        };

        let timeout = self.cfg.call_timeout();
        for category in &self.cfg.categories {
            let sub = Subscription::new(category.clone());
            if let Err(e) = bounded(timeout, "unsubscribe", self.unit.unsubscribe(&sub)).await {
                tracing::warn!(worker_id = self.worker_id, category = %category, error = %e, "unsubscribe failed");
            }
        }
        let timers_changed = next.tick_ms != self.cfg.tick_ms
            || next.heartbeat_interval_ms != self.cfg.heartbeat_interval_ms
            || next.stats_interval_ms != self.cfg.stats_interval_ms;
        self.buffers.reconfigure(next.batch_size, next.flush_interval());
        self.cfg = next;

        let timeout = self.cfg.call_timeout();
        for category in self.cfg.categories.clone() {
            let sub = Subscription::new(category.clone());
            if let Err(e) = bounded(timeout, "subscribe", self.unit.subscribe(&sub)).await {
                self.stats.record_error();
                self.report_error(format!("resubscribe to {category} failed: {e}"))?;
            }
        }
        tracing::info!(worker_id = self.worker_id, categories = ?self.cfg.categories, "configuration reloaded");
        Ok(timers_changed)
    }

    async fn stop(&mut self) -> Result<(), WorkerError> {
        self.disconnect_unit().await;
        for batch in self.buffers.drain() {
            self.flush(batch).await?;
        }
        self.push_stats()?;
        self.apply(Transition::Drained)
    }
}

/// Runs a unit call under `timeout`; running out of time fails the call.
async fn bounded<T>(
    timeout: Duration,
    op: &'static str,
    call: impl Future<Output = Result<T, UnitError>>,
) -> Result<T, UnitError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(UnitError::Timeout { op, timeout }))
}
