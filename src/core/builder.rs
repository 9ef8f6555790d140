use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::launcher::{ExecLauncher, Launcher};
use super::supervisor::{Parts, Supervisor};
use crate::config::Config;
use crate::error::RuntimeError;
use crate::events::Bus;
use crate::signals;
use crate::subscribers::{Subscribe, SubscriberSet};
use crate::substrate::Substrate;

/// Builder for constructing a [`Supervisor`] with optional features.
pub struct SupervisorBuilder {
    cfg: Config,
    config_path: Option<PathBuf>,
    launcher: Option<Arc<dyn Launcher>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    os_signals: bool,
}

impl SupervisorBuilder {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            config_path: None,
            launcher: None,
            subscribers: Vec::new(),
            os_signals: true,
        }
    }

    /// File re-read on reload and forwarded to workers.
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Replaces the default launcher (re-executing the current binary).
    pub fn with_launcher(mut self, launcher: impl Launcher) -> Self {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    /// Sets event subscribers for observability.
    ///
    /// Subscribers receive supervisor events through dedicated workers with
    /// bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Whether to install SIGTERM/SIGINT/SIGQUIT/SIGHUP handlers (default: yes).
    pub fn with_os_signals(mut self, enabled: bool) -> Self {
        self.os_signals = enabled;
        self
    }

    /// Validates the configuration, creates the substrate and installs signal
    /// handlers. Must be called inside a tokio runtime.
    ///
    /// Nothing is spawned until [`Supervisor::run`].
    pub fn build(self) -> Result<Supervisor, RuntimeError> {
        self.cfg.validate()?;
        let worker_count = self.cfg.supervisor.effective_workers();

        let launcher: Arc<dyn Launcher> = match self.launcher {
            Some(l) => l,
            None => Arc::new(
                ExecLauncher::current(self.config_path.as_deref(), &self.cfg.substrate)
                    .map_err(|source| RuntimeError::Spawn {
                        worker_id: 0,
                        source,
                    })?,
            ),
        };

        let substrate = Substrate::create(self.cfg.substrate.options(), worker_count)?;
        let token = CancellationToken::new();

        if self.os_signals {
            if let Err(e) = signals::spawn_listener(Arc::clone(substrate.flags()), token.clone()) {
                let _ = substrate.destroy();
                return Err(RuntimeError::Signal(e));
            }
        }

        let bus = Bus::new(self.cfg.supervisor.bus_capacity_clamped());
        let subs = SubscriberSet::new(self.subscribers, bus.clone());
        let listener = subscriber_listener(&bus, subs, token.clone());

        Ok(Supervisor::from_parts(Parts {
            cfg: self.cfg,
            config_path: self.config_path,
            worker_count,
            substrate,
            launcher,
            bus,
            listener,
            token,
        }))
    }
}

/// Forwards bus events to the subscriber set until `token` is cancelled, then
/// delivers what is still queued and drains the subscribers.
fn subscriber_listener(bus: &Bus, subs: SubscriberSet, token: CancellationToken) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Ok(ev) => subs.emit(&ev),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscriber listener lagged; events lost");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = token.cancelled() => break,
            }
        }
        while let Ok(ev) = rx.try_recv() {
            subs.emit(&ev);
        }
        subs.shutdown().await;
    })
}

impl Supervisor {
    /// Starts building a supervisor from `cfg`.
    pub fn builder(cfg: Config) -> SupervisorBuilder {
        SupervisorBuilder::new(cfg)
    }
}
