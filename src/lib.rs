//! # procvisor
//!
//! **procvisor** keeps a fixed pool of worker processes alive on one host.
//!
//! A supervisor process spawns N workers, watches them through a shared process
//! table and a typed control channel, respawns the ones that crash or stop
//! heartbeating, and shuts everything down within a bounded time.
//!
//! ## Architecture
//! ```text
//!                  ┌───────────────────────────────────────────────┐
//!                  │  Supervisor                                   │
//!                  │  - Slots (child handles, restart bookkeeping) │
//!                  │  - RespawnPolicy (backoff, restart ceiling)   │
//!                  │  - Bus ─► SubscriberSet ─► LogWriter, ...     │
//!                  └──────┬─────────────────────────────▲──────────┘
//!          spawn / SIGTERM│/ SIGKILL / SIGHUP / reap    │ Heartbeat, StatusUpdate,
//!                         │                             │ ErrorReport, Statistics
//!      ┌──────────────────▼─────────────────────────────┴──────────────┐
//!      │  Substrate                                                    │
//!      │  - <ns>.state  SharedState (records, stats, flags) JSON       │
//!      │  - <ns>.lock   flock guarding every access to the state       │
//!      │  - /<ns>.sup, /<ns>.w<i>  POSIX message queues                │
//!      └──────┬──────────────────────┬──────────────────────┬──────────┘
//!             ▼                      ▼                      ▼
//!      ┌──────────────┐       ┌──────────────┐       ┌──────────────┐
//!      │ worker 1     │       │ worker 2     │       │ worker N     │
//!      │ WorkerRuntime│       │ WorkerRuntime│       │ WorkerRuntime│
//!      │ BusinessUnit │       │ BusinessUnit │       │ BusinessUnit │
//!      │ ─► Sink      │       │ ─► Sink      │       │ ─► Sink      │
//!      └──────────────┘       └──────────────┘       └──────────────┘
//! ```
//!
//! ## Modules
//! - [`substrate`]: shared state, lock, control channel, in-process flags
//! - [`worker`]: worker runtime, business unit and sink seams, batching
//! - [`Supervisor`], [`SupervisorHandle`], [`Launcher`]: the parent process
//! - [`events`], [`subscribers`]: supervisor lifecycle events and their consumers
//! - [`policies`]: respawn, backoff and jitter
//! - [`config`]: TOML configuration with env overrides
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use procvisor::{Config, LogWriter, Subscribe, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cfg = Config::default();
//!     cfg.supervisor.workers = 4;
//!
//!     let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
//!     let sup = Supervisor::builder(cfg).with_subscribers(subs).build()?;
//!     let code = sup.run().await?;
//!     std::process::exit(code);
//! }
//! ```

pub mod config;
mod core;
mod error;
pub mod events;
pub mod policies;
pub mod signals;
pub mod subscribers;
pub mod substrate;
pub mod worker;

pub use crate::config::Config;
pub use crate::core::{
    ExecLauncher, FnLauncher, Launcher, Supervisor, SupervisorBuilder, SupervisorHandle,
    EXIT_ALL_RETIRED,
};
pub use crate::error::{
    ConfigError, RuntimeError, SinkError, SubstrateError, UnitError, WorkerError,
};
pub use crate::events::{Bus, Event, EventKind};
pub use crate::policies::{BackoffPolicy, JitterPolicy, RespawnDecision, RespawnPolicy};
pub use crate::subscribers::{LogWriter, Subscribe, SubscriberSet};
pub use crate::substrate::{
    ControlMessage, ProcessRecord, ProcessStatus, SharedState, Substrate, SubstrateOptions,
};
pub use crate::worker::{BusinessUnit, Sink, WorkerRuntime};
