//! Worker side: the process that runs one [`BusinessUnit`] for one slot.
//!
//! ## Contents
//! - [`WorkerRuntime`]: main loop, reconnection, heartbeats, stats, reload
//! - [`BusinessUnit`], [`Sink`]: seams for the data source and destination
//! - [`BatchBuffers`]: size-or-age batching per category
//! - [`WorkerState`]: lifecycle state machine
//! - [`SyntheticFeed`], [`LogSink`]: built-in implementations

mod buffer;
mod runtime;
mod state;
mod stats;
mod synthetic;
mod unit;

pub use buffer::{Batch, BatchBuffers};
pub use runtime::WorkerRuntime;
pub use state::{Transition, WorkerState};
pub use stats::WorkerStats;
pub use synthetic::{LogSink, SyntheticFeed};
pub use unit::{
    BusinessUnit, ConnectionStatus, Record, Sink, Subscription, UnitEvent, UnitEvents,
};
