//! Supervisor core: worker process orchestration and lifecycle.
//!
//! The public API is [`Supervisor`] (built with [`SupervisorBuilder`]), its
//! [`SupervisorHandle`], and the [`Launcher`] seam that decides how a worker
//! process is started.
//!
//! Internal modules:
//! - [`supervisor`]: spawn, monitoring loop, respawn, reload, shutdown protocol;
//! - [`slots`]: child handles and per-slot restart bookkeeping;
//! - [`builder`]: substrate creation, signal handlers, subscriber wiring;
//! - [`launcher`]: worker command construction.

mod builder;
mod launcher;
mod slots;
mod supervisor;

pub use builder::SupervisorBuilder;
pub use launcher::{ExecLauncher, FnLauncher, Launcher};
pub use supervisor::{Supervisor, SupervisorHandle, EXIT_ALL_RETIRED};
