//! # Built-in subscribers
//!
//! - [`LogWriter`]: renders events through `tracing` (used by the binary).

mod log;

pub use log::LogWriter;
