//! # Event subscribers.
//!
//! ```text
//! Supervisor ── publish(Event) ──► Bus ──► listener ──► SubscriberSet::emit
//!                                                         ├──► LogWriter
//!                                                         └──► custom subscribers
//! ```
//!
//! Implement [`Subscribe`] to plug in alerting or metrics; [`LogWriter`] is the
//! built-in renderer used by the binary.

mod embedded;
mod set;
mod subscribe;

pub use embedded::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
