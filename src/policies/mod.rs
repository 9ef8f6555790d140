//! Respawn policies.
//!
//! This module groups the knobs that control **whether** a crashed worker slot
//! is respawned and **how long** the supervisor waits first.
//!
//! ## Contents
//! - [`RespawnPolicy`] retire-or-respawn decision with an optional restart ceiling
//! - [`BackoffPolicy`] how delays evolve over consecutive crashes
//! - [`JitterPolicy`] randomization to avoid synchronized respawns
//!
//! ## Defaults
//! - `RespawnPolicy::default()` → immediate respawn, no ceiling.
//! - `JitterPolicy::None`.

mod backoff;
mod jitter;
mod respawn;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use respawn::{RespawnDecision, RespawnPolicy};
