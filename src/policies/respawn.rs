//! # Respawn policy for crashed worker slots.
//!
//! Decides, for a slot whose process exited while the supervisor was not
//! shutting down, whether and when to start a replacement.
//!
//! ```text
//! crash ─► restart_count += 1
//!            ├─ max_restarts > 0 && restart_count > max_restarts ─► Retire
//!            └─ otherwise ─► After(backoff.next(consecutive))
//! ```
//!
//! `consecutive` counts crashes since the slot last reported `Running`, so a
//! worker that runs healthily for a while starts again from `backoff.first`.

use std::time::Duration;

use super::backoff::BackoffPolicy;

/// What to do with a crashed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespawnDecision {
    /// Spawn a replacement after the delay (zero = this tick).
    After(Duration),
    /// Stop managing the slot.
    Retire,
}

/// Backoff plus an optional ceiling on restarts per slot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RespawnPolicy {
    pub backoff: BackoffPolicy,
    /// `0` = unlimited.
    pub max_restarts: u32,
}

impl RespawnPolicy {
    /// Decision for a slot that has now been restarted `restart_count` times,
    /// `consecutive` of them without reaching `Running` in between.
    pub fn decide(&self, restart_count: u32, consecutive: u32) -> RespawnDecision {
        if self.max_restarts > 0 && restart_count > self.max_restarts {
            return RespawnDecision::Retire;
        }
        RespawnDecision::After(self.backoff.next(consecutive.saturating_sub(1)))
    }
}
