//! # Worker lifecycle state machine.
//!
//! ```text
//!            Started                 ReconnectExhausted
//! Starting ──────────► Running ─────────────────────────► Error
//!    │                  │   ▲                               │
//!    │                  │   └──────── Reconnected ──────────┘
//!    │ ShutdownObserved │ ShutdownObserved                  │ ShutdownObserved
//!    └──────────────────┴──────────► Stopping ◄─────────────┘
//!                                       │ Drained
//!                                       ▼
//!                                    Stopped (terminal)
//! ```

use crate::substrate::ProcessStatus;

/// Current lifecycle state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Inputs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Attach, connect and initial subscription all succeeded.
    Started,
    /// Shutdown flag, `Shutdown` message or termination signal seen.
    ShutdownObserved,
    /// Unit disconnected, buffers flushed.
    Drained,
    /// Reconnection failed the configured number of times in a row.
    ReconnectExhausted,
    Reconnected,
}

impl WorkerState {
    /// Next state, or `None` if `t` does not apply in this state.
    pub fn on(self, t: Transition) -> Option<WorkerState> {
        use Transition as T;
        use WorkerState as S;
        match (self, t) {
            (S::Starting, T::Started) => Some(S::Running),
            (S::Starting | S::Running | S::Error, T::ShutdownObserved) => Some(S::Stopping),
            (S::Running, T::ReconnectExhausted) => Some(S::Error),
            (S::Error, T::Reconnected) => Some(S::Running),
            (S::Stopping, T::Drained) => Some(S::Stopped),
            _ => None,
        }
    }

    /// True once the main loop must end.
    #[inline]
    pub fn is_winding_down(self) -> bool {
        matches!(self, WorkerState::Stopping | WorkerState::Stopped)
    }
}

impl From<WorkerState> for ProcessStatus {
    fn from(s: WorkerState) -> Self {
        match s {
            WorkerState::Starting => ProcessStatus::Starting,
            WorkerState::Running => ProcessStatus::Running,
            WorkerState::Stopping => ProcessStatus::Stopping,
            WorkerState::Stopped => ProcessStatus::Stopped,
            WorkerState::Error => ProcessStatus::Error,
        }
    }
}
