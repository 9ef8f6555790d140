//! # Control messages exchanged over the substrate channel.
//!
//! [`ControlMessage`] is a closed set; receivers match on it exhaustively.
//! Every message travels inside an [`Envelope`] stamped with the sender's pid,
//! which lets the supervisor drop reports from an incarnation it already reaped.
//!
//! ## Wire format
//! Envelopes are encoded as JSON with an internal `type` tag:
//! ```text
//! {"sender_pid":4242,"sent_at":1700000000000,"message":{"type":"heartbeat","worker_id":2}}
//! ```

use serde::{Deserialize, Serialize};

use super::state::{now_millis, ProcessStatus, StatsSnapshot};

/// Longest error text carried by an [`ControlMessage::ErrorReport`].
pub const MAX_ERROR_TEXT: usize = 512;

/// Typed control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Worker is alive.
    Heartbeat { worker_id: u32 },
    /// Worker changed lifecycle status.
    StatusUpdate {
        worker_id: u32,
        status: ProcessStatus,
    },
    /// Worker hit a recoverable business error.
    ErrorReport { worker_id: u32, message: String },
    /// Counter increments since the worker's previous report.
    Statistics {
        worker_id: u32,
        snapshot: StatsSnapshot,
    },
    /// Stop gracefully.
    Shutdown,
    /// Re-read configuration.
    Reload,
}

impl ControlMessage {
    /// Builds an error report, truncating the text to [`MAX_ERROR_TEXT`] bytes
    /// on a char boundary so the envelope fits in one queue message.
    pub fn error_report(worker_id: u32, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ERROR_TEXT {
            let mut cut = MAX_ERROR_TEXT;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        ControlMessage::ErrorReport { worker_id, message }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::Heartbeat { .. } => MessageKind::Heartbeat,
            ControlMessage::StatusUpdate { .. } => MessageKind::StatusUpdate,
            ControlMessage::ErrorReport { .. } => MessageKind::ErrorReport,
            ControlMessage::Statistics { .. } => MessageKind::Statistics,
            ControlMessage::Shutdown => MessageKind::Shutdown,
            ControlMessage::Reload => MessageKind::Reload,
        }
    }

    /// Slot the message is about, if it carries one.
    pub fn worker_id(&self) -> Option<u32> {
        match self {
            ControlMessage::Heartbeat { worker_id }
            | ControlMessage::StatusUpdate { worker_id, .. }
            | ControlMessage::ErrorReport { worker_id, .. }
            | ControlMessage::Statistics { worker_id, .. } => Some(*worker_id),
            ControlMessage::Shutdown | ControlMessage::Reload => None,
        }
    }
}

/// Discriminant of [`ControlMessage`], used for filtered receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Heartbeat,
    StatusUpdate,
    ErrorReport,
    Statistics,
    Shutdown,
    Reload,
}

/// Which messages a `receive` call accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageFilter {
    #[default]
    Any,
    Only(MessageKind),
}

impl MessageFilter {
    #[inline]
    pub fn matches(self, msg: &ControlMessage) -> bool {
        match self {
            MessageFilter::Any => true,
            MessageFilter::Only(kind) => msg.kind() == kind,
        }
    }
}

impl From<MessageKind> for MessageFilter {
    fn from(kind: MessageKind) -> Self {
        MessageFilter::Only(kind)
    }
}

/// A message plus its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Pid of the sending process.
    pub sender_pid: u32,
    /// Unix millis at send time.
    pub sent_at: u64,
    pub message: ControlMessage,
}

impl Envelope {
    /// Wraps `message` as sent by the current process, now.
    pub fn from_self(message: ControlMessage) -> Self {
        Self {
            sender_pid: std::process::id(),
            sent_at: now_millis(),
            message,
        }
    }
}
