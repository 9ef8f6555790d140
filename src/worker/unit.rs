//! # Business unit and sink contracts.
//!
//! A worker runs one [`BusinessUnit`] (the upstream data source) and writes what
//! it produces to one [`Sink`]. The unit talks back to the runtime through a
//! bounded channel of [`UnitEvent`]s handed to [`BusinessUnit::connect`]:
//!
//! ```text
//! BusinessUnit ──UnitEvent::Data──────► runtime ──► BatchBuffers ──► Sink::save_batch
//!              ──UnitEvent::Error─────►         ──► ErrorReport to supervisor
//!              ──UnitEvent::Status────►         ──► reconnection
//! ```

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{SinkError, UnitError};

/// Connection state of a business unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// The connection broke; the runtime will reconnect.
    Failed,
}

/// One unit of business data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    /// Buffer the record belongs to (data type, topic, ...).
    pub category: String,
    pub key: String,
    pub payload: Vec<u8>,
    /// Unix millis when the unit produced it.
    pub at: u64,
}

impl Record {
    /// Bytes accounted for statistics.
    #[inline]
    pub fn size(&self) -> usize {
        self.key.len() + self.payload.len()
    }
}

/// What a unit reports to the runtime.
#[derive(Debug, Clone)]
pub enum UnitEvent {
    Data(Record),
    Error(UnitError),
    Status(ConnectionStatus),
}

/// Sender half given to the unit on every connect.
pub type UnitEvents = mpsc::Sender<UnitEvent>;

/// Subscription parameters for one category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub category: String,
}

impl Subscription {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
        }
    }
}

/// Upstream data source run inside a worker.
///
/// Errors are transient: the runtime reports them and reconnects.
#[async_trait]
pub trait BusinessUnit: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Opens the connection; events flow into `events` until `disconnect`.
    async fn connect(&mut self, events: UnitEvents) -> Result<(), UnitError>;

    /// Closes the connection. Must be safe to call when already disconnected.
    async fn disconnect(&mut self);

    async fn subscribe(&mut self, sub: &Subscription) -> Result<(), UnitError>;

    async fn unsubscribe(&mut self, sub: &Subscription) -> Result<(), UnitError>;

    fn status(&self) -> ConnectionStatus;
}

/// Destination of flushed batches.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Persists one batch of a single category.
    async fn save_batch(&self, category: &str, records: &[Record]) -> Result<(), SinkError>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
