//! Built-in collaborators so the binary runs without an external data source.
//!
//! - [`SyntheticFeed`] emits one JSON record per subscribed category every
//!   `interval` from a background task.
//! - [`LogSink`] writes each batch to the log.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::unit::{BusinessUnit, ConnectionStatus, Record, Sink, Subscription, UnitEvent, UnitEvents};
use crate::error::{SinkError, UnitError};
use crate::substrate::now_millis;

type Categories = Arc<Mutex<BTreeSet<String>>>;

/// Pseudo-random record generator.
pub struct SyntheticFeed {
    worker_id: u32,
    interval: Duration,
    categories: Categories,
    token: Option<CancellationToken>,
}

impl SyntheticFeed {
    pub fn new(worker_id: u32, interval: Duration) -> Self {
        Self {
            worker_id,
            interval,
            categories: Arc::new(Mutex::new(BTreeSet::new())),
            token: None,
        }
    }

    fn categories(&self) -> Result<std::sync::MutexGuard<'_, BTreeSet<String>>, UnitError> {
        self.categories.lock().map_err(|_| UnitError::Upstream {
            reason: "subscription set poisoned".to_owned(),
        })
    }
}

#[async_trait]
impl BusinessUnit for SyntheticFeed {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn connect(&mut self, events: UnitEvents) -> Result<(), UnitError> {
        self.disconnect().await;

        let token = CancellationToken::new();
        let categories = Arc::clone(&self.categories);
        let (worker_id, interval) = (self.worker_id, self.interval);
        let child = token.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            let mut seq: u64 = 0;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let subscribed: Vec<String> = match categories.lock() {
                    Ok(set) => set.iter().cloned().collect(),
                    Err(_) => break,
                };
                for category in subscribed {
                    seq += 1;
                    let record = synthesize(worker_id, &category, seq);
                    if events.send(UnitEvent::Data(record)).await.is_err() {
                        return;
                    }
                }
            }
        });

        self.token = Some(token);
        tracing::debug!(worker_id = self.worker_id, interval = ?self.interval, "synthetic feed connected");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    async fn subscribe(&mut self, sub: &Subscription) -> Result<(), UnitError> {
        self.categories()?.insert(sub.category.clone());
        Ok(())
    }

    async fn unsubscribe(&mut self, sub: &Subscription) -> Result<(), UnitError> {
        self.categories()?.remove(&sub.category);
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        match &self.token {
            Some(t) if !t.is_cancelled() => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

impl Drop for SyntheticFeed {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

fn synthesize(worker_id: u32, category: &str, seq: u64) -> Record {
    let mut rng = rand::rng();
    let at = now_millis();
    let payload = serde_json::json!({
        "worker": worker_id,
        "seq": seq,
        "value": rng.random_range(0.0..1000.0_f64),
        "volume": rng.random_range(1..=500u32),
        "at": at,
    });
    Record {
        category: category.to_owned(),
        key: format!("w{worker_id}-{seq}"),
        payload: payload.to_string().into_bytes(),
        at,
    }
}

/// Sink that only logs what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn save_batch(&self, category: &str, records: &[Record]) -> Result<(), SinkError> {
        let bytes: usize = records.iter().map(Record::size).sum();
        tracing::debug!(
            category,
            count = records.len(),
            bytes,
            first = records.first().map(|r| r.key.as_str()),
            last = records.last().map(|r| r.key.as_str()),
            "batch saved"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
