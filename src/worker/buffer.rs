//! # Per-category batch buffers with a size-or-age flush trigger.
//!
//! A category's buffer is flushed when it holds `batch_size` records, or when
//! its oldest record has waited `flush_interval`, whichever comes first.
//! Times are passed in so the trigger logic is deterministic under test.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::unit::Record;

/// Records of one category ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub category: String,
    pub records: Vec<Record>,
}

impl Batch {
    /// Sum of record sizes.
    pub fn bytes(&self) -> usize {
        self.records.iter().map(Record::size).sum()
    }
}

#[derive(Debug)]
struct Pending {
    records: Vec<Record>,
    oldest: Instant,
}

/// Buffers keyed by category.
#[derive(Debug)]
pub struct BatchBuffers {
    batch_size: usize,
    flush_interval: Duration,
    pending: HashMap<String, Pending>,
}

impl BatchBuffers {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            flush_interval,
            pending: HashMap::new(),
        }
    }

    /// Applies new limits; they take effect on the next push or due check.
    pub fn reconfigure(&mut self, batch_size: usize, flush_interval: Duration) {
        self.batch_size = batch_size.max(1);
        self.flush_interval = flush_interval;
    }

    /// Buffers `record`; returns the category's batch if it just became full.
    pub fn push(&mut self, record: Record, now: Instant) -> Option<Batch> {
        let entry = self
            .pending
            .entry(record.category.clone())
            .or_insert_with(|| Pending {
                records: Vec::new(),
                oldest: now,
            });
        if entry.records.is_empty() {
            entry.oldest = now;
        }
        entry.records.push(record);

        if entry.records.len() >= self.batch_size {
            let category = entry.records[0].category.clone();
            let records = std::mem::take(&mut entry.records);
            return Some(Batch { category, records });
        }
        None
    }

    /// Takes every non-empty buffer whose oldest record is at least `flush_interval` old.
    pub fn take_due(&mut self, now: Instant) -> Vec<Batch> {
        let interval = self.flush_interval;
        let mut due = Vec::new();
        for (category, p) in &mut self.pending {
            if !p.records.is_empty() && now.saturating_duration_since(p.oldest) >= interval {
                due.push(Batch {
                    category: category.clone(),
                    records: std::mem::take(&mut p.records),
                });
            }
        }
        due
    }

    /// Takes every non-empty buffer.
    pub fn drain(&mut self) -> Vec<Batch> {
        self.pending
            .drain()
            .filter(|(_, p)| !p.records.is_empty())
            .map(|(category, p)| Batch {
                category,
                records: p.records,
            })
            .collect()
    }

    /// Records currently buffered across all categories.
    pub fn len(&self) -> usize {
        self.pending.values().map(|p| p.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(category: &str, key: &str) -> Record {
        Record {
            category: category.to_owned(),
            key: key.to_owned(),
            payload: vec![0; 10],
            at: 0,
        }
    }

    #[test]
    fn size_trigger_flushes_one_category() {
        let mut buf = BatchBuffers::new(3, Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(buf.push(rec("tick", "a"), t0).is_none());
        assert!(buf.push(rec("depth", "x"), t0).is_none());
        assert!(buf.push(rec("tick", "b"), t0).is_none());
        let batch = buf.push(rec("tick", "c"), t0).expect("tick is full");

        assert_eq!(batch.category, "tick");
        let keys: Vec<&str> = batch.records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(batch.bytes(), 33);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn age_trigger_uses_oldest_record() {
        let mut buf = BatchBuffers::new(100, Duration::from_millis(500));
        let t0 = Instant::now();

        buf.push(rec("tick", "a"), t0);
        buf.push(rec("tick", "b"), t0 + Duration::from_millis(400));
        assert!(buf.take_due(t0 + Duration::from_millis(499)).is_empty());

        let due = buf.take_due(t0 + Duration::from_millis(500));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].records.len(), 2);
        assert!(buf.is_empty());

        // a fresh record restarts the clock for that category
        buf.push(rec("tick", "c"), t0 + Duration::from_secs(2));
        assert!(buf.take_due(t0 + Duration::from_millis(2_100)).is_empty());
    }

    #[test]
    fn drain_returns_everything_non_empty() {
        let mut buf = BatchBuffers::new(10, Duration::from_secs(1));
        let t0 = Instant::now();
        buf.push(rec("tick", "a"), t0);
        buf.push(rec("depth", "b"), t0);
        buf.push(rec("trade", "c"), t0);
        buf.take_due(t0 + Duration::from_secs(5));
        buf.push(rec("tick", "d"), t0 + Duration::from_secs(5));

        let mut cats: Vec<String> = buf.drain().into_iter().map(|b| b.category).collect();
        cats.sort();
        assert_eq!(cats, vec!["tick"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn reconfigure_shrinks_batch_size() {
        let mut buf = BatchBuffers::new(10, Duration::from_secs(1));
        let t0 = Instant::now();
        buf.push(rec("tick", "a"), t0);
        buf.reconfigure(2, Duration::from_secs(1));
        assert!(buf.push(rec("tick", "b"), t0).is_some());
    }
}
