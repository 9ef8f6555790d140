//! Worker-local counters and the increments pushed to the supervisor.

use crate::substrate::StatsSnapshot;

/// Cumulative counters plus what has already been reported.
#[derive(Debug, Default)]
pub struct WorkerStats {
    totals: StatsSnapshot,
    reported: StatsSnapshot,
}

impl WorkerStats {
    pub fn record_message(&mut self, bytes: usize) {
        self.totals.messages_processed += 1;
        self.totals.bytes_received += bytes as u64;
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.totals.bytes_sent += bytes as u64;
    }

    pub fn record_error(&mut self) {
        self.totals.errors += 1;
    }

    pub fn totals(&self) -> StatsSnapshot {
        self.totals
    }

    /// Counters gained since the previous call.
    pub fn take_delta(&mut self) -> StatsSnapshot {
        let delta = StatsSnapshot {
            messages_processed: self.totals.messages_processed - self.reported.messages_processed,
            bytes_received: self.totals.bytes_received - self.reported.bytes_received,
            bytes_sent: self.totals.bytes_sent - self.reported.bytes_sent,
            errors: self.totals.errors - self.reported.errors,
        };
        self.reported = self.totals;
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_do_not_double_count() {
        let mut s = WorkerStats::default();
        s.record_message(10);
        s.record_message(5);
        s.record_error();

        let d1 = s.take_delta();
        assert_eq!(d1.messages_processed, 2);
        assert_eq!(d1.bytes_received, 15);
        assert_eq!(d1.errors, 1);

        s.record_sent(15);
        let d2 = s.take_delta();
        assert_eq!(d2.messages_processed, 0);
        assert_eq!(d2.bytes_sent, 15);
        assert!(s.take_delta().is_empty());
        assert_eq!(s.totals().bytes_received, 15);
    }
}
