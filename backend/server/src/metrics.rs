use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct SweepMetrics {
    pub sweeps_total: Counter,
    pub sweeps_rejected_total: Counter,
    pub sweeps_timed_out_total: Counter,
    pub backups_committed_total: Counter,
    pub skipped_invalid_total: Counter,
    pub skipped_stale_total: Counter,
    pub bin_failures_total: Counter,
}

impl SweepMetrics {
    pub fn emit(&self) {
        tracing::info!(
            target: "ecobin_metrics",
            sweeps_total = self.sweeps_total.get(),
            sweeps_rejected_total = self.sweeps_rejected_total.get(),
            sweeps_timed_out_total = self.sweeps_timed_out_total.get(),
            backups_committed_total = self.backups_committed_total.get(),
            skipped_invalid_total = self.skipped_invalid_total.get(),
            skipped_stale_total = self.skipped_stale_total.get(),
            bin_failures_total = self.bin_failures_total.get(),
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::default();
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
    }
}
