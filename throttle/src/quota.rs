//! Quota backpressure for one charged-to principal.
//!
//! With `U` the bytes still unflushed in the journal, `R` the usage last reported by the
//! server and `Q` the quota, backpressure scales linearly while `m <= (U + R) / Q <= M`.
//! Until the server reports a quota `Q` is effectively unlimited, so no delay applies.

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct QuotaTrackerStatus {
    pub used_frac: f64,
    pub delay_scale: f64,
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub unflushed_bytes: i64,
    pub remote_used_bytes: i64,
    pub quota_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct QuotaTracker {
    min_threshold: f64,
    max_threshold: f64,
    unflushed_bytes: i64,
    remote_used_bytes: i64,
    quota_bytes: i64,
}

impl QuotaTracker {
    pub fn new(min_threshold: f64, max_threshold: f64) -> crate::Result<Self> {
        if min_threshold < 0.0 {
            return Err(crate::Error::InvalidParams(format!(
                "quota min_threshold={min_threshold} < 0.0"
            )));
        }
        if max_threshold < min_threshold {
            return Err(crate::Error::InvalidParams(format!(
                "quota max_threshold={max_threshold} < min_threshold={min_threshold}"
            )));
        }
        Ok(Self {
            min_threshold,
            max_threshold,
            unflushed_bytes: 0,
            remote_used_bytes: 0,
            quota_bytes: i64::MAX,
        })
    }

    pub fn used_frac(&self) -> f64 {
        (self.unflushed_bytes as f64 + self.remote_used_bytes as f64) / self.quota_bytes as f64
    }

    pub fn delay_scale(&self) -> f64 {
        crate::tracker::scale_between(self.used_frac(), self.min_threshold, self.max_threshold)
    }

    /// Returns `(used, quota)` where used counts unflushed local bytes too.
    pub fn get_quota_info(&self) -> (i64, i64) {
        (
            self.unflushed_bytes + self.remote_used_bytes,
            self.quota_bytes,
        )
    }

    /// Whether the server has ever reported a quota for this principal.
    pub fn has_remote_quota(&self) -> bool {
        self.quota_bytes != i64::MAX
    }

    pub fn on_journal_enable(&mut self, unflushed_bytes: i64) {
        self.unflushed_bytes += unflushed_bytes;
    }

    pub fn on_journal_disable(&mut self, unflushed_bytes: i64) {
        self.unflushed_bytes -= unflushed_bytes;
    }

    /// Replaces the server-side numbers.
    pub fn update_remote(&mut self, remote_used_bytes: i64, quota_bytes: i64) {
        self.remote_used_bytes = remote_used_bytes;
        self.quota_bytes = quota_bytes;
    }

    /// Only blocks that actually wrote new data count against quota.
    pub fn after_block_put(&mut self, block_bytes: i64, put_data: bool) {
        if put_data {
            self.unflushed_bytes += block_bytes;
        }
    }

    pub fn on_blocks_flush(&mut self, block_bytes: i64) {
        self.unflushed_bytes -= block_bytes;
    }

    pub fn status(&self) -> QuotaTrackerStatus {
        QuotaTrackerStatus {
            used_frac: self.used_frac(),
            delay_scale: self.delay_scale(),
            min_threshold: self.min_threshold,
            max_threshold: self.max_threshold,
            unflushed_bytes: self.unflushed_bytes,
            remote_used_bytes: self.remote_used_bytes,
            quota_bytes: self.quota_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_thresholds() {
        assert!(QuotaTracker::new(-0.1, 0.9).is_err());
        assert!(QuotaTracker::new(0.9, 0.1).is_err());
        // quota thresholds may exceed 1.0
        assert!(QuotaTracker::new(1.0, 1.2).is_ok());
    }

    #[test]
    fn unknown_quota_means_no_delay() {
        let mut tracker = QuotaTracker::new(0.1, 0.9).unwrap();
        tracker.on_journal_enable(1 << 40);
        assert!(tracker.used_frac() < 1e-6);
        assert_eq!(tracker.delay_scale(), 0.0);
        assert!(!tracker.has_remote_quota());
    }

    #[test]
    fn counters() {
        let mut tracker = QuotaTracker::new(0.1, 0.9).unwrap();
        tracker.on_journal_enable(10);
        assert_eq!(tracker.status().unflushed_bytes, 10);
        tracker.on_journal_disable(9);
        assert_eq!(tracker.status().unflushed_bytes, 1);

        tracker.update_remote(10, 100);
        assert!(tracker.has_remote_quota());
        assert_eq!(tracker.get_quota_info(), (11, 100));

        tracker.after_block_put(10, true);
        assert_eq!(tracker.status().unflushed_bytes, 11);
        tracker.after_block_put(9, false);
        assert_eq!(tracker.status().unflushed_bytes, 11);

        tracker.on_blocks_flush(10);
        assert_eq!(tracker.status().unflushed_bytes, 1);
        assert!((tracker.used_frac() - 0.11).abs() < 1e-9);
    }

    #[test]
    fn delay_scale_interpolates_over_quota() {
        let mut tracker = QuotaTracker::new(1.0, 1.2).unwrap();
        tracker.update_remote(100, 100);
        assert_eq!(tracker.delay_scale(), 0.0);
        tracker.on_journal_enable(10);
        assert!((tracker.delay_scale() - 0.5).abs() < 1e-9);
        tracker.on_journal_enable(20);
        assert_eq!(tracker.delay_scale(), 1.0);
    }
}
