//! Backpressure accounting for a single scalar resource (bytes or files).
//!
//! With `U` the committed usage, `F` the free amount reported by the filesystem, `k` the
//! fraction of `U + F` this scope may claim and `L` a hard cap, the effective ceiling is
//! `C = min(k(U + F), L)`. Backpressure is zero while `U / C <= m`, maxed out once
//! `U / C >= M`, and linear in between.
//!
//! The semaphore count is `C - U - I` where `I` is whatever is currently reserved but not
//! yet committed or rolled back. Whenever `C` moves the semaphore is adjusted by the delta,
//! which may drive its count negative.
//!
//! Trackers do no locking of their own; callers serialize mutations.

use crate::semaphore::Semaphore;

// keeps the f64 ceiling safely convertible back into an i64
const MAX_CEILING: f64 = (i64::MAX - 512) as f64;

/// Maps a utilization fraction onto `[0, 1]` between the two watermarks.
pub(crate) fn scale_between(used_frac: f64, min_threshold: f64, max_threshold: f64) -> f64 {
    ((used_frac - min_threshold) / (max_threshold - min_threshold)).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ResourceTrackerStatus {
    pub used_frac: f64,
    pub delay_scale: f64,
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub limit_frac: f64,
    pub limit: i64,
    pub used: i64,
    pub free: i64,
    pub max: i64,
    pub count: i64,
}

#[derive(Debug)]
pub struct ResourceTracker {
    min_threshold: f64,
    max_threshold: f64,
    limit_frac: f64,
    limit: i64,
    used: i64,
    free: i64,
    // last value of `curr_limit()` applied to the semaphore
    semaphore_max: i64,
    semaphore: std::sync::Arc<Semaphore>,
}

impl ResourceTracker {
    pub fn new(
        min_threshold: f64,
        max_threshold: f64,
        limit_frac: f64,
        limit: i64,
        initial_free: i64,
    ) -> crate::Result<Self> {
        let invalid = |msg: String| Err(crate::Error::InvalidParams(msg));
        if min_threshold < 0.0 {
            return invalid(format!("min_threshold={min_threshold} < 0.0"));
        }
        if max_threshold < min_threshold {
            return invalid(format!(
                "max_threshold={max_threshold} < min_threshold={min_threshold}"
            ));
        }
        if max_threshold > 1.0 {
            return invalid(format!("max_threshold={max_threshold} > 1.0"));
        }
        if limit_frac <= 0.0 || limit_frac > 1.0 {
            return invalid(format!("limit_frac={limit_frac} not in (0, 1]"));
        }
        if limit < 0 {
            return invalid(format!("limit={limit} < 0"));
        }
        if initial_free < 0 {
            return invalid(format!("initial_free={initial_free} < 0"));
        }
        let mut tracker = Self {
            min_threshold,
            max_threshold,
            limit_frac,
            limit,
            used: 0,
            free: initial_free,
            semaphore_max: 0,
            semaphore: std::sync::Arc::new(Semaphore::new()),
        };
        tracker.update_semaphore_max();
        Ok(tracker)
    }

    /// Current ceiling `min(k(U + F), L)`, computed in floating point to avoid overflow.
    pub fn curr_limit(&self) -> f64 {
        let limit = self.limit_frac * (self.used as f64 + self.free as f64);
        limit.min(self.limit as f64).min(MAX_CEILING)
    }

    pub fn used_frac(&self) -> f64 {
        self.used as f64 / self.curr_limit()
    }

    pub fn used(&self) -> i64 {
        self.used
    }

    pub fn free(&self) -> i64 {
        self.free
    }

    /// Multiplier in `[0, 1]` applied to the maximum delay.
    pub fn delay_scale(&self) -> f64 {
        scale_between(self.used_frac(), self.min_threshold, self.max_threshold)
    }

    /// Handle to the reservation semaphore, for waiting outside the caller's lock.
    pub fn semaphore(&self) -> std::sync::Arc<Semaphore> {
        self.semaphore.clone()
    }

    pub fn count(&self) -> i64 {
        self.semaphore.count()
    }

    fn update_semaphore_max(&mut self) {
        let new_max = self.curr_limit() as i64;
        let delta = new_max - self.semaphore_max;
        if delta > 0 {
            self.semaphore.release(delta);
        } else if delta < 0 {
            self.semaphore.force_acquire(-delta);
        }
        self.semaphore_max = new_max;
    }

    /// Accounts for usage that existed before this tracker was set up and returns the
    /// resulting semaphore count.
    pub fn on_enable(&mut self, used: i64) -> i64 {
        self.used += used;
        self.update_semaphore_max();
        if used == 0 {
            return self.semaphore.count();
        }
        self.semaphore.force_acquire(used)
    }

    pub fn on_disable(&mut self, used: i64) {
        self.used -= used;
        self.update_semaphore_max();
        if used > 0 {
            self.semaphore.release(used);
        }
    }

    pub fn update_free(&mut self, free: i64) {
        self.free = free;
        self.update_semaphore_max();
    }

    /// Blocks until `amount` fits under the ceiling. Returns the remaining count.
    pub async fn reserve(
        &self,
        ctx: &common::RequestContext,
        amount: i64,
    ) -> crate::Result<i64> {
        self.semaphore.acquire(ctx, amount).await
    }

    /// Non-blocking reserve; returns a negative value if `amount` does not fit.
    pub fn try_reserve(&self, amount: i64) -> i64 {
        self.semaphore.try_acquire(amount)
    }

    pub fn commit(&mut self, amount: i64) {
        self.used += amount;
        self.update_semaphore_max();
    }

    pub fn rollback(&mut self, amount: i64) {
        self.semaphore.release(amount);
    }

    pub fn commit_or_rollback(&mut self, amount: i64, commit: bool) {
        if commit {
            self.commit(amount);
        } else {
            self.rollback(amount);
        }
    }

    /// Returns committed usage to the pool, e.g. after a cache eviction.
    pub fn release(&mut self, amount: i64) {
        if amount == 0 {
            return;
        }
        self.semaphore.release(amount);
        self.used -= amount;
        self.update_semaphore_max();
    }

    pub fn get_limit_info(&self) -> (i64, f64) {
        (self.used, self.curr_limit())
    }

    pub fn status(&self) -> ResourceTrackerStatus {
        ResourceTrackerStatus {
            used_frac: self.used_frac(),
            delay_scale: self.delay_scale(),
            min_threshold: self.min_threshold,
            max_threshold: self.max_threshold,
            limit_frac: self.limit_frac,
            limit: self.limit,
            used: self.used,
            free: self.free,
            max: self.semaphore_max,
            count: self.semaphore.count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn construction_rejects_bad_params() {
        assert!(ResourceTracker::new(-0.1, 0.9, 0.25, 100, 200).is_err());
        assert!(ResourceTracker::new(0.9, 0.1, 0.25, 100, 200).is_err());
        assert!(ResourceTracker::new(0.1, 1.1, 0.25, 100, 200).is_err());
        assert!(ResourceTracker::new(0.1, 0.9, 0.0, 100, 200).is_err());
        assert!(ResourceTracker::new(0.1, 0.9, 1.1, 100, 200).is_err());
        assert!(ResourceTracker::new(0.1, 0.9, 0.25, -1, 200).is_err());
        assert!(ResourceTracker::new(0.1, 0.9, 0.25, 100, -1).is_err());
    }

    #[test]
    fn enable_and_disable_move_the_ceiling() {
        let mut tracker = ResourceTracker::new(0.1, 0.9, 0.25, 100, 200).unwrap();
        assert_eq!(tracker.status().max, 50);
        assert_eq!(tracker.count(), 50);

        assert_eq!(tracker.on_enable(10), 42);
        assert_eq!(tracker.status().max, 52);

        tracker.on_disable(9);
        assert_eq!(tracker.status().max, 50);
        assert_eq!(tracker.count(), 49);

        // hitting the hard limit pushes the count negative
        assert_eq!(tracker.on_enable(440), -341);
        assert_eq!(tracker.status().max, 100);

        tracker.on_disable(440);
        assert_eq!(tracker.count(), 49);
    }

    #[tokio::test]
    async fn reserve_commit_rollback_release() {
        let ctx = common::RequestContext::new();
        let mut tracker = ResourceTracker::new(0.1, 0.9, 0.25, 100, 200).unwrap();
        tracker.on_enable(1);
        tracker.update_free(400);
        assert_eq!(tracker.count(), 99);

        assert_eq!(tracker.reserve(&ctx, 10).await.unwrap(), 89);
        tracker.commit(10);
        assert_eq!(tracker.used(), 11);
        assert_eq!(tracker.count(), 89);

        assert_eq!(tracker.reserve(&ctx, 9).await.unwrap(), 80);
        tracker.rollback(9);
        assert_eq!(tracker.count(), 89);
        assert_eq!(tracker.used(), 11);

        tracker.release(11);
        assert_eq!(tracker.used(), 0);
        assert_eq!(tracker.count(), 100);
        // no-op
        tracker.release(0);
        assert_eq!(tracker.count(), 100);
    }

    #[test]
    fn try_reserve_reports_failure_without_side_effects() {
        let tracker = ResourceTracker::new(0.1, 0.9, 1.0, 100, 10).unwrap();
        assert_eq!(tracker.try_reserve(11), -1);
        assert_eq!(tracker.count(), 10);
        assert_eq!(tracker.try_reserve(4), 6);
    }

    #[test]
    fn delay_scale_watermarks() {
        let mut tracker = ResourceTracker::new(0.5, 0.95, 1.0, 1000, 1000).unwrap();
        tracker.on_enable(500);
        // free stays at 500 for a disk of 1000
        tracker.update_free(500);
        assert_eq!(tracker.curr_limit(), 1000.0);
        assert!((tracker.used_frac() - 0.5).abs() < 1e-9);
        assert_eq!(tracker.delay_scale(), 0.0);

        tracker.on_enable(475);
        tracker.update_free(25);
        assert!((tracker.used_frac() - 0.975).abs() < 1e-9);
        assert_eq!(tracker.delay_scale(), 1.0);
    }

    #[test]
    fn huge_limits_do_not_overflow() {
        let tracker = ResourceTracker::new(0.1, 0.9, 1.0, i64::MAX, i64::MAX).unwrap();
        let max = tracker.status().max;
        assert!(max > 0);
        assert_eq!(tracker.count(), max);
    }

    #[tokio::test(start_paused = true)]
    async fn shrinking_free_space_blocks_reserve_until_it_grows_back() {
        let ctx = common::RequestContext::new();
        let mut tracker = ResourceTracker::new(0.1, 0.9, 1.0, 1000, 100).unwrap();
        tracker.reserve(&ctx, 60).await.unwrap();
        tracker.commit(60);
        tracker.update_free(40);
        assert_eq!(tracker.count(), 40);

        // another writer filled the disk: the ceiling drops to what is already used
        tracker.update_free(0);
        assert_eq!(tracker.status().max, 60);
        assert_eq!(tracker.count(), 0);
        let waiter = {
            let semaphore = tracker.semaphore();
            tokio::spawn(async move { semaphore.acquire(&common::RequestContext::new(), 30).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        // not enough yet
        tracker.update_free(20);
        assert_eq!(tracker.count(), 20);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tracker.update_free(50);
        assert_eq!(waiter.await.unwrap().unwrap(), 20);
        assert_eq!(tracker.count(), 20);
        assert_eq!(tracker.status().max, 110);
    }

    proptest! {
        #[test]
        fn delay_scale_is_bounded_and_monotonic(
            min in 0.0f64..1.0,
            spread in 0.001f64..1.0,
            limit in 1i64..1_000_000_000,
            free in 1i64..1_000_000_000,
            a in 0i64..1_000_000,
            b in 0i64..1_000_000,
        ) {
            let max = (min + spread).min(1.0);
            prop_assume!(max > min);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let mut low = ResourceTracker::new(min, max, 0.5, limit, free).unwrap();
            let mut high = ResourceTracker::new(min, max, 0.5, limit, free).unwrap();
            low.on_enable(lo);
            high.on_enable(hi);
            let (s_lo, s_hi) = (low.delay_scale(), high.delay_scale());
            prop_assert!((0.0..=1.0).contains(&s_lo));
            prop_assert!((0.0..=1.0).contains(&s_hi));
            prop_assert!(s_lo <= s_hi);
        }

        #[test]
        fn ceiling_moves_by_at_most_frac_of_free_delta(
            frac in 0.01f64..=1.0,
            used in 0i64..1_000_000,
            free in 0i64..1_000_000,
            delta in 0i64..1_000_000,
        ) {
            let mut tracker = ResourceTracker::new(0.0, 1.0, frac, i64::MAX, free).unwrap();
            tracker.on_enable(used);
            let before = tracker.curr_limit();
            tracker.update_free(free + delta);
            let after = tracker.curr_limit();
            prop_assert!(after >= before);
            prop_assert!(after - before <= frac * delta as f64 + 1e-6);
        }

        #[test]
        fn reserve_then_rollback_is_neutral(
            free in 1i64..1_000_000,
            amount in 1i64..1_000_000,
        ) {
            let mut tracker = ResourceTracker::new(0.0, 1.0, 1.0, i64::MAX, free).unwrap();
            let before = (tracker.count(), tracker.used());
            if tracker.try_reserve(amount) >= 0 {
                tracker.rollback(amount);
            }
            prop_assert_eq!((tracker.count(), tracker.used()), before);
        }
    }
}
