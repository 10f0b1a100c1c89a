//! Rate meters for cache operations.
//!
//! Counters are sharded per thread so hot paths such as `get` never contend on a shared
//! cache line; readers sum the shards.

#[derive(Debug)]
struct TlsCounter {
    // each shard is touched mostly by its own thread, so the mutex is uncontended
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += value;
    }

    fn get(&self) -> u64 {
        self.count.iter().fold(0, |total, shard| {
            total
                + *shard
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct MeterStatus {
    pub count: u64,
    /// Events per second since the meter was created.
    pub rate_mean: f64,
}

/// Counts events and reports their mean rate.
#[derive(Debug)]
pub struct CountMeter {
    count: TlsCounter,
    start: std::time::Instant,
}

impl CountMeter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: TlsCounter::new(),
            start: std::time::Instant::now(),
        }
    }

    pub fn mark(&self, n: u64) {
        self.count.add(n);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.get()
    }

    #[must_use]
    pub fn status(&self) -> MeterStatus {
        let count = self.count();
        let elapsed = self.start.elapsed().as_secs_f64();
        MeterStatus {
            count,
            rate_mean: if elapsed > 0.0 {
                count as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}

impl Default for CountMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Every meter a cache keeps.
#[derive(Debug, Default)]
pub struct CacheMeters {
    pub hit: CountMeter,
    pub miss: CountMeter,
    pub put: CountMeter,
    pub update: CountMeter,
    pub evict_count: CountMeter,
    pub evict_size: CountMeter,
    pub delete_count: CountMeter,
    pub delete_size: CountMeter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct CacheMetersStatus {
    pub hits: MeterStatus,
    pub misses: MeterStatus,
    pub puts: MeterStatus,
    pub metadata_updates: MeterStatus,
    pub evicted_blocks: MeterStatus,
    pub evicted_bytes: MeterStatus,
    pub deleted_blocks: MeterStatus,
    pub deleted_bytes: MeterStatus,
}

impl CacheMeters {
    #[must_use]
    pub fn status(&self) -> CacheMetersStatus {
        CacheMetersStatus {
            hits: self.hit.status(),
            misses: self.miss.status(),
            puts: self.put.status(),
            metadata_updates: self.update.status(),
            evicted_blocks: self.evict_count.status(),
            evicted_bytes: self.evict_size.status(),
            deleted_blocks: self.delete_count.status(),
            deleted_bytes: self.delete_size.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_across_threads() {
        let meter = std::sync::Arc::new(CountMeter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let meter = meter.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        meter.mark(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        meter.mark(10);
        assert_eq!(meter.count(), 410);
        assert!(meter.status().rate_mean >= 0.0);
    }

    #[test]
    fn fresh_meters_are_zero() {
        let meters = CacheMeters::default();
        let status = meters.status();
        assert_eq!(status.hits.count, 0);
        assert_eq!(status.deleted_bytes.count, 0);
    }
}
