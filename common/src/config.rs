//! Configuration types for the limiter, the caches and the runtime

const GIB: i64 = 1024 * 1024 * 1024;

/// Backpressure and admission limits for the disk limiter
#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    /// Fraction of the journal's ceiling at which backpressure starts
    pub min_threshold: f64,
    /// Fraction of the journal's ceiling at which backpressure is maxed out
    pub max_threshold: f64,
    /// Fraction of quota at which quota backpressure starts
    pub quota_min_threshold: f64,
    /// Fraction of quota at which quota backpressure is maxed out
    pub quota_max_threshold: f64,
    /// Fraction of free bytes and files the journal may use
    pub journal_frac: f64,
    /// Fraction of free bytes the working set cache may use
    pub disk_cache_frac: f64,
    /// Fraction of free bytes the sync cache may use
    pub sync_cache_frac: f64,
    /// Absolute cap on bytes across the journal and the working set cache
    pub byte_limit: i64,
    /// Absolute cap on files; only the journal stores individual files
    pub file_limit: i64,
    /// Longest delay applied to a single journal write
    pub max_delay: std::time::Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            // start backpressure when 50% of free bytes or files are used...
            min_threshold: 0.5,
            // ...and max it out slightly below 100% to allow for estimate inaccuracy
            max_threshold: 0.95,
            quota_min_threshold: 1.0,
            quota_max_threshold: 1.2,
            journal_frac: 0.85,
            disk_cache_frac: 0.10,
            sync_cache_frac: 1.0,
            // journal gets at most 170 GiB of this, the working set cache 20 GiB
            byte_limit: 200 * GIB,
            file_limit: 6_000_000,
            max_delay: std::time::Duration::from_secs(10),
        }
    }
}

impl LimiterConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.min_threshold) {
            return Err(format!("min_threshold={} not in [0, 1]", self.min_threshold));
        }
        if self.max_threshold < self.min_threshold || self.max_threshold > 1.0 {
            return Err(format!(
                "max_threshold={} not in [min_threshold={}, 1]",
                self.max_threshold, self.min_threshold
            ));
        }
        if self.quota_min_threshold < 0.0 || self.quota_max_threshold < self.quota_min_threshold {
            return Err(format!(
                "quota thresholds out of order: min={} max={}",
                self.quota_min_threshold, self.quota_max_threshold
            ));
        }
        for (name, frac) in [
            ("journal_frac", self.journal_frac),
            ("disk_cache_frac", self.disk_cache_frac),
            ("sync_cache_frac", self.sync_cache_frac),
        ] {
            if frac <= 0.0 || frac > 1.0 {
                return Err(format!("{name}={frac} not in (0, 1]"));
            }
        }
        if self.byte_limit < 0 || self.file_limit < 0 {
            return Err("byte_limit and file_limit must not be negative".to_string());
        }
        Ok(())
    }
}

/// Tuning knobs for a single disk block cache tier
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Blocks evicted per eviction round while making room for a put
    pub blocks_to_evict: usize,
    /// Blocks removed per batch when clearing a folder
    pub blocks_to_evict_on_clear: usize,
    /// Blocks inspected per batch when deleting unmarked blocks
    pub unmarked_blocks_to_check: usize,
    /// Pause between batches of a folder clear or unmarked sweep
    pub clear_backoff: std::time::Duration,
    /// Eviction rounds attempted by a single put before giving up
    pub max_evictions_per_put: usize,
    /// Candidates sampled per block to evict
    pub eviction_sampling_factor: usize,
    /// Cross-tier deletes allowed to run in the background at once
    pub max_pending_deletes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            blocks_to_evict: 10,
            blocks_to_evict_on_clear: 100,
            unmarked_blocks_to_check: 100,
            clear_backoff: std::time::Duration::from_secs(1),
            max_evictions_per_put: 100,
            eviction_sampling_factor: 3,
            max_pending_deletes: 100,
        }
    }
}

impl CacheConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.blocks_to_evict == 0 || self.blocks_to_evict_on_clear == 0 {
            return Err("eviction batch sizes must be positive".to_string());
        }
        if self.unmarked_blocks_to_check == 0 {
            return Err("unmarked_blocks_to_check must be positive".to_string());
        }
        if self.eviction_sampling_factor == 0 {
            return Err("eviction_sampling_factor must be positive".to_string());
        }
        if self.max_pending_deletes == 0 {
            return Err("max_pending_deletes must be positive".to_string());
        }
        Ok(())
    }
}

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(LimiterConfig::default().validate().is_ok());
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let config = LimiterConfig {
            min_threshold: 0.9,
            max_threshold: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = LimiterConfig {
            journal_frac: 0.0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("journal_frac"));
    }

    #[test]
    fn zero_background_limit_is_rejected() {
        let config = CacheConfig {
            max_pending_deletes: 0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("max_pending_deletes"));
    }
}
