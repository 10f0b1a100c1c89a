/// Source of wall-clock timestamps used for cache recency.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> std::time::SystemTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> std::time::SystemTime {
        std::time::SystemTime::now()
    }
}

/// Manually advanced clock for tests that need deterministic recency ordering.
#[derive(Debug)]
pub struct TestClock {
    now: std::sync::Mutex<std::time::SystemTime>,
}

impl TestClock {
    #[must_use]
    pub fn new(start: std::time::SystemTime) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn set(&self, now: std::time::SystemTime) {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = now;
    }

    pub fn add(&self, delta: std::time::Duration) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += delta;
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new(std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_500_000_000))
    }
}

impl Clock for TestClock {
    fn now(&self) -> std::time::SystemTime {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
