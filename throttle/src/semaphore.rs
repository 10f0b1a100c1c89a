//! Counting semaphore with a signed count.
//!
//! Unlike `tokio::sync::Semaphore` the count may go negative: shrinking the capacity of a
//! tracker force-acquires the difference, and any new acquisition then waits until enough
//! is released to bring the count back above the request.

use common::RequestContext;

#[derive(Debug)]
pub struct Semaphore {
    count: std::sync::Mutex<i64>,
    notify: tokio::sync::Notify,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl Semaphore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: std::sync::Mutex::new(0),
            notify: tokio::sync::Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, i64> {
        self.count.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn count(&self) -> i64 {
        *self.lock()
    }

    /// Waits until the count is at least `n`, then subtracts `n` and returns the new count.
    ///
    /// Waiters are not served in strict arrival order.
    pub async fn acquire(&self, ctx: &RequestContext, n: i64) -> Result<i64, crate::Error> {
        if n <= 0 {
            return Err(crate::Error::ZeroAmount);
        }
        loop {
            // register interest before checking so a release in between is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut count = self.lock();
                if *count >= n {
                    *count -= n;
                    return Ok(*count);
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                reason = ctx.done() => return Err(reason.into()),
            }
        }
    }

    /// Subtracts `n` if the count is at least `n` and returns the new count, otherwise
    /// returns -1 and leaves the count untouched.
    pub fn try_acquire(&self, n: i64) -> i64 {
        let mut count = self.lock();
        if *count >= n {
            *count -= n;
            *count
        } else {
            -1
        }
    }

    /// Subtracts `n` unconditionally, possibly driving the count negative.
    pub fn force_acquire(&self, n: i64) -> i64 {
        let mut count = self.lock();
        *count -= n;
        *count
    }

    pub fn release(&self, n: i64) -> i64 {
        let new_count = {
            let mut count = self.lock();
            *count += n;
            *count
        };
        self.notify.notify_waiters();
        new_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let sem = Semaphore::new();
        sem.release(10);
        let ctx = RequestContext::new();
        assert_eq!(sem.acquire(&ctx, 4).await.unwrap(), 6);
        assert_eq!(sem.try_acquire(7), -1);
        assert_eq!(sem.count(), 6);
        assert_eq!(sem.try_acquire(6), 0);
        assert_eq!(sem.release(3), 3);
    }

    #[tokio::test]
    async fn zero_request_is_rejected() {
        let sem = Semaphore::new();
        let ctx = RequestContext::new();
        assert!(matches!(
            sem.acquire(&ctx, 0).await,
            Err(crate::Error::ZeroAmount)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_count_blocks_until_released() {
        let sem = std::sync::Arc::new(Semaphore::new());
        sem.release(5);
        assert_eq!(sem.force_acquire(8), -3);
        let waiter = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.acquire(&RequestContext::new(), 2).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        sem.release(4);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        sem.release(1);
        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquire_leaves_count_untouched() {
        let sem = Semaphore::new();
        sem.release(1);
        let ctx = RequestContext::with_timeout(std::time::Duration::from_secs(1));
        let res = sem.acquire(&ctx, 2).await;
        assert!(matches!(
            res,
            Err(crate::Error::Interrupted(common::Interrupted::DeadlineExceeded))
        ));
        assert_eq!(sem.count(), 1);
    }
}
