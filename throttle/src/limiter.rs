//! The disk limiter: one lock over every tracker, composed into admission decisions.
//!
//! The overall byte tracker caps the journal and the working set cache together. The sync
//! cache is deliberately left out of that cap so pinned data can use all free space.
//!
//! Bookkeeping happens under a `std::sync::RwLock` that is never held across an `.await`;
//! blocking reservations clone the semaphore handles and wait outside the lock.

use crate::journal::{JournalSemaphores, JournalTracker, JournalTrackerStatus, Snapshot};
use crate::probe::{FreeSpaceProbe, QuotaProbe};
use crate::tracker::{ResourceTracker, ResourceTrackerStatus};
use crate::{Available, Error, ReserveError};
use common::{LimiterConfig, RequestContext, UserOrTeamId};
use tracing::instrument;

/// Which scope a reservation is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TrackerKind {
    Journal,
    WorkingSetCache,
    SyncCache,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct DiskLimiterStatus {
    pub kind: &'static str,
    pub current_delay_sec: f64,
    pub journal_tracker_status: JournalTrackerStatus,
    pub disk_cache_byte_status: ResourceTrackerStatus,
    pub sync_cache_byte_status: ResourceTrackerStatus,
}

#[derive(Debug)]
struct Trackers {
    overall: ResourceTracker,
    journal: JournalTracker,
    disk_cache: ResourceTracker,
    sync_cache: ResourceTracker,
}

impl Trackers {
    fn simple(&self, kind: TrackerKind) -> Result<&ResourceTracker, Error> {
        match kind {
            TrackerKind::WorkingSetCache => Ok(&self.disk_cache),
            TrackerKind::SyncCache => Ok(&self.sync_cache),
            TrackerKind::Journal => Err(Error::UnknownTracker(kind)),
        }
    }

    fn simple_mut(&mut self, kind: TrackerKind) -> Result<&mut ResourceTracker, Error> {
        match kind {
            TrackerKind::WorkingSetCache => Ok(&mut self.disk_cache),
            TrackerKind::SyncCache => Ok(&mut self.sync_cache),
            TrackerKind::Journal => Err(Error::UnknownTracker(kind)),
        }
    }

    /// `scale * min(max_delay, time_to_deadline - 1s)`
    fn delay(
        &self,
        ctx: &RequestContext,
        now: tokio::time::Instant,
        max_delay: std::time::Duration,
        charged_to: &UserOrTeamId,
    ) -> std::time::Duration {
        let scale = self.journal.get_delay_scale(charged_to);
        let mut max_delay = max_delay;
        if let Some(deadline) = ctx.deadline() {
            // leave a second of slack for the write itself
            let remaining = deadline
                .saturating_duration_since(now)
                .saturating_sub(std::time::Duration::from_secs(1));
            max_delay = max_delay.min(remaining);
        }
        max_delay.mul_f64(scale)
    }
}

#[derive(Debug)]
pub struct DiskLimiter {
    max_delay: std::time::Duration,
    free_space: std::sync::Arc<dyn FreeSpaceProbe>,
    quota: std::sync::Arc<dyn QuotaProbe>,
    trackers: std::sync::RwLock<Trackers>,
}

impl DiskLimiter {
    pub fn new(
        config: &LimiterConfig,
        free_space: std::sync::Arc<dyn FreeSpaceProbe>,
        quota: std::sync::Arc<dyn QuotaProbe>,
    ) -> crate::Result<Self> {
        config.validate().map_err(Error::InvalidParams)?;
        let (free_bytes, free_files) = free_space.free_bytes_and_files()?;
        let journal = JournalTracker::new(
            config.min_threshold,
            config.max_threshold,
            config.quota_min_threshold,
            config.quota_max_threshold,
            config.journal_frac,
            config.byte_limit,
            config.file_limit,
            free_bytes,
            free_files,
        )?;
        let overall = ResourceTracker::new(1.0, 1.0, 1.0, config.byte_limit, free_bytes)?;
        let disk_cache_limit = (config.byte_limit as f64 * config.disk_cache_frac + 0.5) as i64;
        let disk_cache = ResourceTracker::new(
            1.0,
            1.0,
            config.disk_cache_frac,
            disk_cache_limit,
            free_bytes,
        )?;
        // the byte limit does not apply to the sync cache
        let sync_cache =
            ResourceTracker::new(1.0, 1.0, config.sync_cache_frac, i64::MAX, free_bytes)?;
        Ok(Self {
            max_delay: config.max_delay,
            free_space,
            quota,
            trackers: std::sync::RwLock::new(Trackers {
                overall,
                journal,
                disk_cache,
                sync_cache,
            }),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Trackers> {
        self.trackers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Trackers> {
        self.trackers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn reserve_error(&self, error: Error) -> ReserveError {
        ReserveError::new(error, self.read().journal.semaphore_counts())
    }

    pub fn journal_snapshots(&self, charged_to: &UserOrTeamId) -> (Snapshot, Snapshot, Snapshot) {
        self.read().journal.snapshots(charged_to)
    }

    /// Registers an existing journal with the journal and overall trackers.
    pub fn on_journal_enable(
        &self,
        stored_bytes: i64,
        unflushed_bytes: i64,
        files: i64,
        charged_to: &UserOrTeamId,
    ) -> Available {
        let mut trackers = self.write();
        trackers.overall.on_enable(stored_bytes);
        trackers
            .journal
            .on_enable(stored_bytes, unflushed_bytes, files, charged_to)
    }

    pub fn on_journal_disable(
        &self,
        stored_bytes: i64,
        unflushed_bytes: i64,
        files: i64,
        charged_to: &UserOrTeamId,
    ) {
        let mut trackers = self.write();
        trackers
            .journal
            .on_disable(stored_bytes, unflushed_bytes, files, charged_to);
        trackers.overall.on_disable(stored_bytes);
    }

    /// Registers the bytes a cache already holds on disk when it starts.
    pub fn on_simple_byte_tracker_enable(
        &self,
        kind: TrackerKind,
        cache_bytes: i64,
    ) -> crate::Result<()> {
        let mut trackers = self.write();
        trackers.simple(kind)?;
        trackers.overall.on_enable(cache_bytes);
        if kind != TrackerKind::SyncCache {
            trackers.simple_mut(kind)?.on_enable(cache_bytes);
        }
        Ok(())
    }

    pub fn on_simple_byte_tracker_disable(
        &self,
        kind: TrackerKind,
        cache_bytes: i64,
    ) -> crate::Result<()> {
        let mut trackers = self.write();
        trackers.simple(kind)?;
        if kind != TrackerKind::SyncCache {
            trackers.simple_mut(kind)?.on_disable(cache_bytes);
        }
        trackers.overall.on_disable(cache_bytes);
        Ok(())
    }

    /// Delay a journal write charged to `charged_to` would incur right now.
    pub fn current_delay(
        &self,
        ctx: &RequestContext,
        charged_to: &UserOrTeamId,
    ) -> std::time::Duration {
        self.read()
            .delay(ctx, tokio::time::Instant::now(), self.max_delay, charged_to)
    }

    /// Refreshes free space and quota, sleeps for the backpressure delay and then blocks
    /// until the journal can take `bytes` and `files`.
    ///
    /// On failure nothing is left reserved.
    #[instrument(skip(self, ctx), err(level = "debug"))]
    pub async fn reserve_with_backpressure(
        &self,
        ctx: &RequestContext,
        kind: TrackerKind,
        bytes: i64,
        files: i64,
        charged_to: &UserOrTeamId,
    ) -> Result<Available, ReserveError> {
        if kind != TrackerKind::Journal {
            return Err(self.reserve_error(Error::UnknownTracker(kind)));
        }
        if bytes <= 0 || files <= 0 {
            return Err(self.reserve_error(Error::ZeroAmount));
        }
        let (remote_used_bytes, quota_bytes) = self.quota.quota(ctx, charged_to).await;
        let delay = {
            let mut trackers = self.write();
            // probe under the lock so the numbers cannot go stale while waiting for it
            let (free_bytes, free_files) = match self.free_space.free_bytes_and_files() {
                Ok(free) => free,
                Err(error) => {
                    let available = trackers.journal.semaphore_counts();
                    return Err(ReserveError::new(error.into(), available));
                }
            };
            trackers.overall.update_free(free_bytes);
            let overall_used = trackers.overall.used();
            trackers
                .journal
                .update_free(free_bytes, overall_used, free_files);
            trackers
                .journal
                .update_remote(remote_used_bytes, quota_bytes, charged_to);
            let delay =
                trackers.delay(ctx, tokio::time::Instant::now(), self.max_delay, charged_to);
            if !delay.is_zero() {
                tracing::debug!(
                    "delaying block put of {} bytes and {} files by {:.3} s ({})",
                    bytes,
                    files,
                    delay.as_secs_f64(),
                    trackers.journal.status_line(charged_to)
                );
            }
            delay
        };
        if let Err(reason) = ctx.sleep(delay).await {
            return Err(self.reserve_error(reason.into()));
        }
        let (overall, journal): (_, JournalSemaphores) = {
            let trackers = self.read();
            (trackers.overall.semaphore(), trackers.journal.semaphores())
        };
        let overall_reserved = match overall.acquire(ctx, bytes).await {
            Ok(_) => true,
            Err(error) => {
                // the journal result is the one that counts
                tracing::debug!("error reserving overall tracker: {}", error);
                false
            }
        };
        match journal.reserve(ctx, bytes, files).await {
            Ok(available) => Ok(available),
            Err(error) => {
                if overall_reserved {
                    overall.release(bytes);
                }
                Err(error)
            }
        }
    }

    /// Turns a reservation into usage or hands it back.
    pub fn commit_or_rollback(
        &self,
        kind: TrackerKind,
        bytes: i64,
        files: i64,
        commit: bool,
        charged_to: &UserOrTeamId,
    ) {
        let mut trackers = self.write();
        match kind {
            TrackerKind::Journal => trackers
                .journal
                .commit_or_rollback(bytes, files, commit, charged_to),
            TrackerKind::WorkingSetCache => trackers.disk_cache.commit_or_rollback(bytes, commit),
            TrackerKind::SyncCache => trackers.sync_cache.commit_or_rollback(bytes, commit),
        }
        if kind != TrackerKind::SyncCache {
            trackers.overall.commit_or_rollback(bytes, commit);
        }
    }

    /// The journal uploaded `bytes` for `charged_to`; they no longer count against quota.
    pub fn on_blocks_flush(&self, bytes: i64, charged_to: &UserOrTeamId) {
        self.write().journal.on_blocks_flush(bytes, charged_to);
    }

    /// Frees committed usage, e.g. after a cache eviction.
    pub fn release(&self, kind: TrackerKind, bytes: i64, files: i64) {
        let mut trackers = self.write();
        match kind {
            TrackerKind::Journal => trackers.journal.release(bytes, files),
            TrackerKind::WorkingSetCache => trackers.disk_cache.release(bytes),
            TrackerKind::SyncCache => trackers.sync_cache.release(bytes),
        }
        if kind != TrackerKind::SyncCache {
            trackers.overall.release(bytes);
        }
    }

    /// Non-blocking reservation for the caches. A negative return means `bytes` did not fit
    /// and nothing was reserved.
    pub fn reserve_bytes(&self, kind: TrackerKind, bytes: i64) -> crate::Result<i64> {
        if bytes <= 0 {
            return Err(Error::ZeroAmount);
        }
        let mut trackers = self.write();
        trackers.simple(kind)?;
        let (free_bytes, _) = self.free_space.free_bytes_and_files()?;
        trackers.overall.update_free(free_bytes);
        let overall_used = trackers.overall.used();
        if kind == TrackerKind::SyncCache {
            // pinned data may claim all free space, even what other caches also count
            trackers
                .sync_cache
                .update_free(free_bytes + overall_used);
        } else {
            let count = trackers.overall.try_reserve(bytes);
            if count < 0 {
                return Ok(count);
            }
            let tracker = trackers.simple_mut(kind)?;
            let tracker_used = tracker.used();
            tracker.update_free(free_bytes + overall_used - tracker_used);
        }
        let count = trackers.simple(kind)?.try_reserve(bytes);
        if count < 0 && kind != TrackerKind::SyncCache {
            trackers.overall.rollback(bytes);
        }
        Ok(count)
    }

    pub fn get_quota_info(&self, charged_to: &UserOrTeamId) -> (i64, i64) {
        self.read().journal.get_quota_info(charged_to)
    }

    /// Journal `(used_bytes, limit_bytes, used_files, limit_files)`.
    pub fn get_disk_limit_info(&self) -> (i64, f64, i64, f64) {
        self.read().journal.get_disk_limit_info()
    }

    pub fn tracker_status(&self, kind: TrackerKind) -> crate::Result<ResourceTrackerStatus> {
        Ok(self.read().simple(kind)?.status())
    }

    /// Snapshot of every tracker. Fetches the quota for `charged_to` first if it has never
    /// been fetched.
    pub async fn get_status(
        &self,
        ctx: &RequestContext,
        charged_to: &UserOrTeamId,
    ) -> DiskLimiterStatus {
        let known = self.read().journal.has_remote_quota(charged_to);
        if !known {
            let (remote_used_bytes, quota_bytes) = self.quota.quota(ctx, charged_to).await;
            self.write()
                .journal
                .update_remote(remote_used_bytes, quota_bytes, charged_to);
        }
        let trackers = self.read();
        let current_delay = trackers.delay(
            &RequestContext::new(),
            tokio::time::Instant::now(),
            self.max_delay,
            charged_to,
        );
        DiskLimiterStatus {
            kind: "BackpressureDiskLimiter",
            current_delay_sec: current_delay.as_secs_f64(),
            journal_tracker_status: trackers.journal.status(charged_to),
            disk_cache_byte_status: trackers.disk_cache.status(),
            sync_cache_byte_status: trackers.sync_cache.status(),
        }
    }
}
