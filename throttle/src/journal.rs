//! Aggregate tracker for the journal: bytes, files and per-principal quota.

use crate::quota::{QuotaTracker, QuotaTrackerStatus};
use crate::semaphore::Semaphore;
use crate::tracker::{ResourceTracker, ResourceTrackerStatus};
use crate::{Available, ReserveError};
use common::{RequestContext, UserOrTeamId};

/// Scales an absolute limit by the journal's share, rounding half up.
fn journal_share(limit: i64, journal_frac: f64) -> i64 {
    (limit as f64 * journal_frac + 0.5) as i64
}

/// Plain numbers describing one tracker, used by tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub used: i64,
    pub free: i64,
    pub max: i64,
    pub count: i64,
}

impl From<ResourceTrackerStatus> for Snapshot {
    fn from(status: ResourceTrackerStatus) -> Self {
        Snapshot {
            used: status.used,
            free: status.free,
            max: status.max,
            count: status.count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct JournalTrackerStatus {
    pub byte_status: ResourceTrackerStatus,
    pub file_status: ResourceTrackerStatus,
    pub quota_status: QuotaTrackerStatus,
}

/// Semaphore handles for a journal reservation, usable without holding the limiter lock.
#[derive(Debug, Clone)]
pub struct JournalSemaphores {
    byte: std::sync::Arc<Semaphore>,
    file: std::sync::Arc<Semaphore>,
}

impl JournalSemaphores {
    pub fn counts(&self) -> Available {
        Available {
            bytes: self.byte.count(),
            files: self.file.count(),
        }
    }

    /// Reserves bytes and then files. Either both are held on return or neither is.
    pub async fn reserve(
        &self,
        ctx: &RequestContext,
        bytes: i64,
        files: i64,
    ) -> Result<Available, ReserveError> {
        let available_bytes = match self.byte.acquire(ctx, bytes).await {
            Ok(count) => count,
            Err(error) => return Err(ReserveError::new(error, self.counts())),
        };
        match self.file.acquire(ctx, files).await {
            Ok(available_files) => Ok(Available {
                bytes: available_bytes,
                files: available_files,
            }),
            Err(error) => {
                self.byte.release(bytes);
                Err(ReserveError::new(error, self.counts()))
            }
        }
    }

    /// Returns a reservation that was never committed, e.g. when the caller lost the
    /// race with cancellation after `reserve` succeeded.
    pub fn rollback(&self, bytes: i64, files: i64) {
        self.byte.release(bytes);
        self.file.release(files);
    }
}

#[derive(Debug)]
pub struct JournalTracker {
    byte: ResourceTracker,
    file: ResourceTracker,
    // validated once; cloned for every new principal
    quota_template: QuotaTracker,
    quota: std::collections::HashMap<UserOrTeamId, QuotaTracker>,
}

impl JournalTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        min_threshold: f64,
        max_threshold: f64,
        quota_min_threshold: f64,
        quota_max_threshold: f64,
        journal_frac: f64,
        byte_limit: i64,
        file_limit: i64,
        free_bytes: i64,
        free_files: i64,
    ) -> crate::Result<Self> {
        let byte = ResourceTracker::new(
            min_threshold,
            max_threshold,
            journal_frac,
            journal_share(byte_limit, journal_frac),
            free_bytes,
        )?;
        // only the journal stores individual files, but the file limit is scaled the same
        // way as the byte limit for consistency
        let file = ResourceTracker::new(
            min_threshold,
            max_threshold,
            journal_frac,
            journal_share(file_limit, journal_frac),
            free_files,
        )?;
        let quota_template = QuotaTracker::new(quota_min_threshold, quota_max_threshold)?;
        Ok(Self {
            byte,
            file,
            quota_template,
            quota: std::collections::HashMap::new(),
        })
    }

    // Principals are never removed; there are only as many as people sharing with this user.
    fn quota_mut(&mut self, charged_to: &UserOrTeamId) -> &mut QuotaTracker {
        self.quota
            .entry(charged_to.clone())
            .or_insert_with(|| self.quota_template.clone())
    }

    fn quota(&self, charged_to: &UserOrTeamId) -> std::borrow::Cow<'_, QuotaTracker> {
        match self.quota.get(charged_to) {
            Some(quota) => std::borrow::Cow::Borrowed(quota),
            None => std::borrow::Cow::Owned(self.quota_template.clone()),
        }
    }

    pub fn byte(&self) -> &ResourceTracker {
        &self.byte
    }

    pub fn file(&self) -> &ResourceTracker {
        &self.file
    }

    pub fn semaphores(&self) -> JournalSemaphores {
        JournalSemaphores {
            byte: self.byte.semaphore(),
            file: self.file.semaphore(),
        }
    }

    pub fn snapshots(&self, charged_to: &UserOrTeamId) -> (Snapshot, Snapshot, Snapshot) {
        let (used, quota) = self.quota(charged_to).get_quota_info();
        (
            self.byte.status().into(),
            self.file.status().into(),
            Snapshot {
                used,
                free: quota - used,
                max: 0,
                count: 0,
            },
        )
    }

    /// Registers an existing journal. `stored_bytes` should be at least `unflushed_bytes`
    /// but is not required to be.
    pub fn on_enable(
        &mut self,
        stored_bytes: i64,
        unflushed_bytes: i64,
        files: i64,
        charged_to: &UserOrTeamId,
    ) -> Available {
        let bytes = self.byte.on_enable(stored_bytes);
        let files = self.file.on_enable(files);
        self.quota_mut(charged_to).on_journal_enable(unflushed_bytes);
        Available { bytes, files }
    }

    pub fn on_disable(
        &mut self,
        stored_bytes: i64,
        unflushed_bytes: i64,
        files: i64,
        charged_to: &UserOrTeamId,
    ) {
        self.byte.on_disable(stored_bytes);
        self.file.on_disable(files);
        self.quota_mut(charged_to).on_journal_disable(unflushed_bytes);
    }

    /// The worst of the byte, file and quota curves.
    pub fn get_delay_scale(&self, charged_to: &UserOrTeamId) -> f64 {
        self.byte
            .delay_scale()
            .max(self.file.delay_scale())
            .max(self.quota(charged_to).delay_scale())
    }

    /// Bytes used by other scopes count toward the journal's budget baseline, so the free
    /// figure handed to the byte tracker is `free + overall_used - journal_used`.
    pub fn update_free(&mut self, free_bytes: i64, overall_used_bytes: i64, free_files: i64) {
        let journal_used = self.byte.used();
        self.byte
            .update_free(free_bytes + overall_used_bytes - journal_used);
        self.file.update_free(free_files);
    }

    pub fn update_remote(
        &mut self,
        remote_used_bytes: i64,
        quota_bytes: i64,
        charged_to: &UserOrTeamId,
    ) {
        self.quota_mut(charged_to)
            .update_remote(remote_used_bytes, quota_bytes);
    }

    pub fn has_remote_quota(&self, charged_to: &UserOrTeamId) -> bool {
        self.quota
            .get(charged_to)
            .is_some_and(QuotaTracker::has_remote_quota)
    }

    pub fn semaphore_counts(&self) -> Available {
        Available {
            bytes: self.byte.count(),
            files: self.file.count(),
        }
    }

    pub fn commit_or_rollback(
        &mut self,
        bytes: i64,
        files: i64,
        put_data: bool,
        charged_to: &UserOrTeamId,
    ) {
        self.byte.commit_or_rollback(bytes, put_data);
        self.file.commit_or_rollback(files, put_data);
        self.quota_mut(charged_to).after_block_put(bytes, put_data);
    }

    pub fn on_blocks_flush(&mut self, bytes: i64, charged_to: &UserOrTeamId) {
        self.quota_mut(charged_to).on_blocks_flush(bytes);
    }

    pub fn release(&mut self, bytes: i64, files: i64) {
        self.byte.release(bytes);
        self.file.release(files);
    }

    pub fn status_line(&self, charged_to: &UserOrTeamId) -> String {
        let quota = self.quota(charged_to).status();
        format!(
            "journalBytes={}, freeBytes={}, journalFiles={}, freeFiles={}, \
             quotaUnflushedBytes={}, quotaRemoteUsedBytes={}, quotaBytes={}",
            self.byte.used(),
            self.byte.free(),
            self.file.used(),
            self.file.free(),
            quota.unflushed_bytes,
            quota.remote_used_bytes,
            quota.quota_bytes,
        )
    }

    pub fn get_quota_info(&self, charged_to: &UserOrTeamId) -> (i64, i64) {
        self.quota(charged_to).get_quota_info()
    }

    /// Returns `(used_bytes, limit_bytes, used_files, limit_files)`.
    pub fn get_disk_limit_info(&self) -> (i64, f64, i64, f64) {
        let (used_bytes, limit_bytes) = self.byte.get_limit_info();
        let (used_files, limit_files) = self.file.get_limit_info();
        (used_bytes, limit_bytes, used_files, limit_files)
    }

    pub fn status(&self, charged_to: &UserOrTeamId) -> JournalTrackerStatus {
        JournalTrackerStatus {
            byte_status: self.byte.status(),
            file_status: self.file.status(),
            quota_status: self.quota(charged_to).status(),
        }
    }
}
