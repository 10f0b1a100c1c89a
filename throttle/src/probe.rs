//! Sources of the external numbers the limiter reacts to: free disk space and remote quota.

use common::{RequestContext, UserOrTeamId};

/// Reports the free bytes and files on the filesystem holding the journal and caches.
pub trait FreeSpaceProbe: Send + Sync + std::fmt::Debug {
    fn free_bytes_and_files(&self) -> std::io::Result<(i64, i64)>;
}

/// Reports `(used_bytes, quota_bytes)` for a principal.
///
/// Implementations swallow their own failures and answer `(0, i64::MAX)`, meaning "no
/// known limit".
#[async_trait::async_trait]
pub trait QuotaProbe: Send + Sync + std::fmt::Debug {
    async fn quota(&self, ctx: &RequestContext, charged_to: &UserOrTeamId) -> (i64, i64);
}

/// `statvfs` on a path.
#[derive(Debug, Clone)]
pub struct StatvfsProbe {
    path: std::path::PathBuf,
}

impl StatvfsProbe {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FreeSpaceProbe for StatvfsProbe {
    fn free_bytes_and_files(&self) -> std::io::Result<(i64, i64)> {
        let limits = common::diskstat::disk_limits(&self.path)?;
        let clamp = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);
        Ok((clamp(limits.available_bytes), clamp(limits.available_files)))
    }
}

/// Free space fixed by the owner, for simulations and tests.
#[derive(Debug)]
pub struct StaticFreeSpace {
    bytes: std::sync::atomic::AtomicI64,
    files: std::sync::atomic::AtomicI64,
}

impl StaticFreeSpace {
    pub fn new(bytes: i64, files: i64) -> Self {
        Self {
            bytes: std::sync::atomic::AtomicI64::new(bytes),
            files: std::sync::atomic::AtomicI64::new(files),
        }
    }

    pub fn set(&self, bytes: i64, files: i64) {
        self.bytes.store(bytes, std::sync::atomic::Ordering::SeqCst);
        self.files.store(files, std::sync::atomic::Ordering::SeqCst);
    }
}

impl FreeSpaceProbe for StaticFreeSpace {
    fn free_bytes_and_files(&self) -> std::io::Result<(i64, i64)> {
        Ok((
            self.bytes.load(std::sync::atomic::Ordering::SeqCst),
            self.files.load(std::sync::atomic::Ordering::SeqCst),
        ))
    }
}

/// No quota server; every principal is unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQuota;

#[async_trait::async_trait]
impl QuotaProbe for NoQuota {
    async fn quota(&self, _ctx: &RequestContext, _charged_to: &UserOrTeamId) -> (i64, i64) {
        (0, i64::MAX)
    }
}

/// The same usage and quota for every principal, adjustable at runtime.
#[derive(Debug)]
pub struct StaticQuota {
    used: std::sync::atomic::AtomicI64,
    quota: std::sync::atomic::AtomicI64,
    calls: std::sync::atomic::AtomicU64,
}

impl StaticQuota {
    pub fn new(used: i64, quota: i64) -> Self {
        Self {
            used: std::sync::atomic::AtomicI64::new(used),
            quota: std::sync::atomic::AtomicI64::new(quota),
            calls: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn set(&self, used: i64, quota: i64) {
        self.used.store(used, std::sync::atomic::Ordering::SeqCst);
        self.quota.store(quota, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of times the limiter asked for quota.
    pub fn calls(&self) -> u64 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl QuotaProbe for StaticQuota {
    async fn quota(&self, _ctx: &RequestContext, _charged_to: &UserOrTeamId) -> (i64, i64) {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        (
            self.used.load(std::sync::atomic::Ordering::SeqCst),
            self.quota.load(std::sync::atomic::Ordering::SeqCst),
        )
    }
}
