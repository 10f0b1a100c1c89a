//! Disk and quota backpressure for the journal and the block caches
//!
//! Writers reserve room before putting a block on disk and later commit or roll back the
//! reservation. Instead of failing outright when space runs low, journal writes are delayed
//! in proportion to how close the journal is to its limits, giving uploads time to drain.
//!
//! # Pieces
//!
//! - [`Semaphore`] - counting semaphore whose count may go negative, so its capacity can
//!   shrink under waiters
//! - [`ResourceTracker`] - one scalar resource (bytes or files) with a ceiling that follows
//!   free disk space
//! - [`QuotaTracker`] - unflushed plus remote usage against a server-side quota
//! - [`JournalTracker`] - byte, file and per-principal quota trackers for the journal
//! - [`DiskLimiter`] - the entry point, adding an overall byte cap and one tracker per cache
//!
//! # Protocol
//!
//! ```text
//! reserve_with_backpressure / reserve_bytes
//!         |
//!   commit_or_rollback(commit = wrote new data)
//!         |
//!   release (eviction, flush, deletion)
//! ```
//!
//! Sync cache bytes never count toward the overall cap.

pub mod error;
pub mod journal;
pub mod limiter;
pub mod probe;
pub mod quota;
pub mod semaphore;
pub mod tracker;

pub use error::{Available, Error, ReserveError, Result};
pub use journal::{JournalTracker, JournalTrackerStatus};
pub use limiter::{DiskLimiter, DiskLimiterStatus, TrackerKind};
pub use probe::{FreeSpaceProbe, NoQuota, QuotaProbe, StaticFreeSpace, StaticQuota, StatvfsProbe};
pub use quota::{QuotaTracker, QuotaTrackerStatus};
pub use semaphore::Semaphore;
pub use tracker::{ResourceTracker, ResourceTrackerStatus};
