//! Persistent block caches with sampled LRU eviction
//!
//! Two tiers keep encrypted blocks on local disk:
//!
//! - the working-set tier holds recently used blocks and evicts to stay within its share of
//!   the disk limiter
//! - the sync tier holds blocks of folders the user asked to keep offline and never evicts;
//!   a put that does not fit fails instead
//!
//! Each tier stores blocks, metadata, a per-folder index and last unreferenced revisions in
//! its own LSM keyspace. Totals are kept in memory and rebuilt from the metadata when a tier
//! opens, so a tier answers `Starting` errors until that scan is done.
//!
//! # Pieces
//!
//! - [`DiskBlockCache`] - one tier
//! - [`TwoTierCache`] - both tiers behind one interface, moving blocks toward the preferred one
//! - [`store`] - the keyspace layout
//! - [`evict`] - pivot sampling and weighted folder choice
//! - [`meter`] - per-operation rate meters

pub mod counts;
pub mod error;
pub mod evict;
pub mod local;
pub mod metadata;
pub mod meter;
pub mod store;
pub mod version;
pub mod wrapped;

pub use error::{Error, Result};
pub use local::{CacheTier, DiskBlockCache, DiskBlockCacheStatus, StartState};
pub use metadata::{CachedBlock, Metadata, PrefetchStatus};
pub use meter::{CacheMetersStatus, MeterStatus};
pub use wrapped::{CacheType, TwoTierCache};
