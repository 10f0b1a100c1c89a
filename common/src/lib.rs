//! Shared building blocks for the diskguard crates
//!
//! This crate holds the pieces both the limiter (`throttle`) and the block caches
//! (`blockcache`) depend on:
//!
//! - [`ids`] - block, folder, revision and principal identifiers
//! - [`context`] - request cancellation and deadlines
//! - [`clock`] - wall clock abstraction used for cache recency
//! - [`codec`] - binary encoding of persisted records
//! - [`diskstat`] - free space probe for a filesystem path
//! - [`config`] - limiter, cache, runtime and output settings
//! - [`logging`] - tracing setup and the runtime bootstrap used by the binary

pub mod clock;
pub mod codec;
pub mod config;
pub mod context;
pub mod diskstat;
pub mod ids;
pub mod logging;

pub use config::{CacheConfig, LimiterConfig, OutputConfig, RuntimeConfig};
pub use context::{Interrupted, RequestContext};
pub use ids::{BlockId, Revision, ServerHalf, TlfId, TlfType, UserOrTeamId};
pub use logging::run;
