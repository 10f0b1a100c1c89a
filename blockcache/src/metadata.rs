//! Records persisted in the cache partitions.

use common::{Revision, ServerHalf, TlfId};
use serde::{Deserialize, Serialize};

/// How far prefetching of a block's children has progressed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PrefetchStatus {
    #[default]
    NoPrefetch,
    TriggeredPrefetch,
    FinishedPrefetch,
}

impl std::fmt::Display for PrefetchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PrefetchStatus::NoPrefetch => "NoPrefetch",
            PrefetchStatus::TriggeredPrefetch => "TriggeredPrefetch",
            PrefetchStatus::FinishedPrefetch => "FinishedPrefetch",
        };
        f.write_str(name)
    }
}

/// Per-block bookkeeping, stored separately from the payload so recency updates never
/// rewrite block data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub tlf_id: TlfId,
    pub block_size: u32,
    pub lru_time: std::time::SystemTime,
    pub triggered_prefetch: bool,
    pub finished_prefetch: bool,
    /// Opaque label used by mark-and-sweep cleanup.
    pub tag: String,
}

impl Metadata {
    #[must_use]
    pub fn new(tlf_id: TlfId, block_size: u32, lru_time: std::time::SystemTime) -> Self {
        Self {
            tlf_id,
            block_size,
            lru_time,
            triggered_prefetch: false,
            finished_prefetch: false,
            tag: String::new(),
        }
    }

    #[must_use]
    pub fn prefetch_status(&self) -> PrefetchStatus {
        if self.finished_prefetch {
            PrefetchStatus::FinishedPrefetch
        } else if self.triggered_prefetch {
            PrefetchStatus::TriggeredPrefetch
        } else {
            PrefetchStatus::NoPrefetch
        }
    }

    /// Applies a new prefetch status. Returns false when the block was already finished,
    /// since finished is never downgraded.
    pub fn set_prefetch_status(&mut self, status: PrefetchStatus) -> bool {
        if self.finished_prefetch {
            return false;
        }
        self.triggered_prefetch = status >= PrefetchStatus::TriggeredPrefetch;
        self.finished_prefetch = status == PrefetchStatus::FinishedPrefetch;
        true
    }
}

/// Encrypted payload plus the server half of its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub buf: Vec<u8>,
    pub server_half: ServerHalf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUnrefEntry {
    pub rev: Revision,
    pub ctime: std::time::SystemTime,
}

/// A block as returned by a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBlock {
    pub buf: Vec<u8>,
    pub server_half: ServerHalf,
    pub prefetch_status: PrefetchStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> Metadata {
        Metadata::new(
            TlfId::random(common::TlfType::Private),
            10,
            std::time::UNIX_EPOCH,
        )
    }

    #[test]
    fn prefetch_status_is_derived_from_flags() {
        let mut md = metadata();
        assert_eq!(md.prefetch_status(), PrefetchStatus::NoPrefetch);
        assert!(md.set_prefetch_status(PrefetchStatus::TriggeredPrefetch));
        assert_eq!(md.prefetch_status(), PrefetchStatus::TriggeredPrefetch);
        assert!(md.set_prefetch_status(PrefetchStatus::FinishedPrefetch));
        assert!(md.triggered_prefetch);
        assert_eq!(md.prefetch_status(), PrefetchStatus::FinishedPrefetch);
    }

    #[test]
    fn finished_is_never_downgraded() {
        let mut md = metadata();
        md.set_prefetch_status(PrefetchStatus::FinishedPrefetch);
        assert!(!md.set_prefetch_status(PrefetchStatus::TriggeredPrefetch));
        assert!(!md.set_prefetch_status(PrefetchStatus::NoPrefetch));
        assert_eq!(md.prefetch_status(), PrefetchStatus::FinishedPrefetch);
    }

    #[test]
    fn triggered_can_be_reset() {
        let mut md = metadata();
        md.set_prefetch_status(PrefetchStatus::TriggeredPrefetch);
        assert!(md.set_prefetch_status(PrefetchStatus::NoPrefetch));
        assert_eq!(md.prefetch_status(), PrefetchStatus::NoPrefetch);
    }

    #[test]
    fn metadata_survives_the_codec() {
        let mut md = metadata();
        md.tag = "sweep-7".to_string();
        let encoded = common::codec::encode(&md).unwrap();
        let decoded: Metadata = common::codec::decode(&encoded).unwrap();
        assert_eq!(decoded, md);
    }
}
