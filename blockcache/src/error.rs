use common::{BlockId, TlfId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{cache}: cannot {method} while the cache is starting or failed to start")]
    Starting {
        cache: &'static str,
        method: &'static str,
    },
    #[error("{cache}: cannot {method} after shutdown")]
    Closed {
        cache: &'static str,
        method: &'static str,
    },
    #[error("no room in the cache for block {0}")]
    CacheFull(BlockId),
    #[error("eviction freed nothing while making room for block {0}")]
    NoEvictableBlocks(BlockId),
    #[error("block {0} is not in the cache")]
    NoSuchBlock(BlockId),
    #[error("no metadata for block {0}")]
    MetadataNotFound(BlockId),
    #[error("folder {0} is a team folder and cannot be a home folder")]
    TeamFolderAsHome(TlfId),
    #[error("{left} blocks of folder {tlf_id} are counted but missing from its index")]
    ClearIncomplete { tlf_id: TlfId, left: u64 },
    #[error("the sync cache is not enabled")]
    SyncCacheDisabled,
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
    #[error("the cache never became ready")]
    StartFailed,
    #[error("store error: {0}")]
    Store(#[from] fjall::Error),
    #[error(transparent)]
    Codec(#[from] common::codec::CodecError),
    #[error(transparent)]
    Id(#[from] common::ids::IdError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Limiter(#[from] throttle::Error),
    #[error(transparent)]
    Interrupted(#[from] common::Interrupted),
}

impl Error {
    /// Block or metadata absent. An expected outcome, never worth a warning.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NoSuchBlock(_) | Error::MetadataNotFound(_))
    }

    /// The cache could not make room; another tier may still take the block.
    #[must_use]
    pub fn is_cache_full(&self) -> bool {
        matches!(self, Error::CacheFull(_) | Error::NoEvictableBlocks(_))
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            Error::Interrupted(_) | Error::Limiter(throttle::Error::Interrupted(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        let id = BlockId::random();
        assert!(Error::NoSuchBlock(id).is_not_found());
        assert!(Error::MetadataNotFound(id).is_not_found());
        assert!(!Error::CacheFull(id).is_not_found());
        assert!(Error::CacheFull(id).is_cache_full());
        assert!(Error::NoEvictableBlocks(id).is_cache_full());
        assert!(Error::from(common::Interrupted::Cancelled).is_interrupted());
        assert!(
            Error::from(throttle::Error::Interrupted(
                common::Interrupted::DeadlineExceeded
            ))
            .is_interrupted()
        );
        assert!(!Error::SyncCacheDisabled.is_interrupted());
    }
}
