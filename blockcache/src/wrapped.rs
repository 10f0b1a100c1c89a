//! The working-set and sync tiers behind one interface.
//!
//! Callers say which tier they prefer. Reads fall back to the other tier and move blocks
//! found there into the preferred one; the copy left behind is deleted in the background.

use crate::error::Error;
use crate::local::{CacheTier, DiskBlockCache, DiskBlockCacheStatus};
use crate::metadata::{CachedBlock, Metadata, PrefetchStatus};
use common::{BlockId, CacheConfig, RequestContext, Revision, ServerHalf, TlfId};

/// Which tier an operation is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum CacheType {
    /// Either tier, sync first.
    Any,
    WorkingSet,
    Sync,
}

type Cache = std::sync::Arc<DiskBlockCache>;

pub struct TwoTierCache {
    working_set: Cache,
    sync: Option<Cache>,
    background: tokio_util::task::TaskTracker,
    pending: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    max_pending: usize,
    draining: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for TwoTierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoTierCache")
            .field("working_set", &self.working_set.tier())
            .field("sync", &self.sync.as_ref().map(|cache| cache.tier()))
            .field("pending", &self.pending)
            .finish()
    }
}

impl TwoTierCache {
    /// Opens both tiers below `root`. Failing to open the sync tier only disables it.
    pub fn open(
        root: &std::path::Path,
        config: &CacheConfig,
        limiter: std::sync::Arc<throttle::DiskLimiter>,
        clock: std::sync::Arc<dyn common::clock::Clock>,
    ) -> crate::Result<Self> {
        let working_set = DiskBlockCache::open(
            CacheTier::WorkingSet,
            root,
            config,
            limiter.clone(),
            clock.clone(),
        )?;
        let sync = match DiskBlockCache::open(CacheTier::Sync, root, config, limiter, clock) {
            Ok(cache) => Some(cache),
            Err(error) => {
                tracing::warn!("cannot open the sync block cache: {}", error);
                None
            }
        };
        Ok(Self::new(working_set, sync, config.max_pending_deletes))
    }

    #[must_use]
    pub fn new(working_set: Cache, sync: Option<Cache>, max_pending: usize) -> Self {
        Self {
            working_set,
            sync,
            background: tokio_util::task::TaskTracker::new(),
            pending: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            max_pending,
            draining: std::sync::Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    #[must_use]
    pub fn is_sync_cache_enabled(&self) -> bool {
        self.sync.is_some()
    }

    /// `(primary, secondary)` for a preference. Without a sync tier the working set serves
    /// everything.
    fn rank(&self, preferred: CacheType) -> (&Cache, Option<&Cache>) {
        if preferred == CacheType::WorkingSet {
            return (&self.working_set, self.sync.as_ref());
        }
        match &self.sync {
            Some(sync) => (sync, Some(&self.working_set)),
            None => {
                if preferred == CacheType::Sync {
                    tracing::warn!("sync cache preferred but not enabled");
                }
                (&self.working_set, None)
            }
        }
    }

    fn cache_for(&self, cache_type: CacheType) -> crate::Result<&Cache> {
        match cache_type {
            CacheType::Sync => self.sync.as_ref().ok_or(Error::SyncCacheDisabled),
            _ => Ok(&self.working_set),
        }
    }

    /// Spawns `task` unless `max_pending` tasks are already running. Returns the task back
    /// when it was not spawned.
    fn try_in_background<F>(&self, task: F) -> Option<F>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let pending = self
            .pending
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if pending >= self.max_pending {
            self.pending
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            return Some(task);
        }
        let counter = self.pending.clone();
        self.background.spawn(async move {
            task.await;
            counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        });
        None
    }

    /// Runs `task` in the background unless too many are already pending, in which case
    /// the caller runs it.
    async fn in_background<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(task) = self.try_in_background(task) {
            task.await;
        }
    }

    async fn delete_in_background(&self, cache: &Cache, block_id: BlockId) {
        let cache = cache.clone();
        self.in_background(async move {
            if let Err(error) = cache.delete(&[block_id]).await {
                tracing::debug!(
                    "{}: cannot drop migrated block {}: {}",
                    cache.tier(),
                    block_id,
                    error
                );
            }
        })
        .await;
    }

    /// Puts `block` into `to` and schedules its removal from `from`. A finished prefetch
    /// is recorded as triggered, since the children may not have moved along.
    async fn move_with_block(
        &self,
        ctx: &RequestContext,
        tlf_id: &TlfId,
        block_id: &BlockId,
        block: CachedBlock,
        to: &Cache,
        from: &Cache,
    ) {
        if let Err(error) = to
            .put(ctx, tlf_id, block_id, &block.buf, block.server_half)
            .await
        {
            tracing::debug!("{}: cannot take migrated block {}: {}", to.tier(), block_id, error);
            return;
        }
        let prefetch_status = match block.prefetch_status {
            PrefetchStatus::FinishedPrefetch => PrefetchStatus::TriggeredPrefetch,
            status => status,
        };
        if prefetch_status != PrefetchStatus::NoPrefetch {
            let updated = to.update_metadata(block_id, prefetch_status).await;
            if let Err(error) = updated {
                tracing::debug!(
                    "{}: cannot carry prefetch status of {}: {}",
                    to.tier(),
                    block_id,
                    error
                );
            }
        }
        self.delete_in_background(from, *block_id).await;
    }

    /// Moves a block from the secondary to the primary tier of `preferred`. Returns whether
    /// the secondary had it.
    async fn move_between(
        &self,
        ctx: &RequestContext,
        tlf_id: &TlfId,
        block_id: &BlockId,
        preferred: CacheType,
    ) -> bool {
        let (primary, secondary) = self.rank(preferred);
        let Some(secondary) = secondary else {
            return false;
        };
        let Ok(block) = secondary.get(tlf_id, block_id).await else {
            return false;
        };
        self.move_with_block(ctx, tlf_id, block_id, block, primary, secondary)
            .await;
        true
    }

    /// Looks in the preferred tier, then the other one. A block found only in the other
    /// tier is moved into the preferred one in the background; with too much background
    /// work pending the move is skipped.
    pub async fn get(
        &self,
        ctx: &RequestContext,
        tlf_id: &TlfId,
        block_id: &BlockId,
        preferred: CacheType,
    ) -> crate::Result<CachedBlock> {
        let (primary, secondary) = self.rank(preferred);
        let result = primary.get(tlf_id, block_id).await;
        let Some(secondary) = secondary else {
            return result;
        };
        match result {
            Err(Error::NoSuchBlock(_)) => {}
            other => return other,
        }
        let block = secondary.get(tlf_id, block_id).await?;
        if preferred != CacheType::Any {
            let (primary, secondary) = (primary.clone(), secondary.clone());
            let (ctx, tlf_id, block_id, moved) = (ctx.child(), *tlf_id, *block_id, block.clone());
            let wrapper = self.detached();
            let skipped = self.try_in_background(async move {
                wrapper
                    .move_with_block(&ctx, &tlf_id, &block_id, moved, &primary, &secondary)
                    .await;
            });
            if skipped.is_some() {
                tracing::debug!("too much background work, not moving block {}", block_id);
            }
        }
        Ok(block)
    }

    /// A handle sharing the tiers and the background task accounting.
    fn detached(&self) -> Self {
        Self {
            working_set: self.working_set.clone(),
            sync: self.sync.clone(),
            background: self.background.clone(),
            pending: self.pending.clone(),
            max_pending: self.max_pending,
            draining: self.draining.clone(),
        }
    }

    /// Metadata from the sync tier, or the working set if the sync tier lacks it.
    pub async fn get_metadata(&self, block_id: &BlockId) -> crate::Result<Metadata> {
        if let Some(sync) = &self.sync {
            match sync.get_metadata(block_id).await {
                Err(Error::MetadataNotFound(_)) => {}
                other => return other,
            }
        }
        self.working_set.get_metadata(block_id).await
    }

    /// Prefetch status of a block. Asking for the sync tier moves the block there first.
    pub async fn get_prefetch_status(
        &self,
        ctx: &RequestContext,
        tlf_id: &TlfId,
        block_id: &BlockId,
        cache_type: CacheType,
    ) -> crate::Result<PrefetchStatus> {
        let sync = match (&self.sync, cache_type) {
            (Some(sync), CacheType::Any | CacheType::Sync) => sync,
            _ => {
                return Ok(self
                    .working_set
                    .get_metadata(block_id)
                    .await?
                    .prefetch_status());
            }
        };
        match sync.get_metadata(block_id).await {
            Ok(metadata) => return Ok(metadata.prefetch_status()),
            Err(Error::MetadataNotFound(_)) if cache_type == CacheType::Sync => {
                if self.move_between(ctx, tlf_id, block_id, cache_type).await {
                    return Ok(sync.get_metadata(block_id).await?.prefetch_status());
                }
                return Err(Error::MetadataNotFound(*block_id));
            }
            Err(Error::MetadataNotFound(_)) => {}
            Err(error) => return Err(error),
        }
        Ok(self
            .working_set
            .get_metadata(block_id)
            .await?
            .prefetch_status())
    }

    /// Stores a block. Sync puts that do not fit fall through to the working set; blocks
    /// already in the sync tier are never duplicated into the working set.
    pub async fn put(
        &self,
        ctx: &RequestContext,
        tlf_id: &TlfId,
        block_id: &BlockId,
        buf: &[u8],
        server_half: ServerHalf,
        cache_type: CacheType,
    ) -> crate::Result<()> {
        if let Some(sync) = &self.sync {
            if cache_type == CacheType::Sync {
                match sync.put(ctx, tlf_id, block_id, buf, server_half).await {
                    Ok(()) => {
                        self.delete_in_background(&self.working_set, *block_id)
                            .await;
                        return Ok(());
                    }
                    Err(error) => {
                        tracing::debug!(
                            "sync put of block {} failed, trying the working set: {}",
                            block_id,
                            error
                        );
                    }
                }
            }
            if sync.contains(block_id).await.unwrap_or(false) {
                return Ok(());
            }
        }
        self.working_set
            .put(ctx, tlf_id, block_id, buf, server_half)
            .await
    }

    /// Deletes from the targeted tiers. `Any` covers both. Returns the summed
    /// `(blocks, bytes)` removed.
    pub async fn delete(
        &self,
        block_ids: &[BlockId],
        cache_type: CacheType,
    ) -> crate::Result<(u64, u64)> {
        let (mut num_removed, mut size_removed) = (0, 0);
        if cache_type != CacheType::WorkingSet {
            if let Some(sync) = &self.sync {
                (num_removed, size_removed) = sync.delete(block_ids).await?;
            }
            if cache_type == CacheType::Sync {
                return Ok((num_removed, size_removed));
            }
        }
        let (ws_removed, ws_size) = self.working_set.delete(block_ids).await?;
        Ok((num_removed + ws_removed, size_removed + ws_size))
    }

    /// Records prefetch progress wherever the block lives, moving it into the sync tier
    /// first when that is the target.
    pub async fn update_metadata(
        &self,
        ctx: &RequestContext,
        tlf_id: &TlfId,
        block_id: &BlockId,
        prefetch_status: PrefetchStatus,
        cache_type: CacheType,
    ) -> crate::Result<()> {
        let (primary, secondary) = self.rank(cache_type);
        match primary.update_metadata(block_id, prefetch_status).await {
            Err(Error::NoSuchBlock(_)) => {}
            other => return other,
        }
        if cache_type == CacheType::Sync {
            if self.move_between(ctx, tlf_id, block_id, cache_type).await {
                return primary.update_metadata(block_id, prefetch_status).await;
            }
            return Err(Error::NoSuchBlock(*block_id));
        }
        let Some(secondary) = secondary else {
            return Err(Error::NoSuchBlock(*block_id));
        };
        match secondary.update_metadata(block_id, prefetch_status).await {
            Err(Error::NoSuchBlock(_)) => {}
            other => return other,
        }
        // the block may have moved into the primary while we looked at the secondary
        primary.update_metadata(block_id, prefetch_status).await
    }

    pub async fn clear_all_tlf_blocks(
        &self,
        ctx: &RequestContext,
        tlf_id: &TlfId,
        cache_type: CacheType,
    ) -> crate::Result<()> {
        self.cache_for(cache_type)?
            .clear_all_tlf_blocks(ctx, tlf_id)
            .await
    }

    pub async fn get_last_unref_rev(
        &self,
        tlf_id: &TlfId,
        cache_type: CacheType,
    ) -> crate::Result<Revision> {
        self.cache_for(cache_type)?.get_last_unref_rev(tlf_id).await
    }

    pub async fn put_last_unref_rev(
        &self,
        tlf_id: &TlfId,
        rev: Revision,
        cache_type: CacheType,
    ) -> crate::Result<()> {
        self.cache_for(cache_type)?
            .put_last_unref_rev(tlf_id, rev)
            .await
    }

    pub async fn mark(
        &self,
        block_id: &BlockId,
        tag: &str,
        cache_type: CacheType,
    ) -> crate::Result<()> {
        self.cache_for(cache_type)?.mark(block_id, tag).await
    }

    pub async fn delete_unmarked(
        &self,
        ctx: &RequestContext,
        tlf_id: &TlfId,
        tag: &str,
        cache_type: CacheType,
    ) -> crate::Result<()> {
        self.cache_for(cache_type)?
            .delete_unmarked(ctx, tlf_id, tag)
            .await
    }

    pub async fn does_cache_have_space(&self, cache_type: CacheType) -> crate::Result<(bool, i64)> {
        self.cache_for(cache_type)?.does_cache_have_space().await
    }

    /// Home folders only matter to the sync tier.
    pub async fn add_home_tlf(&self, tlf_id: &TlfId) -> crate::Result<()> {
        self.cache_for(CacheType::Sync)?.add_home_tlf(tlf_id).await
    }

    pub async fn clear_home_tlfs(&self) -> crate::Result<()> {
        self.cache_for(CacheType::Sync)?.clear_home_tlfs().await
    }

    /// Bytes of `tlf_id` held by the targeted tiers.
    pub async fn get_tlf_size(&self, tlf_id: &TlfId, cache_type: CacheType) -> crate::Result<u64> {
        let mut size = 0;
        if cache_type != CacheType::WorkingSet {
            size += self.cache_for(CacheType::Sync)?.get_tlf_size(tlf_id).await?;
        }
        if cache_type != CacheType::Sync {
            size += self.working_set.get_tlf_size(tlf_id).await?;
        }
        Ok(size)
    }

    /// Folders with blocks in the targeted tiers, without duplicates.
    pub async fn get_tlf_ids(&self, cache_type: CacheType) -> crate::Result<Vec<TlfId>> {
        let mut ids = std::collections::BTreeSet::new();
        if cache_type != CacheType::WorkingSet {
            ids.extend(self.cache_for(CacheType::Sync)?.get_tlf_ids().await?);
        }
        if cache_type != CacheType::Sync {
            ids.extend(self.working_set.get_tlf_ids().await?);
        }
        Ok(ids.into_iter().collect())
    }

    /// Status of every open tier, keyed by tier name.
    pub async fn status(&self) -> std::collections::BTreeMap<&'static str, DiskBlockCacheStatus> {
        let mut out = std::collections::BTreeMap::new();
        out.insert(self.working_set.tier().name(), self.working_set.status().await);
        if let Some(sync) = &self.sync {
            out.insert(sync.tier().name(), sync.status().await);
        }
        out
    }

    pub async fn wait_until_started(&self, cache_type: CacheType) -> crate::Result<()> {
        if cache_type != CacheType::WorkingSet {
            self.cache_for(CacheType::Sync)?.wait_until_started().await?;
        }
        if cache_type != CacheType::Sync {
            self.working_set.wait_until_started().await?;
        }
        Ok(())
    }

    /// Waits for background deletes and migrations started so far.
    pub async fn wait_for_deletes(&self) {
        // another caller reopening the tracker would leave our wait pending
        let _draining = self.draining.lock().await;
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    /// Finishes background work, then shuts both tiers down.
    pub async fn shutdown(&self) {
        self.wait_for_deletes().await;
        self.working_set.shutdown().await;
        if let Some(sync) = &self.sync {
            sync.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{LimiterConfig, TlfType};
    use std::sync::Arc;
    use throttle::TrackerKind;
    use throttle::probe::{NoQuota, StaticFreeSpace};

    struct Fixture {
        _tmp: tempfile::TempDir,
        limiter: Arc<throttle::DiskLimiter>,
        cache: TwoTierCache,
    }

    /// Working set of 1000 bytes, sync tier of about 107 bytes.
    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let config = LimiterConfig {
            byte_limit: 10_000,
            disk_cache_frac: 0.1,
            sync_cache_frac: 1e-7,
            ..Default::default()
        };
        let limiter = Arc::new(
            throttle::DiskLimiter::new(
                &config,
                Arc::new(StaticFreeSpace::new(1 << 30, 1 << 30)),
                Arc::new(NoQuota),
            )
            .unwrap(),
        );
        let cache = TwoTierCache::open(
            tmp.path(),
            &CacheConfig::default(),
            limiter.clone(),
            Arc::new(common::clock::SystemClock),
        )
        .unwrap();
        cache.wait_until_started(CacheType::Any).await.unwrap();
        Fixture {
            _tmp: tmp,
            limiter,
            cache,
        }
    }

    fn used(f: &Fixture, kind: TrackerKind) -> i64 {
        f.limiter.tracker_status(kind).unwrap().used
    }

    async fn put(f: &Fixture, tlf: &TlfId, id: &BlockId, cache_type: CacheType) {
        f.cache
            .put(
                &RequestContext::new(),
                tlf,
                id,
                &[3; 60],
                ServerHalf::random(),
                cache_type,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sync_put_takes_over_a_working_set_block() {
        let f = fixture().await;
        let tlf = TlfId::random(TlfType::Private);
        let id = BlockId::random();
        put(&f, &tlf, &id, CacheType::WorkingSet).await;
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 100);

        put(&f, &tlf, &id, CacheType::Sync).await;
        f.cache.wait_for_deletes().await;
        assert_eq!(used(&f, TrackerKind::SyncCache), 100);
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 0);
        assert_eq!(f.cache.get_tlf_size(&tlf, CacheType::Any).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn working_set_put_skips_blocks_already_synced() {
        let f = fixture().await;
        let tlf = TlfId::random(TlfType::Private);
        let id = BlockId::random();
        put(&f, &tlf, &id, CacheType::Sync).await;
        put(&f, &tlf, &id, CacheType::WorkingSet).await;
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 0);
        assert_eq!(
            f.cache
                .get_tlf_size(&tlf, CacheType::WorkingSet)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn full_sync_tier_falls_back_to_working_set() {
        let f = fixture().await;
        let tlf = TlfId::random(TlfType::Private);
        let first = BlockId::random();
        let second = BlockId::random();
        put(&f, &tlf, &first, CacheType::Sync).await;
        // no room left in the sync tier
        put(&f, &tlf, &second, CacheType::Sync).await;
        assert_eq!(used(&f, TrackerKind::SyncCache), 100);
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 100);
        let block = f
            .cache
            .get(&RequestContext::new(), &tlf, &second, CacheType::Any)
            .await
            .unwrap();
        assert_eq!(block.buf, vec![3; 60]);
    }

    #[tokio::test]
    async fn get_moves_blocks_into_the_preferred_tier() {
        let f = fixture().await;
        let tlf = TlfId::random(TlfType::Private);
        let id = BlockId::random();
        put(&f, &tlf, &id, CacheType::WorkingSet).await;
        f.cache
            .update_metadata(
                &RequestContext::new(),
                &tlf,
                &id,
                PrefetchStatus::FinishedPrefetch,
                CacheType::WorkingSet,
            )
            .await
            .unwrap();
        let block = f
            .cache
            .get(&RequestContext::new(), &tlf, &id, CacheType::Sync)
            .await
            .unwrap();
        assert_eq!(block.prefetch_status, PrefetchStatus::FinishedPrefetch);
        f.cache.wait_for_deletes().await;
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 0);
        assert_eq!(used(&f, TrackerKind::SyncCache), 100);
        // finished does not survive the move
        assert_eq!(
            f.cache.get_metadata(&id).await.unwrap().prefetch_status(),
            PrefetchStatus::TriggeredPrefetch
        );
    }

    #[tokio::test]
    async fn any_preference_does_not_move() {
        let f = fixture().await;
        let tlf = TlfId::random(TlfType::Private);
        let id = BlockId::random();
        put(&f, &tlf, &id, CacheType::WorkingSet).await;
        f.cache
            .get(&RequestContext::new(), &tlf, &id, CacheType::Any)
            .await
            .unwrap();
        f.cache.wait_for_deletes().await;
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 100);
        assert_eq!(used(&f, TrackerKind::SyncCache), 0);
    }

    #[tokio::test]
    async fn prefetch_status_for_sync_moves_the_block() {
        let f = fixture().await;
        let tlf = TlfId::random(TlfType::Public);
        let id = BlockId::random();
        put(&f, &tlf, &id, CacheType::WorkingSet).await;
        let ctx = RequestContext::new();
        assert_eq!(
            f.cache
                .get_prefetch_status(&ctx, &tlf, &id, CacheType::WorkingSet)
                .await
                .unwrap(),
            PrefetchStatus::NoPrefetch
        );
        assert_eq!(
            f.cache
                .get_prefetch_status(&ctx, &tlf, &id, CacheType::Sync)
                .await
                .unwrap(),
            PrefetchStatus::NoPrefetch
        );
        f.cache.wait_for_deletes().await;
        assert_eq!(used(&f, TrackerKind::SyncCache), 100);
        assert!(
            f.cache
                .get_prefetch_status(&ctx, &tlf, &BlockId::random(), CacheType::Sync)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn update_metadata_for_sync_moves_the_block() {
        let f = fixture().await;
        let tlf = TlfId::random(TlfType::Private);
        let id = BlockId::random();
        put(&f, &tlf, &id, CacheType::WorkingSet).await;
        let ctx = RequestContext::new();
        f.cache
            .update_metadata(&ctx, &tlf, &id, PrefetchStatus::TriggeredPrefetch, CacheType::Sync)
            .await
            .unwrap();
        f.cache.wait_for_deletes().await;
        assert_eq!(used(&f, TrackerKind::SyncCache), 100);
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 0);
        assert!(matches!(
            f.cache
                .update_metadata(
                    &ctx,
                    &tlf,
                    &BlockId::random(),
                    PrefetchStatus::TriggeredPrefetch,
                    CacheType::Any
                )
                .await,
            Err(Error::NoSuchBlock(_))
        ));
    }

    #[tokio::test]
    async fn delete_targets_tiers() {
        let f = fixture().await;
        let tlf = TlfId::random(TlfType::Private);
        let synced = BlockId::random();
        let cached = BlockId::random();
        put(&f, &tlf, &synced, CacheType::Sync).await;
        put(&f, &tlf, &cached, CacheType::WorkingSet).await;
        let both = [synced, cached];
        assert_eq!(f.cache.delete(&both, CacheType::Sync).await.unwrap(), (1, 100));
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 100);
        assert_eq!(f.cache.delete(&both, CacheType::Any).await.unwrap(), (1, 100));
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 0);
    }

    #[tokio::test]
    async fn per_tier_operations() {
        let f = fixture().await;
        let private = TlfId::random(TlfType::Private);
        let team = TlfId::random(TlfType::SingleTeam);
        put(&f, &private, &BlockId::random(), CacheType::Sync).await;
        put(&f, &team, &BlockId::random(), CacheType::WorkingSet).await;
        put(&f, &private, &BlockId::random(), CacheType::WorkingSet).await;

        let all = f.cache.get_tlf_ids(CacheType::Any).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(f.cache.get_tlf_ids(CacheType::Sync).await.unwrap(), vec![private]);
        assert_eq!(f.cache.get_tlf_size(&private, CacheType::Any).await.unwrap(), 200);

        f.cache
            .put_last_unref_rev(&private, Revision(9), CacheType::Sync)
            .await
            .unwrap();
        assert_eq!(
            f.cache
                .get_last_unref_rev(&private, CacheType::Sync)
                .await
                .unwrap(),
            Revision(9)
        );
        assert_eq!(
            f.cache
                .get_last_unref_rev(&private, CacheType::WorkingSet)
                .await
                .unwrap(),
            Revision::UNINITIALIZED
        );

        f.cache.add_home_tlf(&private).await.unwrap();
        assert!(matches!(
            f.cache.add_home_tlf(&team).await,
            Err(Error::TeamFolderAsHome(_))
        ));
        f.cache.clear_home_tlfs().await.unwrap();

        let status = f.cache.status().await;
        assert_eq!(status.len(), 2);
        assert_eq!(status["SyncBlockCache"].num_blocks, 1);
        assert_eq!(status["WorkingSetBlockCache"].num_blocks, 2);
        assert!(f.cache.does_cache_have_space(CacheType::WorkingSet).await.unwrap().0);
    }

    #[tokio::test]
    async fn working_set_only() {
        let f = fixture().await;
        let cache = TwoTierCache::new(f.cache.working_set.clone(), None, 1);
        assert!(!cache.is_sync_cache_enabled());
        let tlf = TlfId::random(TlfType::Private);
        assert!(matches!(
            cache.add_home_tlf(&tlf).await,
            Err(Error::SyncCacheDisabled)
        ));
        let id = BlockId::random();
        cache
            .put(
                &RequestContext::new(),
                &tlf,
                &id,
                &[1; 10],
                ServerHalf::random(),
                CacheType::Sync,
            )
            .await
            .unwrap();
        assert!(
            cache
                .get(&RequestContext::new(), &tlf, &id, CacheType::Sync)
                .await
                .is_ok()
        );
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 50);
    }

    #[tokio::test]
    async fn get_skips_the_move_when_background_work_is_saturated() {
        let f = fixture().await;
        let cache = TwoTierCache::new(f.cache.working_set.clone(), f.cache.sync.clone(), 1);
        let tlf = TlfId::random(TlfType::Private);
        let id = BlockId::random();
        put(&f, &tlf, &id, CacheType::WorkingSet).await;
        cache
            .pending
            .store(1, std::sync::atomic::Ordering::SeqCst);
        let block = cache
            .get(&RequestContext::new(), &tlf, &id, CacheType::Sync)
            .await
            .unwrap();
        assert_eq!(block.buf, vec![3; 60]);
        // nothing ran on the caller
        assert_eq!(used(&f, TrackerKind::SyncCache), 0);
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 100);

        cache
            .pending
            .store(0, std::sync::atomic::Ordering::SeqCst);
        cache
            .get(&RequestContext::new(), &tlf, &id, CacheType::Sync)
            .await
            .unwrap();
        cache.wait_for_deletes().await;
        assert_eq!(used(&f, TrackerKind::SyncCache), 100);
        assert_eq!(used(&f, TrackerKind::WorkingSetCache), 0);
    }

    #[tokio::test]
    async fn concurrent_waits_for_deletes_both_finish() {
        let f = fixture().await;
        let tlf = TlfId::random(TlfType::Private);
        for _ in 0..5 {
            let id = BlockId::random();
            put(&f, &tlf, &id, CacheType::WorkingSet).await;
            f.cache
                .get(&RequestContext::new(), &tlf, &id, CacheType::Sync)
                .await
                .unwrap();
        }
        let waits = async {
            tokio::join!(f.cache.wait_for_deletes(), f.cache.wait_for_deletes());
        };
        tokio::time::timeout(std::time::Duration::from_secs(10), waits)
            .await
            .unwrap();
        assert_eq!(f.cache.pending.load(std::sync::atomic::Ordering::SeqCst), 0);
        f.cache.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_both_tiers() {
        let f = fixture().await;
        f.cache.shutdown().await;
        let err = f
            .cache
            .get(
                &RequestContext::new(),
                &TlfId::random(TlfType::Private),
                &BlockId::random(),
                CacheType::Any,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed { .. }));
    }
}
