//! One disk-resident block cache tier.

use crate::counts::Counts;
use crate::error::Error;
use crate::evict::{EvictionPriority, least_recent, pivot_block_id, shuffle_weighted};
use crate::metadata::{CachedBlock, Entry, LastUnrefEntry, Metadata, PrefetchStatus};
use crate::meter::{CacheMeters, CacheMetersStatus};
use crate::store::Store;
use common::{BlockId, CacheConfig, RequestContext, Revision, ServerHalf, TlfId, TlfType};
use throttle::{DiskLimiter, TrackerKind};
use tracing::instrument;

/// Fraction of its limit above which a cache reports it has no space left.
const FULL_FRAC: f64 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum CacheTier {
    /// Recently used blocks, evicted as needed.
    WorkingSet,
    /// Blocks of folders pinned for offline use, never evicted to make room.
    Sync,
}

impl CacheTier {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CacheTier::WorkingSet => "WorkingSetBlockCache",
            CacheTier::Sync => "SyncBlockCache",
        }
    }

    /// Directory of the tier below the cache root.
    #[must_use]
    pub fn folder_name(self) -> &'static str {
        match self {
            CacheTier::WorkingSet => "block_cache",
            CacheTier::Sync => "sync_cache",
        }
    }

    #[must_use]
    pub fn tracker_kind(self) -> TrackerKind {
        match self {
            CacheTier::WorkingSet => TrackerKind::WorkingSetCache,
            CacheTier::Sync => TrackerKind::SyncCache,
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StartState {
    Starting,
    Started,
    Failed,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DiskBlockCacheStatus {
    pub start_state: StartState,
    pub num_blocks: u64,
    pub block_bytes: u64,
    pub curr_byte_limit: u64,
    pub last_unref_count: u64,
    pub meters: CacheMetersStatus,
    pub local_disk_bytes_available: u64,
    pub local_disk_bytes_total: u64,
}

#[derive(Debug)]
struct State {
    // None once shut down
    store: Option<Store>,
    counts: Counts,
    last_unrefs: std::collections::HashMap<TlfId, Revision>,
    home_dirs: std::collections::HashMap<TlfId, EvictionPriority>,
}

impl State {
    fn priority(&self, tlf_id: &TlfId) -> EvictionPriority {
        self.home_dirs
            .get(tlf_id)
            .copied()
            .unwrap_or(EvictionPriority::NotHome)
    }
}

/// An LSM-backed cache of encrypted blocks with sampled LRU eviction.
///
/// Running totals live in memory and are rebuilt from the metadata partition by a
/// background task when the cache opens; until that finishes every operation fails with
/// [`Error::Starting`].
#[derive(Debug)]
pub struct DiskBlockCache {
    tier: CacheTier,
    dir: std::path::PathBuf,
    config: CacheConfig,
    limiter: std::sync::Arc<DiskLimiter>,
    clock: std::sync::Arc<dyn common::clock::Clock>,
    meters: CacheMeters,
    start_state: tokio::sync::watch::Receiver<StartState>,
    state: tokio::sync::RwLock<State>,
}

impl DiskBlockCache {
    /// Opens the tier's store below `root` and starts reconciling its totals in the
    /// background. Must be called from within a tokio runtime.
    pub fn open(
        tier: CacheTier,
        root: &std::path::Path,
        config: &CacheConfig,
        limiter: std::sync::Arc<DiskLimiter>,
        clock: std::sync::Arc<dyn common::clock::Clock>,
    ) -> crate::Result<std::sync::Arc<Self>> {
        config.validate().map_err(Error::InvalidConfig)?;
        let dir = root.join(tier.folder_name());
        let store_dir = crate::version::versioned_dir(&dir)?;
        let store = Store::open(&store_dir)?;
        let (start_tx, start_state) = tokio::sync::watch::channel(StartState::Starting);
        let cache = std::sync::Arc::new(Self {
            tier,
            dir,
            config: *config,
            limiter,
            clock,
            meters: CacheMeters::default(),
            start_state,
            state: tokio::sync::RwLock::new(State {
                store: Some(store),
                counts: Counts::default(),
                last_unrefs: std::collections::HashMap::new(),
                home_dirs: std::collections::HashMap::new(),
            }),
        });
        tokio::spawn(cache.clone().reconcile(start_tx));
        Ok(cache)
    }

    async fn reconcile(
        self: std::sync::Arc<Self>,
        start_tx: tokio::sync::watch::Sender<StartState>,
    ) {
        let mut state = self.state.write().await;
        let Some(store) = state.store.clone() else {
            start_tx.send_replace(StartState::Failed);
            return;
        };
        let scanned = tokio::task::spawn_blocking(move || {
            let mut counts = Counts::default();
            store.try_for_each_metadata(|_, metadata| {
                counts.inc(
                    metadata.tlf_id,
                    EvictionPriority::NotHome,
                    u64::from(metadata.block_size),
                );
            })?;
            let last_unrefs = store.all_last_unrefs()?;
            Ok::<_, Error>((counts, last_unrefs))
        })
        .await;
        let (counts, last_unrefs) = match scanned {
            Ok(Ok(scanned)) => scanned,
            Ok(Err(error)) => {
                tracing::error!("{}: cannot rebuild cache totals: {}", self.tier, error);
                start_tx.send_replace(StartState::Failed);
                return;
            }
            Err(error) => {
                tracing::error!("{}: totals scan panicked: {}", self.tier, error);
                start_tx.send_replace(StartState::Failed);
                return;
            }
        };
        let curr_bytes = counts.curr_bytes();
        if let Err(error) = self
            .limiter
            .on_simple_byte_tracker_enable(self.tier.tracker_kind(), curr_bytes as i64)
        {
            tracing::error!("{}: limiter rejected the cache: {}", self.tier, error);
            start_tx.send_replace(StartState::Failed);
            return;
        }
        tracing::debug!(
            "{}: started with {} blocks, {} bytes",
            self.tier,
            counts.num_blocks(),
            curr_bytes
        );
        state.counts = counts;
        state.last_unrefs = last_unrefs;
        start_tx.send_replace(StartState::Started);
    }

    #[must_use]
    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    #[must_use]
    pub fn start_state(&self) -> StartState {
        *self.start_state.borrow()
    }

    /// Resolves once the background reconciliation is done.
    pub async fn wait_until_started(&self) -> crate::Result<()> {
        let mut start_state = self.start_state.clone();
        let state = start_state
            .wait_for(|state| *state != StartState::Starting)
            .await
            .map_err(|_| Error::StartFailed)?;
        match *state {
            StartState::Started => Ok(()),
            _ => Err(Error::StartFailed),
        }
    }

    fn check<'a>(&self, state: &'a State, method: &'static str) -> crate::Result<&'a Store> {
        if self.start_state() != StartState::Started {
            return Err(Error::Starting {
                cache: self.tier.name(),
                method,
            });
        }
        state.store.as_ref().ok_or(Error::Closed {
            cache: self.tier.name(),
            method,
        })
    }

    fn lookup_metadata(
        &self,
        store: &Store,
        block_id: &BlockId,
        metered: bool,
    ) -> crate::Result<Metadata> {
        let metadata = store.get_metadata(block_id)?;
        if metered {
            match metadata {
                Some(_) => self.meters.hit.mark(1),
                None => self.meters.miss.mark(1),
            }
        }
        metadata.ok_or(Error::MetadataNotFound(*block_id))
    }

    /// Stores `metadata` with a fresh recency timestamp.
    fn touch_metadata(
        &self,
        store: &Store,
        block_id: &BlockId,
        metadata: &mut Metadata,
        metered: bool,
    ) -> crate::Result<()> {
        metadata.lru_time = self.clock.now();
        store.put_metadata(block_id, metadata)?;
        if metered {
            self.meters.update.mark(1);
        }
        Ok(())
    }

    /// Returns the block and refreshes its recency.
    #[instrument(level = "trace", skip(self))]
    pub async fn get(&self, tlf_id: &TlfId, block_id: &BlockId) -> crate::Result<CachedBlock> {
        let state = self.state.read().await;
        let store = self.check(&state, "get")?;
        let Some(entry) = store.get_block(block_id)? else {
            self.meters.miss.mark(1);
            return Err(Error::NoSuchBlock(*block_id));
        };
        let mut metadata = self.lookup_metadata(store, block_id, true)?;
        self.touch_metadata(store, block_id, &mut metadata, false)?;
        Ok(CachedBlock {
            buf: entry.buf,
            server_half: entry.server_half,
            prefetch_status: metadata.prefetch_status(),
        })
    }

    /// Whether the block's payload is present, without touching its recency.
    pub async fn contains(&self, block_id: &BlockId) -> crate::Result<bool> {
        let state = self.state.read().await;
        self.check(&state, "contains")?.has_block(block_id)
    }

    /// Reserves room for `bytes`, evicting in rounds until the limiter admits them.
    fn evict_until_bytes_available(
        &self,
        ctx: &RequestContext,
        store: &Store,
        state: &mut State,
        bytes: i64,
        block_id: &BlockId,
    ) -> crate::Result<()> {
        for _ in 0..self.config.max_evictions_per_put {
            if let Some(interrupted) = ctx.err() {
                return Err(interrupted.into());
            }
            if self
                .limiter
                .reserve_bytes(self.tier.tracker_kind(), bytes)?
                >= 0
            {
                return Ok(());
            }
            let (removed, _) = self.evict_locked(store, state, self.config.blocks_to_evict)?;
            if removed == 0 {
                tracing::warn!("{}: nothing left to evict for block {}", self.tier, block_id);
                return Err(Error::NoEvictableBlocks(*block_id));
            }
        }
        tracing::warn!("{}: no room for block {} after evicting", self.tier, block_id);
        Err(Error::CacheFull(*block_id))
    }

    /// Stores a block. A block already present only gets its recency refreshed.
    #[instrument(level = "debug", skip(self, ctx, buf, server_half), err(level = "debug"))]
    pub async fn put(
        &self,
        ctx: &RequestContext,
        tlf_id: &TlfId,
        block_id: &BlockId,
        buf: &[u8],
        server_half: ServerHalf,
    ) -> crate::Result<()> {
        let mut state = self.state.write().await;
        let store = self.check(&state, "put")?.clone();
        let encoded = common::codec::encode(&Entry {
            buf: buf.to_vec(),
            server_half,
        })?;
        let encoded_len = encoded.len() as i64;
        let block_size = u32::try_from(encoded.len()).unwrap_or(u32::MAX);
        let kind = self.tier.tracker_kind();
        if !store.has_block(block_id)? {
            match self.tier {
                CacheTier::Sync => {
                    if self.limiter.reserve_bytes(kind, encoded_len)? < 0 {
                        tracing::warn!("{}: no room for block {}", self.tier, block_id);
                        return Err(Error::CacheFull(*block_id));
                    }
                }
                CacheTier::WorkingSet => {
                    self.evict_until_bytes_available(
                        ctx,
                        &store,
                        &mut state,
                        encoded_len,
                        block_id,
                    )?;
                }
            }
            let principal = common::UserOrTeamId::default();
            if let Err(error) = store.put_block(block_id, &encoded) {
                self.limiter
                    .commit_or_rollback(kind, encoded_len, 0, false, &principal);
                tracing::warn!("{}: cannot store block {}: {}", self.tier, block_id, error);
                return Err(error);
            }
            self.limiter
                .commit_or_rollback(kind, encoded_len, 0, true, &principal);
            self.meters.put.mark(1);
            let priority = state.priority(tlf_id);
            state
                .counts
                .inc(*tlf_id, priority, u64::from(block_size));
        }
        if !store.has_tlf_entry(tlf_id, block_id)? {
            store.put_tlf_entry(tlf_id, block_id)?;
        }
        let mut metadata = match store.get_metadata(block_id) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => Metadata::new(*tlf_id, block_size, self.clock.now()),
            Err(Error::Codec(error)) => {
                tracing::debug!(
                    "{}: replacing bad metadata of {}: {}",
                    self.tier,
                    block_id,
                    error
                );
                Metadata::new(*tlf_id, block_size, self.clock.now())
            }
            Err(error) => return Err(error),
        };
        self.touch_metadata(&store, block_id, &mut metadata, false)
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn get_metadata(&self, block_id: &BlockId) -> crate::Result<Metadata> {
        let state = self.state.read().await;
        let store = self.check(&state, "get_metadata")?;
        self.lookup_metadata(store, block_id, false)
    }

    /// Records prefetch progress. A finished block stays finished.
    #[instrument(level = "trace", skip(self))]
    pub async fn update_metadata(
        &self,
        block_id: &BlockId,
        prefetch_status: PrefetchStatus,
    ) -> crate::Result<()> {
        let state = self.state.write().await;
        let store = self.check(&state, "update_metadata")?;
        let mut metadata = match self.lookup_metadata(store, block_id, false) {
            Ok(metadata) => metadata,
            Err(error) if error.is_not_found() => return Err(Error::NoSuchBlock(*block_id)),
            Err(error) => return Err(error),
        };
        if !metadata.set_prefetch_status(prefetch_status) {
            return Ok(());
        }
        self.touch_metadata(store, block_id, &mut metadata, true)
    }

    /// Tags a block for a later [`DiskBlockCache::delete_unmarked`].
    #[instrument(level = "trace", skip(self))]
    pub async fn mark(&self, block_id: &BlockId, tag: &str) -> crate::Result<()> {
        let state = self.state.write().await;
        let store = self.check(&state, "mark")?;
        let mut metadata = match self.lookup_metadata(store, block_id, false) {
            Ok(metadata) => metadata,
            Err(error) if error.is_not_found() => return Err(Error::NoSuchBlock(*block_id)),
            Err(error) => return Err(error),
        };
        metadata.tag = tag.to_string();
        self.touch_metadata(store, block_id, &mut metadata, false)
    }

    /// Removes `block_ids` and releases their bytes. Returns `(blocks, bytes)` removed.
    fn delete_locked(
        &self,
        store: &Store,
        state: &mut State,
        block_ids: &[BlockId],
    ) -> crate::Result<(u64, u64)> {
        let mut to_delete = Vec::with_capacity(block_ids.len());
        let mut per_tlf: std::collections::HashMap<TlfId, (u64, u64)> =
            std::collections::HashMap::new();
        for block_id in block_ids {
            let Some(raw) = store.get_metadata_raw(&block_id.to_bytes())? else {
                continue;
            };
            let metadata: Metadata = match common::codec::decode(&raw) {
                Ok(metadata) => metadata,
                Err(error) => {
                    tracing::warn!(
                        "{}: skipping delete of block {} with bad metadata: {}",
                        self.tier,
                        block_id,
                        error
                    );
                    continue;
                }
            };
            to_delete.push((*block_id, metadata.tlf_id));
            let totals = per_tlf.entry(metadata.tlf_id).or_default();
            totals.0 += 1;
            totals.1 += u64::from(metadata.block_size);
        }
        if to_delete.is_empty() {
            return Ok((0, 0));
        }
        store.delete_blocks(&to_delete)?;
        let (mut num_removed, mut size_removed) = (0, 0);
        for (tlf_id, (blocks, bytes)) in per_tlf {
            let priority = state.priority(&tlf_id);
            state.counts.dec(&tlf_id, priority, blocks, bytes);
            num_removed += blocks;
            size_removed += bytes;
        }
        self.limiter
            .release(self.tier.tracker_kind(), size_removed as i64, 0);
        self.meters.delete_count.mark(num_removed);
        self.meters.delete_size.mark(size_removed);
        Ok((num_removed, size_removed))
    }

    /// Removes an index entry whose block id or metadata does not decode, along with
    /// whatever payload sits under its key. Returns the payload size.
    fn remove_broken_block(
        &self,
        store: &Store,
        state: &mut State,
        tlf_id: &TlfId,
        block_key: &[u8],
    ) -> crate::Result<u64> {
        tracing::debug!("{}: removing broken entry {:x?}", self.tier, block_key);
        let size = store.block_len(block_key)?;
        store.delete_raw(tlf_id, block_key)?;
        let Some(size) = size else {
            return Ok(0);
        };
        let priority = state.priority(tlf_id);
        state.counts.dec(tlf_id, priority, 1, size);
        self.limiter
            .release(self.tier.tracker_kind(), size as i64, 0);
        Ok(size)
    }

    /// Reads up to `limit` index entries of `tlf_id` from `pivot`, splitting them into
    /// eviction candidates and broken entries.
    #[allow(clippy::type_complexity)]
    fn sample_tlf(
        &self,
        store: &Store,
        tlf_id: &TlfId,
        pivot: &BlockId,
        limit: usize,
    ) -> crate::Result<(Vec<(BlockId, std::time::SystemTime)>, Vec<Vec<u8>>)> {
        let mut candidates = Vec::new();
        let mut broken = Vec::new();
        for entry in store.scan_tlf(tlf_id, &pivot.to_bytes(), limit)? {
            let Ok(block_id) = entry.block_id() else {
                broken.push(entry.block_key);
                continue;
            };
            let metadata = store
                .get_metadata_raw(&entry.block_key)?
                .and_then(|raw| common::codec::decode::<Metadata>(&raw).ok());
            match metadata {
                Some(metadata) => candidates.push((block_id, metadata.lru_time)),
                None => broken.push(entry.block_key),
            }
        }
        Ok((candidates, broken))
    }

    fn remove_broken_blocks(
        &self,
        store: &Store,
        state: &mut State,
        tlf_id: &TlfId,
        broken: Vec<Vec<u8>>,
    ) -> crate::Result<(u64, u64)> {
        let (mut num_removed, mut size_removed) = (0, 0);
        for block_key in broken {
            let size = self.remove_broken_block(store, state, tlf_id, &block_key)?;
            if size > 0 {
                num_removed += 1;
                size_removed += size;
            }
        }
        Ok((num_removed, size_removed))
    }

    /// Evicts about `num_blocks` blocks, trying non-home folders before public home and
    /// private home folders.
    fn evict_locked(
        &self,
        store: &Store,
        state: &mut State,
        num_blocks: usize,
    ) -> crate::Result<(u64, u64)> {
        let wanted = num_blocks as u64;
        let (mut num_removed, mut size_removed) = (0u64, 0u64);
        let mut rng = rand::thread_rng();
        for priority in EvictionPriority::ALL {
            if num_removed >= wanted {
                break;
            }
            let tlfs = shuffle_weighted(&mut rng, state.counts.priority_weights(priority));
            let remaining = (wanted - num_removed) as usize;
            let num_elements = remaining * self.config.eviction_sampling_factor;
            let mut candidates = Vec::with_capacity(num_elements);
            for tlf_id in tlfs {
                let count = state.counts.tlf_count(&tlf_id);
                if count == 0 {
                    continue;
                }
                let pivot = pivot_block_id(num_elements, count);
                let (mut sampled, broken) =
                    self.sample_tlf(store, &tlf_id, &pivot, num_elements)?;
                candidates.append(&mut sampled);
                let (broken_count, broken_size) =
                    self.remove_broken_blocks(store, state, &tlf_id, broken)?;
                num_removed += broken_count;
                size_removed += broken_size;
                if candidates.len() >= num_elements {
                    break;
                }
            }
            let remaining = wanted.saturating_sub(num_removed) as usize;
            let (count, size) =
                self.delete_locked(store, state, &least_recent(candidates, remaining))?;
            num_removed += count;
            size_removed += size;
        }
        self.meters.evict_count.mark(num_removed);
        self.meters.evict_size.mark(size_removed);
        Ok((num_removed, size_removed))
    }

    /// Evicts about `num_blocks` of the least recently used blocks of one folder, sampling
    /// from a random pivot or, with `full_scan`, from the start of the folder.
    fn evict_from_tlf_locked(
        &self,
        store: &Store,
        state: &mut State,
        tlf_id: &TlfId,
        num_blocks: usize,
        full_scan: bool,
    ) -> crate::Result<(u64, u64)> {
        let num_elements = num_blocks * self.config.eviction_sampling_factor;
        let pivot = if full_scan {
            BlockId::zero()
        } else {
            pivot_block_id(num_elements, state.counts.tlf_count(tlf_id))
        };
        let (candidates, broken) = self.sample_tlf(store, tlf_id, &pivot, num_elements)?;
        let (mut num_removed, mut size_removed) =
            self.delete_locked(store, state, &least_recent(candidates, num_blocks))?;
        let (broken_count, broken_size) =
            self.remove_broken_blocks(store, state, tlf_id, broken)?;
        num_removed += broken_count;
        size_removed += broken_size;
        self.meters.evict_count.mark(num_removed);
        self.meters.evict_size.mark(size_removed);
        Ok((num_removed, size_removed))
    }

    /// Removes blocks and releases their bytes. Returns `(blocks, bytes)` removed; ids not
    /// in the cache are ignored.
    #[instrument(level = "debug", skip(self, block_ids), fields(count = block_ids.len()))]
    pub async fn delete(&self, block_ids: &[BlockId]) -> crate::Result<(u64, u64)> {
        let mut state = self.state.write().await;
        let store = self.check(&state, "delete")?.clone();
        self.delete_locked(&store, &mut state, block_ids)
    }

    /// Removes every block of `tlf_id` in batches, yielding the lock between them.
    #[instrument(level = "debug", skip(self, ctx), err(level = "debug"))]
    pub async fn clear_all_tlf_blocks(
        &self,
        ctx: &RequestContext,
        tlf_id: &TlfId,
    ) -> crate::Result<()> {
        loop {
            let (removed, left) = {
                let mut state = self.state.write().await;
                let store = self.check(&state, "clear_all_tlf_blocks")?.clone();
                if let Some(interrupted) = ctx.err() {
                    return Err(interrupted.into());
                }
                let batch = self.config.blocks_to_evict_on_clear;
                let (mut removed, _) =
                    self.evict_from_tlf_locked(&store, &mut state, tlf_id, batch, false)?;
                if removed == 0 && state.counts.tlf_count(tlf_id) > 0 {
                    // the pivot can land past every remaining block
                    (removed, _) =
                        self.evict_from_tlf_locked(&store, &mut state, tlf_id, batch, true)?;
                }
                (removed, state.counts.tlf_count(tlf_id))
            };
            if left == 0 {
                tracing::debug!("{}: cleared folder {}", self.tier, tlf_id);
                return Ok(());
            }
            if removed == 0 {
                tracing::warn!(
                    "{}: {} blocks of folder {} are counted but cannot be found",
                    self.tier,
                    left,
                    tlf_id
                );
                return Err(Error::ClearIncomplete {
                    tlf_id: *tlf_id,
                    left,
                });
            }
            tracing::debug!("{}: {} blocks left in folder {}", self.tier, left, tlf_id);
            ctx.sleep(self.config.clear_backoff).await?;
        }
    }

    /// Checks one batch of `tlf_id`'s blocks starting at `from` and deletes those whose
    /// tag differs from `tag`. Returns where the next batch starts.
    fn delete_next_unmarked_batch(
        &self,
        store: &Store,
        state: &mut State,
        tlf_id: &TlfId,
        tag: &str,
        from: &[u8],
    ) -> crate::Result<Option<Vec<u8>>> {
        let check = self.config.unmarked_blocks_to_check;
        let mut entries = store.scan_tlf(tlf_id, from, check + 1)?;
        let next = if entries.len() > check {
            entries.pop().map(|entry| entry.block_key)
        } else {
            None
        };
        let mut unmarked = Vec::new();
        for entry in entries {
            let Ok(block_id) = entry.block_id() else {
                continue;
            };
            match store.get_metadata(&block_id) {
                Ok(Some(metadata)) if metadata.tag != tag => unmarked.push(block_id),
                Ok(_) => {}
                Err(error) => {
                    tracing::debug!("{}: skipping block {}: {}", self.tier, block_id, error);
                }
            }
        }
        self.delete_locked(store, state, &unmarked)?;
        Ok(next)
    }

    /// Deletes every block of `tlf_id` not tagged with `tag`, in batches with a pause
    /// between them.
    #[instrument(level = "debug", skip(self, ctx), err(level = "debug"))]
    pub async fn delete_unmarked(
        &self,
        ctx: &RequestContext,
        tlf_id: &TlfId,
        tag: &str,
    ) -> crate::Result<()> {
        let mut from = Vec::new();
        loop {
            if let Some(interrupted) = ctx.err() {
                return Err(interrupted.into());
            }
            let next = {
                let mut state = self.state.write().await;
                let store = self.check(&state, "delete_unmarked")?.clone();
                self.delete_next_unmarked_batch(&store, &mut state, tlf_id, tag, &from)?
            };
            let Some(next) = next else {
                return Ok(());
            };
            from = next;
            ctx.sleep(self.config.clear_backoff).await?;
        }
    }

    /// Revision of the last unreferenced blocks processed for `tlf_id`.
    pub async fn get_last_unref_rev(&self, tlf_id: &TlfId) -> crate::Result<Revision> {
        let state = self.state.read().await;
        self.check(&state, "get_last_unref_rev")?;
        Ok(state
            .last_unrefs
            .get(tlf_id)
            .copied()
            .unwrap_or(Revision::UNINITIALIZED))
    }

    /// Advances the folder's watermark. Revisions at or below the current one are ignored.
    pub async fn put_last_unref_rev(&self, tlf_id: &TlfId, rev: Revision) -> crate::Result<()> {
        let mut state = self.state.write().await;
        let store = self.check(&state, "put_last_unref_rev")?.clone();
        if state
            .last_unrefs
            .get(tlf_id)
            .is_some_and(|current| rev <= *current)
        {
            return Ok(());
        }
        store.put_last_unref(
            tlf_id,
            &LastUnrefEntry {
                rev,
                ctime: self.clock.now(),
            },
        )?;
        state.last_unrefs.insert(*tlf_id, rev);
        Ok(())
    }

    pub async fn get_tlf_size(&self, tlf_id: &TlfId) -> crate::Result<u64> {
        let state = self.state.read().await;
        self.check(&state, "get_tlf_size")?;
        Ok(state.counts.tlf_size(tlf_id))
    }

    pub async fn get_tlf_ids(&self) -> crate::Result<Vec<TlfId>> {
        let state = self.state.read().await;
        self.check(&state, "get_tlf_ids")?;
        Ok(state.counts.tlf_ids())
    }

    /// Makes `tlf_id` a home folder, evicted only after non-home folders.
    pub async fn add_home_tlf(&self, tlf_id: &TlfId) -> crate::Result<()> {
        let priority = match tlf_id.tlf_type() {
            TlfType::Private => EvictionPriority::PrivateHome,
            TlfType::Public => EvictionPriority::PublicHome,
            TlfType::SingleTeam => return Err(Error::TeamFolderAsHome(*tlf_id)),
        };
        let mut state = self.state.write().await;
        self.check(&state, "add_home_tlf")?;
        let current = state.priority(tlf_id);
        state.counts.move_priority(tlf_id, current, priority);
        state.home_dirs.insert(*tlf_id, priority);
        Ok(())
    }

    pub async fn clear_home_tlfs(&self) -> crate::Result<()> {
        let mut state = self.state.write().await;
        self.check(&state, "clear_home_tlfs")?;
        let home_dirs = std::mem::take(&mut state.home_dirs);
        for (tlf_id, priority) in home_dirs {
            state
                .counts
                .move_priority(&tlf_id, priority, EvictionPriority::NotHome);
        }
        Ok(())
    }

    /// Whether the cache is below 99% of its limit, and the tier's free bytes.
    pub async fn does_cache_have_space(&self) -> crate::Result<(bool, i64)> {
        let curr_bytes = {
            let state = self.state.read().await;
            self.check(&state, "does_cache_have_space")?;
            state.counts.curr_bytes()
        };
        let status = self.limiter.tracker_status(self.tier.tracker_kind())?;
        let has_space = match self.tier {
            // the limiter does not track sync usage against its ceiling, our own total does
            CacheTier::Sync => {
                status.max > 0 && curr_bytes as f64 / status.max as f64 <= FULL_FRAC
            }
            CacheTier::WorkingSet => status.used_frac <= FULL_FRAC,
        };
        Ok((has_space, status.free))
    }

    pub async fn status(&self) -> DiskBlockCacheStatus {
        let start_state = self.start_state();
        if start_state != StartState::Started {
            return DiskBlockCacheStatus {
                start_state,
                num_blocks: 0,
                block_bytes: 0,
                curr_byte_limit: 0,
                last_unref_count: 0,
                meters: CacheMetersStatus::default(),
                local_disk_bytes_available: 0,
                local_disk_bytes_total: 0,
            };
        }
        let curr_byte_limit = match self.limiter.tracker_status(self.tier.tracker_kind()) {
            Ok(status) => u64::try_from(status.max).unwrap_or(0),
            Err(error) => {
                tracing::debug!("{}: no limiter status: {}", self.tier, error);
                0
            }
        };
        let disk = match common::diskstat::disk_limits(&self.dir) {
            Ok(disk) => disk,
            Err(error) => {
                tracing::debug!("{}: cannot stat {:?}: {}", self.tier, self.dir, error);
                common::diskstat::DiskLimits::default()
            }
        };
        let state = self.state.read().await;
        DiskBlockCacheStatus {
            start_state,
            num_blocks: state.counts.num_blocks(),
            block_bytes: state.counts.curr_bytes(),
            curr_byte_limit,
            last_unref_count: state.last_unrefs.len() as u64,
            meters: self.meters.status(),
            local_disk_bytes_available: disk.available_bytes,
            local_disk_bytes_total: disk.total_bytes,
        }
    }

    /// Waits for startup, flushes and closes the store and unregisters the cache's bytes
    /// from the limiter. Later calls fail with [`Error::Closed`].
    pub async fn shutdown(&self) {
        let started = self.wait_until_started().await.is_ok();
        let mut state = self.state.write().await;
        let Some(store) = state.store.take() else {
            return;
        };
        if let Err(error) = store.persist() {
            tracing::warn!("{}: cannot flush store on shutdown: {}", self.tier, error);
        }
        if started {
            let curr_bytes = state.counts.curr_bytes() as i64;
            if let Err(error) = self
                .limiter
                .on_simple_byte_tracker_disable(self.tier.tracker_kind(), curr_bytes)
            {
                tracing::warn!("{}: cannot unregister from limiter: {}", self.tier, error);
            }
        }
    }
}
