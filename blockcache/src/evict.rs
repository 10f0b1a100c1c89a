//! Sampling helpers for approximate LRU eviction.
//!
//! Instead of keeping a global recency order, eviction picks a random pivot in the ordered
//! per-folder index, reads a few times more entries than it needs to evict and drops the
//! least recently used of that sample.

use common::{BlockId, TlfId};

/// Eviction order of folders. Lower priorities are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum EvictionPriority {
    NotHome,
    PublicHome,
    PrivateHome,
}

impl EvictionPriority {
    pub const ALL: [EvictionPriority; 3] = [
        EvictionPriority::NotHome,
        EvictionPriority::PublicHome,
        EvictionPriority::PrivateHome,
    ];
}

/// Picks where to start scanning so that, with uniformly distributed ids, about
/// `num_elements` of the `total` entries lie between the pivot and the end of the key space.
#[must_use]
pub fn pivot_block_id(num_elements: usize, total: u64) -> BlockId {
    if total == 0 || num_elements as u64 >= total {
        return BlockId::zero();
    }
    let frac = num_elements as f64 / total as f64;
    BlockId::random_in_range(0.0, 1.0 - frac)
}

/// Shuffles folders so that each lands early with probability proportional to its weight.
///
/// Each folder gets the key `u^(1/weight)` with `u` uniform in `[0, 1)` and the result is
/// sorted by descending key.
pub fn shuffle_weighted<R: rand::Rng>(
    rng: &mut R,
    weights: impl IntoIterator<Item = (TlfId, u64)>,
) -> Vec<TlfId> {
    let mut keyed: Vec<(f64, TlfId)> = weights
        .into_iter()
        .map(|(tlf_id, weight)| {
            let key = if weight == 0 {
                0.0
            } else {
                rng.r#gen::<f64>().powf(1.0 / weight as f64)
            };
            (key, tlf_id)
        })
        .collect();
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    keyed.into_iter().map(|(_, tlf_id)| tlf_id).collect()
}

/// The `n` least recently used candidates.
#[must_use]
pub fn least_recent(
    mut candidates: Vec<(BlockId, std::time::SystemTime)>,
    n: usize,
) -> Vec<BlockId> {
    if candidates.len() > n {
        candidates.sort_by_key(|(_, lru_time)| *lru_time);
        candidates.truncate(n);
    }
    candidates.into_iter().map(|(block_id, _)| block_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TlfType;
    use rand::SeedableRng;

    #[test]
    fn small_folders_scan_from_the_start() {
        assert_eq!(pivot_block_id(30, 10), BlockId::zero());
        assert_eq!(pivot_block_id(30, 30), BlockId::zero());
        assert_eq!(pivot_block_id(30, 0), BlockId::zero());
    }

    #[test]
    fn pivot_leaves_room_for_the_sample() {
        // with 1/10 of the space needed, the pivot lies in the first 90%
        let limit = BlockId::random_in_range(0.9, 0.9);
        for _ in 0..200 {
            assert!(pivot_block_id(10, 100) <= limit);
        }
    }

    #[test]
    fn heavy_folders_come_first_more_often() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let heavy = TlfId::random(TlfType::Private);
        let light = TlfId::random(TlfType::Private);
        let mut heavy_first = 0;
        for _ in 0..1000 {
            let order = shuffle_weighted(&mut rng, [(heavy, 99), (light, 1)]);
            assert_eq!(order.len(), 2);
            if order[0] == heavy {
                heavy_first += 1;
            }
        }
        assert!(heavy_first > 900, "heavy first only {heavy_first} times");
    }

    #[test]
    fn empty_folders_go_last() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let empty = TlfId::random(TlfType::Public);
        let full = TlfId::random(TlfType::Public);
        let order = shuffle_weighted(&mut rng, [(empty, 0), (full, 1)]);
        assert_eq!(order, vec![full, empty]);
    }

    #[test]
    fn least_recent_picks_oldest() {
        let t = |secs| std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs);
        let ids: Vec<BlockId> = (0..4).map(|_| BlockId::random()).collect();
        let picked = least_recent(
            vec![(ids[0], t(30)), (ids[1], t(10)), (ids[2], t(40)), (ids[3], t(20))],
            2,
        );
        assert_eq!(picked, vec![ids[1], ids[3]]);
        // fewer candidates than needed are taken as they are
        assert_eq!(least_recent(vec![(ids[2], t(40))], 2), vec![ids[2]]);
    }
}
