//! In-memory running totals of one cache, rebuilt from the metadata partition on start.

use crate::evict::EvictionPriority;
use common::TlfId;

fn decrement(map: &mut std::collections::HashMap<TlfId, u64>, tlf_id: &TlfId, by: u64) {
    if let Some(value) = map.get_mut(tlf_id) {
        *value = value.saturating_sub(by);
        if *value == 0 {
            map.remove(tlf_id);
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Counts {
    num_blocks: u64,
    curr_bytes: u64,
    tlf_counts: std::collections::HashMap<TlfId, u64>,
    tlf_sizes: std::collections::HashMap<TlfId, u64>,
    priority_block_counts: std::collections::HashMap<EvictionPriority, u64>,
    priority_tlf_counts:
        std::collections::HashMap<EvictionPriority, std::collections::HashMap<TlfId, u64>>,
}

impl Counts {
    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn curr_bytes(&self) -> u64 {
        self.curr_bytes
    }

    pub fn tlf_count(&self, tlf_id: &TlfId) -> u64 {
        self.tlf_counts.get(tlf_id).copied().unwrap_or(0)
    }

    pub fn tlf_size(&self, tlf_id: &TlfId) -> u64 {
        self.tlf_sizes.get(tlf_id).copied().unwrap_or(0)
    }

    pub fn tlf_ids(&self) -> Vec<TlfId> {
        self.tlf_counts.keys().copied().collect()
    }

    pub fn priority_count(&self, priority: EvictionPriority) -> u64 {
        self.priority_block_counts
            .get(&priority)
            .copied()
            .unwrap_or(0)
    }

    /// Block counts of the folders at `priority`.
    pub fn priority_weights(&self, priority: EvictionPriority) -> Vec<(TlfId, u64)> {
        self.priority_tlf_counts
            .get(&priority)
            .map(|tlfs| tlfs.iter().map(|(id, count)| (*id, *count)).collect())
            .unwrap_or_default()
    }

    pub fn inc(&mut self, tlf_id: TlfId, priority: EvictionPriority, size: u64) {
        self.num_blocks += 1;
        self.curr_bytes += size;
        *self.tlf_counts.entry(tlf_id).or_default() += 1;
        *self.tlf_sizes.entry(tlf_id).or_default() += size;
        *self.priority_block_counts.entry(priority).or_default() += 1;
        *self
            .priority_tlf_counts
            .entry(priority)
            .or_default()
            .entry(tlf_id)
            .or_default() += 1;
    }

    /// Subtractions saturate at zero; totals drift only if the store was modified behind
    /// the cache's back.
    pub fn dec(&mut self, tlf_id: &TlfId, priority: EvictionPriority, blocks: u64, size: u64) {
        self.num_blocks = self.num_blocks.saturating_sub(blocks);
        self.curr_bytes = self.curr_bytes.saturating_sub(size);
        decrement(&mut self.tlf_counts, tlf_id, blocks);
        decrement(&mut self.tlf_sizes, tlf_id, size);
        if let Some(count) = self.priority_block_counts.get_mut(&priority) {
            *count = count.saturating_sub(blocks);
        }
        if let Some(tlfs) = self.priority_tlf_counts.get_mut(&priority) {
            decrement(tlfs, tlf_id, blocks);
        }
    }

    /// Moves a folder's blocks from one eviction priority to another.
    pub fn move_priority(&mut self, tlf_id: &TlfId, from: EvictionPriority, to: EvictionPriority) {
        if from == to {
            return;
        }
        let count = self.tlf_count(tlf_id);
        if let Some(total) = self.priority_block_counts.get_mut(&from) {
            *total = total.saturating_sub(count);
        }
        if let Some(tlfs) = self.priority_tlf_counts.get_mut(&from) {
            tlfs.remove(tlf_id);
        }
        if count == 0 {
            return;
        }
        *self.priority_block_counts.entry(to).or_default() += count;
        *self
            .priority_tlf_counts
            .entry(to)
            .or_default()
            .entry(*tlf_id)
            .or_default() += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TlfType;

    #[test]
    fn inc_and_dec() {
        let mut counts = Counts::default();
        let tlf = TlfId::random(TlfType::Private);
        counts.inc(tlf, EvictionPriority::NotHome, 10);
        counts.inc(tlf, EvictionPriority::NotHome, 20);
        assert_eq!(counts.num_blocks(), 2);
        assert_eq!(counts.curr_bytes(), 30);
        assert_eq!(counts.tlf_count(&tlf), 2);
        assert_eq!(counts.tlf_size(&tlf), 30);
        assert_eq!(counts.priority_weights(EvictionPriority::NotHome), vec![(tlf, 2)]);

        counts.dec(&tlf, EvictionPriority::NotHome, 2, 30);
        assert_eq!(counts.num_blocks(), 0);
        assert_eq!(counts.curr_bytes(), 0);
        assert!(counts.tlf_ids().is_empty());
        assert!(counts.priority_weights(EvictionPriority::NotHome).is_empty());
    }

    #[test]
    fn dec_saturates() {
        let mut counts = Counts::default();
        let tlf = TlfId::random(TlfType::Public);
        counts.inc(tlf, EvictionPriority::NotHome, 5);
        counts.dec(&tlf, EvictionPriority::NotHome, 3, 50);
        assert_eq!(counts.num_blocks(), 0);
        assert_eq!(counts.curr_bytes(), 0);
        assert_eq!(counts.tlf_count(&tlf), 0);
    }

    #[test]
    fn priorities_move_with_the_folder() {
        let mut counts = Counts::default();
        let home = TlfId::random(TlfType::Private);
        let other = TlfId::random(TlfType::Private);
        for _ in 0..3 {
            counts.inc(home, EvictionPriority::NotHome, 1);
        }
        counts.inc(other, EvictionPriority::NotHome, 1);
        counts.move_priority(&home, EvictionPriority::NotHome, EvictionPriority::PrivateHome);
        assert_eq!(counts.priority_count(EvictionPriority::NotHome), 1);
        assert_eq!(counts.priority_count(EvictionPriority::PrivateHome), 3);
        assert_eq!(
            counts.priority_weights(EvictionPriority::PrivateHome),
            vec![(home, 3)]
        );
        counts.move_priority(&home, EvictionPriority::PrivateHome, EvictionPriority::NotHome);
        assert_eq!(counts.priority_count(EvictionPriority::NotHome), 4);
        assert_eq!(counts.priority_count(EvictionPriority::PrivateHome), 0);
    }
}
