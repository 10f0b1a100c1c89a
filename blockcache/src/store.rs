//! The LSM store behind one cache tier.
//!
//! Four partitions share one keyspace:
//!
//! - `blocks` - block id to encoded [`Entry`]
//! - `metadata` - block id to encoded [`Metadata`]
//! - `tlfs` - folder id followed by block id, no value; the per-folder index
//! - `last_unref` - folder id to encoded [`LastUnrefEntry`]

use crate::metadata::{Entry, LastUnrefEntry, Metadata};
use common::{BlockId, Revision, TlfId};

/// Key of a block in the per-folder index.
#[must_use]
pub fn tlf_key(tlf_id: &TlfId, block_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(common::ids::TLF_ID_LEN + block_key.len());
    key.extend_from_slice(tlf_id.as_bytes());
    key.extend_from_slice(block_key);
    key
}

/// A per-folder index entry whose block part may or may not decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlfIndexEntry {
    pub block_key: Vec<u8>,
}

impl TlfIndexEntry {
    pub fn block_id(&self) -> Result<BlockId, common::ids::IdError> {
        BlockId::from_bytes(&self.block_key)
    }
}

#[derive(Clone)]
pub struct Store {
    keyspace: fjall::Keyspace,
    blocks: fjall::PartitionHandle,
    metadata: fjall::PartitionHandle,
    tlfs: fjall::PartitionHandle,
    last_unref: fjall::PartitionHandle,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn open(path: &std::path::Path) -> crate::Result<Self> {
        let keyspace = fjall::Config::new(path).open()?;
        let open = |name: &str| {
            keyspace.open_partition(name, fjall::PartitionCreateOptions::default())
        };
        let blocks = open("blocks")?;
        let metadata = open("metadata")?;
        let tlfs = open("tlfs")?;
        let last_unref = open("last_unref")?;
        Ok(Self {
            keyspace,
            blocks,
            metadata,
            tlfs,
            last_unref,
        })
    }

    pub fn has_block(&self, block_id: &BlockId) -> crate::Result<bool> {
        Ok(self.blocks.contains_key(block_id.to_bytes())?)
    }

    pub fn get_block(&self, block_id: &BlockId) -> crate::Result<Option<Entry>> {
        match self.blocks.get(block_id.to_bytes())? {
            Some(buf) => Ok(Some(common::codec::decode(&buf)?)),
            None => Ok(None),
        }
    }

    /// Size of the stored entry under a raw block key, if any.
    pub fn block_len(&self, block_key: &[u8]) -> crate::Result<Option<u64>> {
        Ok(self.blocks.get(block_key)?.map(|buf| buf.len() as u64))
    }

    pub fn put_block(&self, block_id: &BlockId, encoded: &[u8]) -> crate::Result<()> {
        self.blocks.insert(&block_id.to_bytes()[..], encoded)?;
        Ok(())
    }

    /// Raw metadata bytes, so callers can tell a missing record from an undecodable one.
    pub fn get_metadata_raw(&self, block_key: &[u8]) -> crate::Result<Option<fjall::Slice>> {
        Ok(self.metadata.get(block_key)?)
    }

    pub fn get_metadata(&self, block_id: &BlockId) -> crate::Result<Option<Metadata>> {
        match self.metadata.get(block_id.to_bytes())? {
            Some(buf) => Ok(Some(common::codec::decode(&buf)?)),
            None => Ok(None),
        }
    }

    pub fn put_metadata(&self, block_id: &BlockId, metadata: &Metadata) -> crate::Result<()> {
        self.metadata
            .insert(&block_id.to_bytes()[..], common::codec::encode(metadata)?)?;
        Ok(())
    }

    pub fn has_tlf_entry(&self, tlf_id: &TlfId, block_id: &BlockId) -> crate::Result<bool> {
        Ok(self.tlfs.contains_key(tlf_key(tlf_id, &block_id.to_bytes()))?)
    }

    pub fn put_tlf_entry(&self, tlf_id: &TlfId, block_id: &BlockId) -> crate::Result<()> {
        self.tlfs
            .insert(tlf_key(tlf_id, &block_id.to_bytes()), Vec::new())?;
        Ok(())
    }

    /// Up to `limit` index entries of `tlf_id`, starting at the block key `from` (inclusive).
    pub fn scan_tlf(
        &self,
        tlf_id: &TlfId,
        from: &[u8],
        limit: usize,
    ) -> crate::Result<Vec<TlfIndexEntry>> {
        let start = tlf_key(tlf_id, from);
        let end = tlf_key(tlf_id, &BlockId::max().to_bytes());
        let mut out = Vec::new();
        for item in self.tlfs.range(start..end).take(limit) {
            let (key, _) = item?;
            out.push(TlfIndexEntry {
                block_key: key[common::ids::TLF_ID_LEN..].to_vec(),
            });
        }
        Ok(out)
    }

    /// Atomically removes payload, metadata and index entries of `blocks`.
    pub fn delete_blocks(&self, blocks: &[(BlockId, TlfId)]) -> crate::Result<()> {
        let mut batch = self.keyspace.batch();
        for (block_id, tlf_id) in blocks {
            let key = block_id.to_bytes();
            batch.remove(&self.blocks, &key[..]);
            batch.remove(&self.metadata, &key[..]);
            batch.remove(&self.tlfs, tlf_key(tlf_id, &key));
        }
        batch.commit()?;
        Ok(())
    }

    /// Removes everything stored under a raw block key whose index entry or metadata
    /// could not be decoded.
    pub fn delete_raw(&self, tlf_id: &TlfId, block_key: &[u8]) -> crate::Result<()> {
        let mut batch = self.keyspace.batch();
        batch.remove(&self.blocks, block_key);
        batch.remove(&self.metadata, block_key);
        batch.remove(&self.tlfs, tlf_key(tlf_id, block_key));
        batch.commit()?;
        Ok(())
    }

    /// Calls `f` with every decodable metadata record. Undecodable records are an error.
    pub fn try_for_each_metadata(
        &self,
        mut f: impl FnMut(BlockId, Metadata),
    ) -> crate::Result<()> {
        for item in self.metadata.iter() {
            let (key, value) = item?;
            let block_id = BlockId::from_bytes(&key)?;
            f(block_id, common::codec::decode(&value)?);
        }
        Ok(())
    }

    pub fn get_last_unref(&self, tlf_id: &TlfId) -> crate::Result<Option<LastUnrefEntry>> {
        match self.last_unref.get(tlf_id.as_bytes())? {
            Some(buf) => Ok(Some(common::codec::decode(&buf)?)),
            None => Ok(None),
        }
    }

    pub fn put_last_unref(&self, tlf_id: &TlfId, entry: &LastUnrefEntry) -> crate::Result<()> {
        self.last_unref
            .insert(&tlf_id.as_bytes()[..], common::codec::encode(entry)?)?;
        Ok(())
    }

    pub fn all_last_unrefs(&self) -> crate::Result<std::collections::HashMap<TlfId, Revision>> {
        let mut out = std::collections::HashMap::new();
        for item in self.last_unref.iter() {
            let (key, value) = item?;
            let entry: LastUnrefEntry = common::codec::decode(&value)?;
            out.insert(TlfId::from_bytes(&key)?, entry.rev);
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn delete_metadata_for_test(&self, block_id: &BlockId) {
        self.metadata.remove(&block_id.to_bytes()[..]).unwrap();
    }

    #[cfg(test)]
    pub(crate) fn put_metadata_raw_for_test(&self, block_id: &BlockId, raw: &[u8]) {
        self.metadata.insert(&block_id.to_bytes()[..], raw).unwrap();
    }

    /// Flushes the journal to disk.
    pub fn persist(&self) -> crate::Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}
