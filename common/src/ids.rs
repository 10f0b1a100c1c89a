//! Identifiers shared by the limiter and the block caches.
//!
//! Block identifiers are content hashes prefixed with a one byte hash type, so their byte
//! order is uniformly distributed. The eviction sampler depends on that to pick pivots.

use serde::{Deserialize, Serialize};

/// Length of the hash part of a block identifier.
pub const HASH_LEN: usize = 32;
/// Length of a serialized block identifier (hash type byte followed by the hash).
pub const BLOCK_ID_LEN: usize = HASH_LEN + 1;
/// Hash type of every block identifier produced by current clients.
pub const DEFAULT_HASH_TYPE: u8 = 0x01;
/// Largest hash type byte, used to build the upper bound of the key space.
pub const MAX_HASH_TYPE: u8 = 0xff;
/// Length of a serialized folder identifier.
pub const TLF_ID_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("invalid {kind} length {len}, expected {expected}")]
    InvalidLength {
        kind: &'static str,
        len: usize,
        expected: usize,
    },
    #[error("unknown folder type suffix {0:#04x}")]
    UnknownTlfSuffix(u8),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Content-derived identifier of an encrypted block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    hash_type: u8,
    hash: [u8; HASH_LEN],
}

impl BlockId {
    #[must_use]
    pub fn from_hash(hash: [u8; HASH_LEN]) -> Self {
        Self {
            hash_type: DEFAULT_HASH_TYPE,
            hash,
        }
    }

    /// The all-zero identifier, which sorts before every real block.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            hash_type: 0,
            hash: [0; HASH_LEN],
        }
    }

    /// The largest representable identifier, an exclusive upper bound for range scans.
    #[must_use]
    pub fn max() -> Self {
        Self {
            hash_type: MAX_HASH_TYPE,
            hash: [0xff; HASH_LEN],
        }
    }

    #[must_use]
    pub fn random() -> Self {
        Self::from_hash(rand::random())
    }

    /// Picks a random identifier whose position in the key space lies in `[start, end)`,
    /// where both bounds are fractions of the space of default-type identifiers.
    #[must_use]
    pub fn random_in_range(start: f64, end: f64) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let start = start.clamp(0.0, 1.0);
        let end = end.clamp(start, 1.0);
        let frac = if end > start {
            rng.gen_range(start..end)
        } else {
            start
        };
        // the leading 8 bytes carry the position, the rest is noise
        let prefix = (frac * u64::MAX as f64) as u64;
        let mut hash: [u8; HASH_LEN] = rng.r#gen();
        hash[..8].copy_from_slice(&prefix.to_be_bytes());
        Self::from_hash(hash)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; BLOCK_ID_LEN] {
        let mut out = [0u8; BLOCK_ID_LEN];
        out[0] = self.hash_type;
        out[1..].copy_from_slice(&self.hash);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.len() != BLOCK_ID_LEN {
            return Err(IdError::InvalidLength {
                kind: "block id",
                len: bytes.len(),
                expected: BLOCK_ID_LEN,
            });
        }
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&bytes[1..]);
        Ok(Self {
            hash_type: bytes[0],
            hash,
        })
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockId({self})")
    }
}

impl std::str::FromStr for BlockId {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(&hex::decode(s)?)
    }
}

/// Visibility class of a folder, encoded in the last byte of its identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlfType {
    Private,
    Public,
    SingleTeam,
}

impl TlfType {
    const PRIVATE_SUFFIX: u8 = 0x16;
    const PUBLIC_SUFFIX: u8 = 0x17;
    const SINGLE_TEAM_SUFFIX: u8 = 0x26;

    fn suffix(self) -> u8 {
        match self {
            TlfType::Private => Self::PRIVATE_SUFFIX,
            TlfType::Public => Self::PUBLIC_SUFFIX,
            TlfType::SingleTeam => Self::SINGLE_TEAM_SUFFIX,
        }
    }

    fn from_suffix(suffix: u8) -> Result<Self, IdError> {
        match suffix {
            Self::PRIVATE_SUFFIX => Ok(TlfType::Private),
            Self::PUBLIC_SUFFIX => Ok(TlfType::Public),
            Self::SINGLE_TEAM_SUFFIX => Ok(TlfType::SingleTeam),
            other => Err(IdError::UnknownTlfSuffix(other)),
        }
    }
}

/// Identifier of a top-level folder, the unit of per-folder accounting in the caches.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TlfId([u8; TLF_ID_LEN]);

impl TlfId {
    #[must_use]
    pub fn random(tlf_type: TlfType) -> Self {
        let mut bytes: [u8; TLF_ID_LEN] = rand::random();
        bytes[TLF_ID_LEN - 1] = tlf_type.suffix();
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; TLF_ID_LEN] =
            bytes
                .try_into()
                .map_err(|_| IdError::InvalidLength {
                    kind: "folder id",
                    len: bytes.len(),
                    expected: TLF_ID_LEN,
                })?;
        TlfType::from_suffix(arr[TLF_ID_LEN - 1])?;
        Ok(Self(arr))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TLF_ID_LEN] {
        &self.0
    }

    #[must_use]
    pub fn tlf_type(&self) -> TlfType {
        // validated on construction
        TlfType::from_suffix(self.0[TLF_ID_LEN - 1]).unwrap_or(TlfType::Private)
    }
}

impl std::fmt::Display for TlfId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for TlfId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlfId({self})")
    }
}

impl std::str::FromStr for TlfId {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(&hex::decode(s)?)
    }
}

/// Metadata revision of a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(pub i64);

impl Revision {
    pub const UNINITIALIZED: Revision = Revision(0);
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The user or team whose quota a write is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct UserOrTeamId(pub String);

impl UserOrTeamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for UserOrTeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-held half of a block's encryption key, stored next to the encrypted payload.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerHalf(pub [u8; 32]);

impl ServerHalf {
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Debug for ServerHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // key material stays out of logs
        f.write_str("ServerHalf(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_bytes_round_trip_through_hex() {
        let id = BlockId::random();
        let parsed: BlockId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(BlockId::from_bytes(&[0u8; 5]).is_err());
    }

    #[test]
    fn key_space_bounds_order() {
        let id = BlockId::random();
        assert!(BlockId::zero().to_bytes() < id.to_bytes());
        assert!(id.to_bytes() < BlockId::max().to_bytes());
    }

    #[test]
    fn random_in_range_stays_in_range() {
        for _ in 0..100 {
            let id = BlockId::random_in_range(0.0, 0.25);
            let prefix = u64::from_be_bytes(id.to_bytes()[1..9].try_into().unwrap());
            assert!(prefix <= u64::MAX / 4 + 1);
        }
    }

    #[test]
    fn tlf_type_survives_parsing() {
        let tlf = TlfId::random(TlfType::Public);
        let parsed: TlfId = tlf.to_string().parse().unwrap();
        assert_eq!(parsed.tlf_type(), TlfType::Public);
        let mut bad = *tlf.as_bytes();
        bad[TLF_ID_LEN - 1] = 0x99;
        assert!(matches!(
            TlfId::from_bytes(&bad),
            Err(IdError::UnknownTlfSuffix(0x99))
        ));
    }
}
