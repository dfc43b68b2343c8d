//! Frame checksum algorithms

use serde::{Deserialize, Serialize};

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Checksum carried in the frame trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    /// No checksum field; only the end token is validated
    None,
    /// CRC-32 (IEEE)
    #[default]
    Crc32,
    /// 32-bit FNV-1a
    Fnv1a,
}

impl ChecksumKind {
    /// Bytes the checksum occupies in the trailer.
    pub const fn size(&self) -> usize {
        match self {
            ChecksumKind::None => 0,
            ChecksumKind::Crc32 | ChecksumKind::Fnv1a => 4,
        }
    }

    /// Compute the checksum over `data`.
    pub fn compute(&self, data: &[u8]) -> u32 {
        match self {
            ChecksumKind::None => 0,
            ChecksumKind::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(data);
                hasher.finalize()
            }
            ChecksumKind::Fnv1a => fnv1a32(data),
        }
    }
}

fn fnv1a32(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| (hash ^ byte as u32).wrapping_mul(FNV_PRIME))
}
