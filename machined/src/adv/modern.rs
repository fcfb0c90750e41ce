//! Checksummed ADV used on the META partition.
//!
//! ```text
//!  0   .. 3      magic1 (BE)
//!  4   .. N-36   { tag: u32 BE, size: u32 BE, value: [size]u8 }*, tag 0 terminates
//!  N-36 .. N-4   sha256 of the block with this field zeroed
//!  N-4  .. N     magic2 (BE)
//! ```

use super::Adv;
use machined_shared::{MachinedError, MachinedResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Size of one copy.
pub const SIZE: usize = 256 * 1024;

const MAGIC1: u32 = 0x5a4b3c2d;
const MAGIC2: u32 = 0xa5b4c3d2;

const DATA_START: usize = 4;
const CHECKSUM_START: usize = SIZE - 36;
const CHECKSUM_END: usize = SIZE - 4;

/// Bytes available for tag entries.
pub const DATA_LENGTH: usize = CHECKSUM_START - DATA_START;

const ENTRY_HEADER: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModernAdv {
    tags: BTreeMap<u8, Vec<u8>>,
}

impl ModernAdv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse two consecutive copies, accepting the first that validates.
    ///
    /// When both validate but disagree the first copy wins.
    pub fn parse(buf: &[u8]) -> MachinedResult<Self> {
        if buf.len() < 2 * SIZE {
            return Err(MachinedError::InvalidArgument(format!(
                "ADV needs {} bytes, got {}",
                2 * SIZE,
                buf.len()
            )));
        }

        let first = Self::parse_block(&buf[..SIZE]);
        let second = Self::parse_block(&buf[SIZE..2 * SIZE]);

        match (first, second) {
            (Ok(first), Ok(second)) => {
                if first != second {
                    tracing::warn!("ADV copies differ, using the first copy");
                }
                Ok(first)
            }
            (Ok(first), Err(err)) => {
                tracing::warn!(error = %err, "Second ADV copy is invalid");
                Ok(first)
            }
            (Err(err), Ok(second)) => {
                tracing::warn!(error = %err, "First ADV copy is invalid, using the second copy");
                Ok(second)
            }
            (Err(first), Err(second)) => Err(MachinedError::Corrupted(format!(
                "both ADV copies are invalid: {}; {}",
                first, second
            ))),
        }
    }

    /// Parse and validate a single copy.
    pub fn parse_block(block: &[u8]) -> MachinedResult<Self> {
        if block.len() != SIZE {
            return Err(MachinedError::Corrupted(format!(
                "ADV block is {} bytes",
                block.len()
            )));
        }
        if read_u32(block, 0) != MAGIC1 {
            return Err(MachinedError::Corrupted("ADV magic1 mismatch".to_string()));
        }
        if read_u32(block, CHECKSUM_END) != MAGIC2 {
            return Err(MachinedError::Corrupted("ADV magic2 mismatch".to_string()));
        }
        if block[CHECKSUM_START..CHECKSUM_END] != checksum(block)[..] {
            return Err(MachinedError::Corrupted("ADV checksum mismatch".to_string()));
        }

        let mut tags = BTreeMap::new();
        let mut offset = DATA_START;
        while offset + ENTRY_HEADER <= CHECKSUM_START {
            let tag = read_u32(block, offset);
            if tag == u32::from(super::tags::END) {
                break;
            }
            let size = read_u32(block, offset + 4) as usize;
            let value_start = offset + ENTRY_HEADER;
            if size > CHECKSUM_START - value_start {
                return Err(MachinedError::Corrupted(format!(
                    "ADV tag 0x{:x} overruns the data area",
                    tag
                )));
            }
            let tag = u8::try_from(tag).map_err(|_| {
                MachinedError::Corrupted(format!("ADV tag 0x{:x} out of range", tag))
            })?;
            tags.insert(tag, block[value_start..value_start + size].to_vec());
            offset = value_start + size;
        }

        Ok(Self { tags })
    }

    /// One serialized copy with checksum filled in.
    pub fn block(&self) -> Vec<u8> {
        let mut block = vec![0u8; SIZE];
        block[0..4].copy_from_slice(&MAGIC1.to_be_bytes());

        let mut offset = DATA_START;
        for (tag, value) in &self.tags {
            block[offset..offset + 4].copy_from_slice(&u32::from(*tag).to_be_bytes());
            block[offset + 4..offset + 8].copy_from_slice(&(value.len() as u32).to_be_bytes());
            offset += ENTRY_HEADER;
            block[offset..offset + value.len()].copy_from_slice(value);
            offset += value.len();
        }

        block[CHECKSUM_END..SIZE].copy_from_slice(&MAGIC2.to_be_bytes());
        let sum = checksum(&block);
        block[CHECKSUM_START..CHECKSUM_END].copy_from_slice(&sum);
        block
    }

    /// Bytes used by all entries.
    fn used(&self) -> usize {
        self.tags.values().map(|v| ENTRY_HEADER + v.len()).sum()
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn checksum(block: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(&block[..CHECKSUM_START]);
    hasher.update([0u8; 32]);
    hasher.update(&block[CHECKSUM_END..]);
    hasher.finalize().into()
}

impl Adv for ModernAdv {
    fn read_tag_bytes(&self, tag: u8) -> Option<Vec<u8>> {
        self.tags.get(&tag).cloned()
    }

    fn set_tag_bytes(&mut self, tag: u8, value: &[u8]) -> MachinedResult<()> {
        if tag == super::tags::END {
            return Err(MachinedError::InvalidArgument(
                "tag 0 is reserved".to_string(),
            ));
        }

        let freed = self
            .tags
            .get(&tag)
            .map(|v| ENTRY_HEADER + v.len())
            .unwrap_or(0);
        if self.used() - freed + ENTRY_HEADER + value.len() > DATA_LENGTH {
            return Err(MachinedError::InvalidArgument(format!(
                "tag 0x{:02x} with {} bytes does not fit in the ADV",
                tag,
                value.len()
            )));
        }

        self.tags.insert(tag, value.to_vec());
        Ok(())
    }

    fn delete_tag(&mut self, tag: u8) -> bool {
        self.tags.remove(&tag).is_some()
    }

    fn list_tags(&self) -> Vec<u8> {
        self.tags.keys().copied().collect()
    }

    fn bytes(&self) -> Vec<u8> {
        let block = self.block();
        let mut out = Vec::with_capacity(2 * SIZE);
        out.extend_from_slice(&block);
        out.extend_from_slice(&block);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv::tags;

    #[test]
    fn test_empty_block_validates() {
        let block = ModernAdv::new().block();
        assert_eq!(block.len(), SIZE);
        assert_eq!(ModernAdv::parse_block(&block).unwrap(), ModernAdv::new());
    }

    #[test]
    fn test_tags_survive_serialization() {
        let mut adv = ModernAdv::new();
        adv.set_tag(tags::UPGRADE, "B").unwrap();
        adv.set_tag_bytes(tags::USER_RESERVED_2, &[0, 1, 2, 3]).unwrap();

        let parsed = ModernAdv::parse(&adv.bytes()).unwrap();
        assert_eq!(parsed.read_tag(tags::UPGRADE).as_deref(), Some("B"));
        assert_eq!(
            parsed.read_tag_bytes(tags::USER_RESERVED_2),
            Some(vec![0, 1, 2, 3])
        );
        assert_eq!(parsed.list_tags(), vec![tags::UPGRADE, tags::USER_RESERVED_2]);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut adv = ModernAdv::new();
        adv.set_tag(tags::UPGRADE, "A").unwrap();
        let mut block = adv.block();
        block[DATA_START + 9] ^= 0x01;
        assert!(matches!(
            ModernAdv::parse_block(&block),
            Err(MachinedError::Corrupted(_))
        ));
    }

    #[test]
    fn test_zeroed_first_copy_falls_back() {
        let mut adv = ModernAdv::new();
        adv.set_tag(tags::USER_RESERVED_1, "keep").unwrap();
        let mut bytes = adv.bytes();
        bytes[..SIZE].fill(0);

        let parsed = ModernAdv::parse(&bytes).unwrap();
        assert_eq!(parsed, adv);
    }

    #[test]
    fn test_differing_valid_copies_prefer_first() {
        let mut first = ModernAdv::new();
        first.set_tag(tags::UPGRADE, "A").unwrap();
        let mut second = ModernAdv::new();
        second.set_tag(tags::UPGRADE, "B").unwrap();

        let mut bytes = first.block();
        bytes.extend_from_slice(&second.block());
        let parsed = ModernAdv::parse(&bytes).unwrap();
        assert_eq!(parsed.read_tag(tags::UPGRADE).as_deref(), Some("A"));
    }

    #[test]
    fn test_both_copies_corrupted() {
        let bytes = vec![0u8; 2 * SIZE];
        assert!(matches!(
            ModernAdv::parse(&bytes),
            Err(MachinedError::Corrupted(_))
        ));
    }

    #[test]
    fn test_data_length_budget() {
        let mut adv = ModernAdv::new();
        adv.set_tag_bytes(1, &vec![0u8; DATA_LENGTH - ENTRY_HEADER])
            .unwrap();
        assert!(adv.set_tag_bytes(2, &[]).is_err());
        assert_eq!(adv.list_tags(), vec![1]);

        // Replacing the only tag frees its space first.
        adv.set_tag_bytes(1, &vec![1u8; DATA_LENGTH - ENTRY_HEADER])
            .unwrap();
        assert!(ModernAdv::parse_block(&adv.block()).is_ok());
    }

    #[test]
    fn test_delete_missing_tag() {
        let mut adv = ModernAdv::new();
        assert!(!adv.delete_tag(tags::UPGRADE));
    }
}
