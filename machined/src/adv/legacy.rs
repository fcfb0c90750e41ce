//! Syslinux ADV.
//!
//! ```text
//!   0 ..   3   magic1 (LE)
//!   4 ..   7   checksum (LE): MAGIC2 - sum(u32 words 8..508)
//!   8 .. 507   { tag: u8, len: u8, value: [len]u8 }*, tag 0 terminates
//! 508 .. 511   magic3 (LE)
//! ```
//!
//! The block is stored twice at the tail of `ldlinux.sys`.

use super::Adv;
use machined_shared::{MachinedError, MachinedResult};
use std::io::{Read, Seek, SeekFrom, Write};

/// Size of one copy.
pub const SIZE: usize = 512;

const MAGIC1: u32 = 0x5a2d2fa5;
const MAGIC2: u32 = 0xa3041767;
const MAGIC3: u32 = 0xdd28bf64;

const DATA_START: usize = 8;
const DATA_END: usize = SIZE - 4;

/// Largest value a single tag can hold.
pub const MAX_VALUE_LEN: usize = u8::MAX as usize;

#[derive(Clone, PartialEq, Eq)]
pub struct LegacyAdv {
    block: [u8; SIZE],
}

impl std::fmt::Debug for LegacyAdv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyAdv")
            .field("tags", &self.list_tags())
            .finish()
    }
}

impl Default for LegacyAdv {
    fn default() -> Self {
        Self::new()
    }
}

impl LegacyAdv {
    /// Empty ADV with valid head, tail and checksum.
    pub fn new() -> Self {
        let mut block = [0u8; SIZE];
        block[0..4].copy_from_slice(&MAGIC1.to_le_bytes());
        block[DATA_END..SIZE].copy_from_slice(&MAGIC3.to_le_bytes());
        let mut adv = Self { block };
        adv.update_checksum();
        adv
    }

    /// Parse both copies, accepting the first one that validates.
    pub fn parse(buf: &[u8]) -> MachinedResult<Self> {
        if buf.len() < 2 * SIZE {
            return Err(MachinedError::InvalidArgument(format!(
                "legacy ADV needs {} bytes, got {}",
                2 * SIZE,
                buf.len()
            )));
        }

        let (first, second) = (&buf[..SIZE], &buf[SIZE..2 * SIZE]);
        let chosen = match (is_valid(first), is_valid(second)) {
            (true, second_valid) => {
                if second_valid && first != second {
                    tracing::warn!("Legacy ADV copies differ, using the first copy");
                }
                first
            }
            (false, true) => {
                tracing::warn!("First legacy ADV copy is invalid, using the second copy");
                second
            }
            (false, false) => {
                return Err(MachinedError::Corrupted(
                    "no valid legacy ADV copy".to_string(),
                ));
            }
        };

        let mut block = [0u8; SIZE];
        block.copy_from_slice(chosen);
        Ok(Self { block })
    }

    /// Read both copies from the last `2 * SIZE` bytes of `r`.
    pub fn load<R: Read + Seek>(r: &mut R) -> MachinedResult<Self> {
        r.seek(SeekFrom::End(-(2 * SIZE as i64)))?;
        let mut buf = vec![0u8; 2 * SIZE];
        r.read_exact(&mut buf)?;
        Self::parse(&buf)
    }

    /// Write both copies over the last `2 * SIZE` bytes of `w`.
    pub fn store<W: Write + Seek>(&self, w: &mut W) -> MachinedResult<()> {
        w.seek(SeekFrom::End(-(2 * SIZE as i64)))?;
        w.write_all(&self.bytes())?;
        w.flush()?;
        Ok(())
    }

    fn update_checksum(&mut self) {
        let csum = checksum(&self.block);
        self.block[4..8].copy_from_slice(&csum.to_le_bytes());
    }

    /// `(offset, tag, len)` of every entry up to the terminator.
    fn entries(&self) -> Vec<(usize, u8, usize)> {
        let mut out = Vec::new();
        let mut offset = DATA_START;
        while offset + 2 <= DATA_END {
            let tag = self.block[offset];
            if tag == super::tags::END {
                break;
            }
            let len = self.block[offset + 1] as usize;
            if offset + 2 + len > DATA_END {
                break;
            }
            out.push((offset, tag, len));
            offset += 2 + len;
        }
        out
    }

    /// Offset of the first terminator.
    fn end(&self) -> usize {
        self.entries()
            .last()
            .map(|(offset, _, len)| offset + 2 + len)
            .unwrap_or(DATA_START)
    }
}

fn checksum(block: &[u8]) -> u32 {
    block[DATA_START..DATA_END]
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .fold(MAGIC2, |acc, word| acc.wrapping_sub(word))
}

fn is_valid(block: &[u8]) -> bool {
    let head = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    let stored = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
    let tail = u32::from_le_bytes([
        block[DATA_END],
        block[DATA_END + 1],
        block[DATA_END + 2],
        block[DATA_END + 3],
    ]);
    head == MAGIC1 && tail == MAGIC3 && stored == checksum(block)
}

impl Adv for LegacyAdv {
    fn read_tag_bytes(&self, tag: u8) -> Option<Vec<u8>> {
        self.entries()
            .into_iter()
            .find(|(_, t, _)| *t == tag)
            .map(|(offset, _, len)| self.block[offset + 2..offset + 2 + len].to_vec())
    }

    fn set_tag_bytes(&mut self, tag: u8, value: &[u8]) -> MachinedResult<()> {
        if tag == super::tags::END {
            return Err(MachinedError::InvalidArgument(
                "tag 0 is reserved".to_string(),
            ));
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(MachinedError::InvalidArgument(format!(
                "value of {} bytes exceeds {} bytes",
                value.len(),
                MAX_VALUE_LEN
            )));
        }

        let existing = self
            .entries()
            .into_iter()
            .find(|(_, t, _)| *t == tag)
            .map(|(_, _, len)| 2 + len)
            .unwrap_or(0);
        let end = self.end() - existing;
        if end + 2 + value.len() > DATA_END {
            return Err(MachinedError::InvalidArgument(format!(
                "tag 0x{:02x} does not fit in the legacy ADV",
                tag
            )));
        }

        self.delete_tag(tag);

        self.block[end] = tag;
        self.block[end + 1] = value.len() as u8;
        self.block[end + 2..end + 2 + value.len()].copy_from_slice(value);
        self.update_checksum();
        Ok(())
    }

    fn delete_tag(&mut self, tag: u8) -> bool {
        let Some((offset, _, len)) = self.entries().into_iter().find(|(_, t, _)| *t == tag)
        else {
            return false;
        };

        let shift = 2 + len;
        self.block.copy_within(offset + shift..DATA_END, offset);
        self.block[DATA_END - shift..DATA_END].fill(0);
        self.update_checksum();
        true
    }

    fn list_tags(&self) -> Vec<u8> {
        self.entries().into_iter().map(|(_, tag, _)| tag).collect()
    }

    fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * SIZE);
        out.extend_from_slice(&self.block);
        out.extend_from_slice(&self.block);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv::tags;
    use std::io::Cursor;

    #[test]
    fn test_new_is_valid_and_empty() {
        let adv = LegacyAdv::new();
        assert!(is_valid(&adv.block));
        assert!(adv.list_tags().is_empty());
    }

    #[test]
    fn test_set_read_delete() {
        let mut adv = LegacyAdv::new();
        adv.set_tag(tags::UPGRADE, "B").unwrap();
        adv.set_tag(tags::USER_RESERVED_1, "hello").unwrap();
        assert_eq!(adv.read_tag(tags::UPGRADE).as_deref(), Some("B"));

        adv.set_tag(tags::UPGRADE, "A").unwrap();
        assert_eq!(adv.read_tag(tags::UPGRADE).as_deref(), Some("A"));
        assert_eq!(adv.list_tags(), vec![tags::USER_RESERVED_1, tags::UPGRADE]);

        assert!(adv.delete_tag(tags::UPGRADE));
        assert!(!adv.delete_tag(tags::UPGRADE));
        assert_eq!(adv.read_tag(tags::UPGRADE), None);
        assert!(is_valid(&adv.block));
    }

    #[test]
    fn test_delete_zeroes_freed_tail() {
        let mut adv = LegacyAdv::new();
        adv.set_tag(1, "aaaa").unwrap();
        adv.set_tag(2, "bb").unwrap();
        adv.delete_tag(1);
        assert_eq!(adv.read_tag(2).as_deref(), Some("bb"));
        assert!(adv.block[DATA_START + 4..DATA_END].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_overflow_does_not_mutate() {
        let mut adv = LegacyAdv::new();
        adv.set_tag_bytes(1, &[7u8; 255]).unwrap();
        let before = adv.clone();
        // 8 + 257 + 257 > 508
        assert!(adv.set_tag_bytes(2, &[9u8; 255]).is_err());
        assert_eq!(adv, before);
        assert!(adv.set_tag_bytes(3, &[0u8; 256]).is_err());
    }

    #[test]
    fn test_replacing_tag_reuses_its_space() {
        let mut adv = LegacyAdv::new();
        adv.set_tag_bytes(1, &[1u8; 255]).unwrap();
        adv.set_tag_bytes(2, &[2u8; 200]).unwrap();
        adv.set_tag_bytes(1, &[3u8; 255]).unwrap();
        assert_eq!(adv.read_tag_bytes(1), Some(vec![3u8; 255]));
        assert_eq!(adv.read_tag_bytes(2), Some(vec![2u8; 200]));
    }

    #[test]
    fn test_copies_are_identical() {
        let mut adv = LegacyAdv::new();
        adv.set_tag(tags::UPGRADE, "B").unwrap();
        let bytes = adv.bytes();
        assert_eq!(bytes[..SIZE], bytes[SIZE..]);
    }

    #[test]
    fn test_parse_falls_back_to_second_copy() {
        let mut adv = LegacyAdv::new();
        adv.set_tag(tags::UPGRADE, "B").unwrap();
        let mut bytes = adv.bytes();
        bytes[0] ^= 0xff;

        let parsed = LegacyAdv::parse(&bytes).unwrap();
        assert_eq!(parsed.read_tag(tags::UPGRADE).as_deref(), Some("B"));
    }

    #[test]
    fn test_parse_rejects_two_bad_copies() {
        let mut bytes = LegacyAdv::new().bytes();
        bytes[10] = 1;
        bytes[SIZE + 10] = 1;
        assert!(matches!(
            LegacyAdv::parse(&bytes),
            Err(MachinedError::Corrupted(_))
        ));
    }

    #[test]
    fn test_load_and_store_at_file_tail() {
        let mut file = Cursor::new(vec![0xaau8; 4096]);
        let mut adv = LegacyAdv::new();
        adv.set_tag(tags::UPGRADE, "A").unwrap();
        adv.store(&mut file).unwrap();

        // Contents before the ADV are untouched.
        assert!(file.get_ref()[..4096 - 2 * SIZE].iter().all(|b| *b == 0xaa));

        let loaded = LegacyAdv::load(&mut file).unwrap();
        assert_eq!(loaded, adv);
    }
}
