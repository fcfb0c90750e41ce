//! Read-only GPT parser.
//!
//! Only what the installer needs: partition numbers, bounds, types and names
//! from the primary header.

use machined_shared::{MachinedError, MachinedResult};
use std::io::{Read, Seek, SeekFrom};

const SIGNATURE: &[u8; 8] = b"EFI PART";
const ENTRY_NAME_LEN: usize = 72;

/// One used partition entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// 1-based partition number.
    pub number: u32,
    pub type_guid: String,
    pub unique_guid: String,
    pub first_lba: u64,
    pub last_lba: u64,
    pub name: String,
}

impl PartitionEntry {
    pub fn size(&self, sector_size: u64) -> u64 {
        (self.last_lba - self.first_lba + 1) * sector_size
    }
}

#[derive(Debug, Clone)]
pub struct PartitionTable {
    pub disk_guid: String,
    pub last_usable_lba: u64,
    pub partitions: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Parse the primary GPT of `r`.
    pub fn read<R: Read + Seek>(r: &mut R, sector_size: u64) -> MachinedResult<Self> {
        let mut header = vec![0u8; sector_size as usize];
        r.seek(SeekFrom::Start(sector_size))?;
        r.read_exact(&mut header)?;

        if &header[0..8] != SIGNATURE {
            return Err(MachinedError::NotFound("no GPT signature".to_string()));
        }

        let last_usable_lba = le_u64(&header, 48);
        let disk_guid = format_guid(&header[56..72]);
        let entries_lba = le_u64(&header, 72);
        let entry_count = le_u32(&header, 80) as usize;
        let entry_size = le_u32(&header, 84) as usize;

        if entry_size < 128 || entry_count > 1024 {
            return Err(MachinedError::Corrupted(format!(
                "implausible GPT entry array: {} x {}",
                entry_count, entry_size
            )));
        }

        let mut entries = vec![0u8; entry_count * entry_size];
        r.seek(SeekFrom::Start(entries_lba * sector_size))?;
        r.read_exact(&mut entries)?;

        let partitions = entries
            .chunks_exact(entry_size)
            .enumerate()
            .filter(|(_, e)| e[0..16].iter().any(|b| *b != 0))
            .map(|(i, e)| PartitionEntry {
                number: i as u32 + 1,
                type_guid: format_guid(&e[0..16]),
                unique_guid: format_guid(&e[16..32]),
                first_lba: le_u64(e, 32),
                last_lba: le_u64(e, 40),
                name: decode_name(&e[56..56 + ENTRY_NAME_LEN]),
            })
            .collect();

        Ok(Self {
            disk_guid,
            last_usable_lba,
            partitions,
        })
    }

    pub fn by_name(&self, name: &str) -> Option<&PartitionEntry> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn by_number(&self, number: u32) -> Option<&PartitionEntry> {
        self.partitions.iter().find(|p| p.number == number)
    }
}

fn le_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn le_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// GUIDs store their first three fields little-endian.
pub fn format_guid(b: &[u8]) -> String {
    format!(
        "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{}-{}",
        b[3],
        b[2],
        b[1],
        b[0],
        b[5],
        b[4],
        b[7],
        b[6],
        hex::encode_upper(&b[8..10]),
        hex::encode_upper(&b[10..16]),
    )
}

fn decode_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse_guid(s: &str) -> [u8; 16] {
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        let raw = hex::decode(hex).unwrap();
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&[raw[3], raw[2], raw[1], raw[0]]);
        out[4..6].copy_from_slice(&[raw[5], raw[4]]);
        out[6..8].copy_from_slice(&[raw[7], raw[6]]);
        out[8..16].copy_from_slice(&raw[8..16]);
        out
    }

    /// Build a minimal disk image with the given `(type, name, first, last)` entries.
    pub(crate) fn build_image(entries: &[(&str, &str, u64, u64)]) -> Vec<u8> {
        let sector = 512usize;
        let mut disk = vec![0u8; sector * 64];

        let header = &mut disk[sector..2 * sector];
        header[0..8].copy_from_slice(SIGNATURE);
        header[48..56].copy_from_slice(&60u64.to_le_bytes());
        header[72..80].copy_from_slice(&2u64.to_le_bytes());
        header[80..84].copy_from_slice(&128u32.to_le_bytes());
        header[84..88].copy_from_slice(&128u32.to_le_bytes());

        for (i, (type_guid, name, first, last)) in entries.iter().enumerate() {
            let start = 2 * sector + i * 128;
            let e = &mut disk[start..start + 128];
            e[0..16].copy_from_slice(&parse_guid(type_guid));
            e[16] = i as u8 + 1;
            e[32..40].copy_from_slice(&first.to_le_bytes());
            e[40..48].copy_from_slice(&last.to_le_bytes());
            for (j, unit) in name.encode_utf16().enumerate() {
                e[56 + 2 * j..58 + 2 * j].copy_from_slice(&unit.to_le_bytes());
            }
        }
        disk
    }

    #[test]
    fn test_read_entries() {
        let image = build_image(&[
            (crate::constants::gpt::EFI_SYSTEM, "EFI", 34, 39),
            (crate::constants::gpt::LINUX_FILESYSTEM, "EPHEMERAL", 40, 59),
        ]);
        let table = PartitionTable::read(&mut Cursor::new(image), 512).unwrap();

        assert_eq!(table.partitions.len(), 2);
        let efi = table.by_name("EFI").unwrap();
        assert_eq!(efi.number, 1);
        assert_eq!(efi.type_guid, crate::constants::gpt::EFI_SYSTEM);
        assert_eq!(efi.size(512), 6 * 512);
        assert_eq!(table.by_number(2).unwrap().name, "EPHEMERAL");
        assert_eq!(table.last_usable_lba, 60);
    }

    #[test]
    fn test_missing_signature() {
        let image = vec![0u8; 4096];
        assert!(PartitionTable::read(&mut Cursor::new(image), 512).is_err());
    }
}
