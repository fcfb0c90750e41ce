//! `/proc/mounts` parsing.

use crate::constants::paths;
use machined_shared::MachinedResult;
use std::path::Path;

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub options: String,
}

/// Parse mount table text. Malformed lines are skipped.
pub fn parse(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountEntry {
                source: unescape(fields.next()?),
                target: unescape(fields.next()?),
                fstype: fields.next()?.to_string(),
                options: fields.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// Read and parse a mount table file.
pub fn read_from(path: impl AsRef<Path>) -> MachinedResult<Vec<MountEntry>> {
    Ok(parse(&std::fs::read_to_string(path)?))
}

/// Current mount table.
pub fn read() -> MachinedResult<Vec<MountEntry>> {
    read_from(paths::PROC_MOUNTS)
}

/// Whether `target` is a mount point right now.
pub fn is_mounted(target: &str) -> MachinedResult<bool> {
    Ok(read()?.iter().any(|e| e.target == target))
}

/// Decode the octal escapes (`\040` for space, ...) the kernel writes.
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }

    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = (bytes[i] == b'\\' && i + 3 < bytes.len())
            .then(|| &bytes[i + 1..i + 4])
            .filter(|digits| digits.iter().all(|b| (b'0'..=b'7').contains(b)))
            .map(|d| {
                u16::from(d[0] - b'0') * 64 + u16::from(d[1] - b'0') * 8 + u16::from(d[2] - b'0')
            })
            .and_then(|value| u8::try_from(value).ok());

        match octal {
            Some(value) => {
                out.push(value);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
