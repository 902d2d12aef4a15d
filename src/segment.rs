//! Enumerates and names segment files: `HHHHHHHHHHHHHHHH.sq`, a 16-char
//! uppercase-hex logical start offset plus the `.sq` extension, 19 bytes
//! total.

use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

pub const NAME_LEN: usize = 19;
pub const EXTENSION: &str = "sq";

/// Formats the 16-char uppercase hex name for a segment starting at
/// `offset`.
pub fn name_for(offset: u64) -> String {
    format!("{offset:016X}.{EXTENSION}")
}

/// Parses a segment filename back into its start offset, returning `None`
/// if it doesn't match the `HHHHHHHHHHHHHHHH.sq` pattern exactly.
pub fn parse_name(name: &str) -> Option<u64> {
    if name.len() != NAME_LEN {
        return None;
    }
    let (hex, ext) = name.split_at(16);
    if ext != ".sq" {
        return None;
    }
    if !hex.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b)) {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

pub fn segment_path(root: &Path, offset: u64) -> PathBuf {
    root.join(name_for(offset))
}

/// Lists segment start offsets in ascending order.
pub fn list(root: &Path) -> Result<Vec<u64>> {
    let mut offsets = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(offsets),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(offset) = parse_name(name) {
            offsets.push(offset);
        }
    }
    offsets.sort_unstable();
    Ok(offsets)
}

/// Greatest segment start offset, i.e. the currently active segment.
pub fn last(root: &Path) -> Result<Option<u64>> {
    Ok(list(root)?.last().copied())
}
