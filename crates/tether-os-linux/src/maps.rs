//! `/proc/<pid>/maps` parsing.

use tether_core::{MemoryAccess, MemoryRegion, Va};

use crate::LinuxError;

/// Parses a complete mapping table.
///
/// Regions are returned in file order. Blank lines are ignored; any other
/// malformed line fails the whole table.
pub fn parse_maps(content: &str) -> Result<Vec<MemoryRegion>, LinuxError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| parse_maps_line(line, index + 1))
        .collect()
}

/// Parses a single line of a mapping table.
///
/// ```text
/// 7f1c2a400000-7f1c2a428000 r--p 00000000 08:01 1835017    /usr/lib/libc.so.6
/// ```
pub fn parse_maps_line(line: &str, line_number: usize) -> Result<MemoryRegion, LinuxError> {
    let malformed = |reason| LinuxError::MalformedMaps {
        line: line_number,
        reason,
    };

    let mut rest = line;

    let range = next_field(&mut rest).ok_or(malformed("missing address range"))?;
    let perms = next_field(&mut rest).ok_or(malformed("missing permissions"))?;
    let offset = next_field(&mut rest).ok_or(malformed("missing offset"))?;
    let _device = next_field(&mut rest).ok_or(malformed("missing device"))?;
    let _inode = next_field(&mut rest).ok_or(malformed("missing inode"))?;

    let (start, end) = range
        .split_once('-')
        .ok_or(malformed("address range without separator"))?;
    let start = u64::from_str_radix(start, 16).map_err(|_| malformed("invalid start address"))?;
    let end = u64::from_str_radix(end, 16).map_err(|_| malformed("invalid end address"))?;

    if start >= end {
        return Err(malformed("empty address range"));
    }

    let protection = MemoryAccess::from_perms(perms).ok_or(malformed("invalid permissions"))?;
    let shared = match perms.as_bytes().get(3) {
        Some(b's') => true,
        Some(b'p') => false,
        _ => return Err(malformed("invalid sharing flag")),
    };

    let offset = u64::from_str_radix(offset, 16).map_err(|_| malformed("invalid offset"))?;

    // The path is the remainder of the line and may itself contain spaces.
    let path = match rest.trim_start() {
        "" => None,
        path => Some(path.to_owned()),
    };

    Ok(MemoryRegion {
        start: Va(start),
        end: Va(end),
        protection,
        shared,
        offset,
        path,
    })
}

fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }

    let end = trimmed.find(' ').unwrap_or(trimmed.len());
    let (field, remainder) = trimmed.split_at(end);
    *rest = remainder;
    Some(field)
}
