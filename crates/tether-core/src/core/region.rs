use serde::{Deserialize, Serialize};

use super::{MemoryAccess, Va};

/// A contiguous mapping in the target's address space.
///
/// Regions cover the half-open range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// First address of the region.
    pub start: Va,

    /// One past the last address of the region.
    pub end: Va,

    /// Protection flags of the region.
    pub protection: MemoryAccess,

    /// Whether the mapping is shared rather than private (copy-on-write).
    pub shared: bool,

    /// Offset into the backing file.
    pub offset: u64,

    /// Backing path or pseudo-path (`[heap]`, `[stack]`, ...), if any.
    pub path: Option<String>,
}

impl MemoryRegion {
    /// Size of the region in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Checks whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Checks whether the region contains the given address.
    pub fn contains(&self, address: Va) -> bool {
        self.start <= address && address < self.end
    }

    /// Checks whether the region is both readable and executable.
    pub fn is_code(&self) -> bool {
        self.protection.contains(MemoryAccess::RX)
    }

    /// Checks whether the region is backed by a path containing `fragment`.
    pub fn path_contains(&self, fragment: &str) -> bool {
        self.path
            .as_deref()
            .is_some_and(|path| path.contains(fragment))
    }
}
