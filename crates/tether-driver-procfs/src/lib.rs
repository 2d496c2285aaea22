//! Memory driver for Linux processes.
//!
//! Transfers go through `/proc/<pid>/mem` first and fall back to
//! `process_vm_readv`/`process_vm_writev`. Neither path stops the target.

mod driver;
mod error;

use std::path::Path;

use tether_core::{MemoryDriver, MemoryRegion, ProcessId, TetherError, Va};

pub use self::error::Error;
use self::driver::ProcfsHandle;

/// How the process memory was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Reads and writes are possible.
    ReadWrite,

    /// The read-write open failed; writes go through `process_vm_writev`
    /// only and may fail.
    ReadOnly,
}

/// Memory driver for a Linux process.
pub struct ProcfsDriver {
    inner: ProcfsHandle,
}

impl ProcfsDriver {
    /// Opens the memory of the process `pid`.
    ///
    /// Attempts a read-write open first and retries read-only on failure.
    /// Fails with [`TetherError::AccessDenied`] if neither works.
    pub fn attach(pid: ProcessId) -> Result<Self, TetherError> {
        Self::attach_with_root(Path::new("/proc"), pid)
    }

    /// Opens the memory of the process `pid` under a different procfs
    /// mount point.
    pub fn attach_with_root(root: &Path, pid: ProcessId) -> Result<Self, TetherError> {
        let inner = ProcfsHandle::open(root, pid)?;
        tracing::debug!(%pid, mode = ?inner.mode(), "opened process memory");

        Ok(Self { inner })
    }

    /// Returns how the process memory was opened.
    pub fn mode(&self) -> AccessMode {
        self.inner.mode()
    }
}

impl MemoryDriver for ProcfsDriver {
    fn process_id(&self) -> ProcessId {
        self.inner.pid()
    }

    fn is_writable(&self) -> bool {
        self.inner.mode() == AccessMode::ReadWrite
    }

    fn read(&self, address: Va, buffer: &mut [u8]) -> Result<(), TetherError> {
        Ok(self.inner.read(address, buffer)?)
    }

    fn write(&self, address: Va, content: &[u8]) -> Result<(), TetherError> {
        Ok(self.inner.write(address, content)?)
    }

    fn read_vectored(&self, requests: &mut [(Va, &mut [u8])]) -> Result<usize, TetherError> {
        Ok(self.inner.read_vectored(requests)?)
    }

    fn write_vectored(&self, requests: &[(Va, &[u8])]) -> Result<usize, TetherError> {
        Ok(self.inner.write_vectored(requests)?)
    }

    fn regions(&self) -> Result<Vec<MemoryRegion>, TetherError> {
        Ok(self.inner.regions()?)
    }
}

#[cfg(test)]
mod tests {
    use tether_core::ProcessMemory;

    use super::*;

    fn attach_self() -> ProcfsDriver {
        ProcfsDriver::attach(ProcessId(std::process::id())).unwrap()
    }

    #[test]
    fn reads_and_writes_own_memory() {
        let driver = attach_self();
        let source = (0u8..64).collect::<Vec<_>>();

        let mut buffer = vec![0u8; 64];
        driver.read(Va(source.as_ptr() as u64), &mut buffer).unwrap();
        assert_eq!(buffer, source);

        let target = vec![0u8; 8];
        driver
            .write(Va(target.as_ptr() as u64), &[9, 8, 7, 6, 5, 4, 3, 2])
            .unwrap();
        assert_eq!(std::hint::black_box(&target), &[9, 8, 7, 6, 5, 4, 3, 2]);
    }

    #[test]
    fn unmapped_reads_fail() {
        let driver = attach_self();
        let mut buffer = [0u8; 16];

        assert!(driver.read(Va(0x10), &mut buffer).is_err());
    }

    #[test]
    fn batch_read_reports_each_entry() {
        let first = vec![0x11u8; 32];
        let second = vec![0x22u8; 16];

        let mut memory = ProcessMemory::new();
        memory.attach(attach_self());

        let results = memory
            .batch_read(&[
                (Va(first.as_ptr() as u64), first.len()),
                (Va(0x10), 8),
                (Va(second.as_ptr() as u64), second.len()),
            ])
            .unwrap();

        assert_eq!(results[0].as_ref().unwrap(), &first);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), &second);
    }

    #[test]
    fn regions_cover_own_heap() {
        let value = Box::new(0xfeed_u64);
        let address = Va(&*value as *const u64 as u64);

        let mut memory = ProcessMemory::new();
        memory.attach(attach_self());

        let region = memory.find_region(address).unwrap().unwrap();
        assert!(region.contains(address));
        assert_eq!(memory.read_u64(address).unwrap(), 0xfeed);
    }

    #[test]
    fn missing_process_is_denied() {
        let root = std::env::temp_dir().join(format!("tether-nomem-{}", std::process::id()));

        assert!(matches!(
            ProcfsDriver::attach_with_root(&root, ProcessId(1)),
            Err(TetherError::AccessDenied(ProcessId(1)))
        ));
    }
}
