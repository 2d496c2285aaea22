use crate::{MemoryRegion, ProcessId, TetherError, Va};

/// A trait for implementing a memory transport to a target process.
///
/// A driver owns exactly one handle to one process. Dropping the driver
/// closes the handle.
pub trait MemoryDriver {
    /// Returns the identifier of the attached process.
    fn process_id(&self) -> ProcessId;

    /// Checks whether the driver may write to the process.
    fn is_writable(&self) -> bool;

    /// Reads exactly `buffer.len()` bytes at `address`.
    ///
    /// A short read is an error.
    fn read(&self, address: Va, buffer: &mut [u8]) -> Result<(), TetherError>;

    /// Writes all of `content` at `address`.
    ///
    /// A short write is an error.
    fn write(&self, address: Va, content: &[u8]) -> Result<(), TetherError>;

    /// Reads several ranges in one transfer.
    ///
    /// Returns the total number of bytes transferred. A result smaller than
    /// the sum of the buffer lengths means that some entries were not
    /// filled.
    fn read_vectored(&self, requests: &mut [(Va, &mut [u8])]) -> Result<usize, TetherError> {
        let mut transferred = 0;
        for (address, buffer) in requests.iter_mut() {
            if self.read(*address, buffer).is_err() {
                break;
            }
            transferred += buffer.len();
        }
        Ok(transferred)
    }

    /// Writes several ranges in one transfer.
    ///
    /// Returns the total number of bytes transferred.
    fn write_vectored(&self, requests: &[(Va, &[u8])]) -> Result<usize, TetherError> {
        let mut transferred = 0;
        for (address, content) in requests {
            if self.write(*address, content).is_err() {
                break;
            }
            transferred += content.len();
        }
        Ok(transferred)
    }

    /// Enumerates the memory regions of the process, in address order.
    fn regions(&self) -> Result<Vec<MemoryRegion>, TetherError>;
}
