use crate::{PatternError, ProcessId, Va};

/// An error that can occur when working with a target process.
#[derive(thiserror::Error, Debug)]
pub enum TetherError {
    /// An error occurred in the memory driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// An OS-specific error occurred.
    #[error(transparent)]
    Os(Box<dyn std::error::Error + Send + Sync>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The process could not be opened, not even read-only.
    #[error("Access denied to process {0}")]
    AccessDenied(ProcessId),

    /// No process is attached.
    #[error("No process attached")]
    NotAttached,

    /// The process handle was invalidated.
    #[error("Process handle was invalidated")]
    HandleInvalidated,

    /// Nothing could be read at the given address.
    #[error("Nothing readable at {0}")]
    NotFound(Va),

    /// A transfer moved fewer bytes than requested.
    #[error("Short transfer at {address} ({transferred} of {expected} bytes)")]
    Transfer {
        /// Address of the transfer.
        address: Va,

        /// Number of bytes requested.
        expected: usize,

        /// Number of bytes actually moved.
        transferred: usize,
    },

    /// An intermediate pointer of a pointer chain could not be dereferenced.
    #[error("Null dereference at {address} (offset #{index})")]
    NullDeref {
        /// Address that failed to dereference.
        address: Va,

        /// Index of the offset being applied.
        index: usize,
    },

    /// The byte pattern is malformed.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

impl TetherError {
    /// Creates a new short transfer error.
    pub fn transfer(address: Va, expected: usize, transferred: usize) -> Self {
        Self::Transfer {
            address,
            expected,
            transferred,
        }
    }
}
