use tether_core::{ProcessId, TetherError, Va};

/// Error type for the procfs driver.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The process memory could not be opened, not even read-only.
    #[error("Cannot open memory of process {pid}: {source}")]
    AccessDenied {
        /// The process ID.
        pid: ProcessId,

        /// The error of the read-only attempt.
        source: std::io::Error,
    },

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The maps table could not be read.
    #[error(transparent)]
    Linux(#[from] tether_os_linux::LinuxError),

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
}

impl From<Error> for TetherError {
    fn from(value: Error) -> Self {
        match value {
            Error::AccessDenied { pid, .. } => Self::AccessDenied(pid),
            Error::Io(error) => Self::Io(error),
            Error::Linux(error) => error.into(),
            Error::Transfer {
                address,
                expected,
                transferred,
            } => Self::transfer(address, expected, transferred),
        }
    }
}
