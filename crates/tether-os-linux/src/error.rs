use tether_core::{ProcessId, TetherError};

/// Error types for Linux operations.
#[derive(thiserror::Error, Debug)]
pub enum LinuxError {
    /// An I/O error occurred while reading `/proc`.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A line of a `maps` table could not be parsed.
    #[error("Malformed maps entry on line {line}: {reason}")]
    MalformedMaps {
        /// One-based line number.
        line: usize,

        /// What was wrong with the line.
        reason: &'static str,
    },

    /// The `stat` file of a process could not be parsed.
    #[error("Malformed stat for process {0}")]
    MalformedStat(ProcessId),
}

impl From<LinuxError> for TetherError {
    fn from(value: LinuxError) -> Self {
        match value {
            LinuxError::Io(err) => TetherError::Io(err),
            other => TetherError::Os(other.into()),
        }
    }
}
