//! Error types and handling for the deltadisk engine
//!
//! A single flat taxonomy is presented upward; helpers classify variants
//! into caller errors (reported synchronously, no state change), transient
//! errors (retry after yielding), resource errors, and fatal data errors.

use std::io;

use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the deltadisk engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Request offset or length is not sector-granular
    #[error("invalid alignment: {0}")]
    InvalidAlignment(String),

    /// Request extends beyond the virtual disk
    #[error("out of range: {offset_sectors}+{sectors} exceeds {virtual_sectors} sectors")]
    OutOfRange {
        /// Requested start, in sectors
        offset_sectors: u64,
        /// Requested length, in sectors
        sectors: u64,
        /// Current virtual size, in sectors
        virtual_sectors: u64,
    },

    /// The top delta cannot allocate another cluster
    #[error("out of space in the top delta")]
    OutOfSpace,

    /// The metadata pipeline is too far behind; retry after yielding
    #[error("metadata pipeline backpressure")]
    MetadataBackpressure,

    /// A backing file operation failed
    #[error("backing I/O error ({kind:?}): {message}")]
    BackingIo {
        /// The underlying I/O error kind
        kind: io::ErrorKind,
        /// Human-readable detail
        message: String,
    },

    /// Another control operation is mutating the delta stack
    #[error("delta stack is busy")]
    StackBusy,

    /// Header magic, CRC, or geometry validation failed
    #[error("corrupt delta header: {0}")]
    CorruptHeader(String),

    /// The image was written by an incompatible format version
    #[error("unsupported image version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// Version found in the header
        found: u32,
        /// Highest version this engine reads
        supported: u32,
    },

    /// A delta's cluster size does not match the stack's
    #[error("incompatible cluster size: stack shift {stack_shift}, delta shift {delta_shift}")]
    IncompatibleClusterSize {
        /// The stack's cluster shift
        stack_shift: u32,
        /// The offending delta's cluster shift
        delta_shift: u32,
    },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// A control operation was invoked with invalid arguments
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine has been closed
    #[error("engine is closed")]
    Closed,

    /// The request was cancelled while still queued
    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-alignment error
    pub fn invalid_alignment(msg: impl Into<String>) -> Self {
        Self::InvalidAlignment(msg.into())
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Caller errors: reported synchronously, no state was changed
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidAlignment(_)
                | Error::OutOfRange { .. }
                | Error::UnsupportedVersion { .. }
                | Error::IncompatibleClusterSize { .. }
                | Error::InvalidArgument(_)
                | Error::Config(_)
        )
    }

    /// Transient errors: the caller should retry after yielding
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::MetadataBackpressure | Error::StackBusy)
    }

    /// Fatal data errors: the affected delta may have been taken offline
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::BackingIo { .. } | Error::CorruptHeader(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::StorageFull {
            Error::OutOfSpace
        } else {
            Error::BackingIo {
                kind: e.kind(),
                message: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::invalid_alignment("odd length").is_caller_error());
        assert!(Error::MetadataBackpressure.is_retryable());
        assert!(Error::StackBusy.is_retryable());
        assert!(Error::CorruptHeader("bad crc".into()).is_fatal());
        assert!(!Error::OutOfSpace.is_retryable());
        assert!(!Error::OutOfSpace.is_caller_error());
    }

    #[test]
    fn test_io_conversion() {
        let e: Error = io::Error::new(io::ErrorKind::StorageFull, "disk full").into();
        assert_eq!(e, Error::OutOfSpace);

        let e: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "short read").into();
        assert!(matches!(
            e,
            Error::BackingIo {
                kind: io::ErrorKind::UnexpectedEof,
                ..
            }
        ));
    }
}
