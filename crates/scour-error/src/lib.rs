#![forbid(unsafe_code)]
//! Error types for Scour.
//!
//! Defines `ScrubError` and a `Result<T>` alias used throughout the
//! workspace, plus the errno mapping the CLI exit surface relies on.

use thiserror::Error;

/// Unified error type for all scrub operations.
#[derive(Debug, Error)]
pub enum ScrubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device {0} not found")]
    NoDevice(u64),

    #[error("scrub or replace already in progress on device {0}")]
    InProgress(u64),

    #[error("corrupt metadata at logical {logical}: {detail}")]
    Corruption { logical: u64, detail: String },

    #[error("uncorrectable error at logical {0}")]
    Uncorrectable(u64),

    #[error("allocation budget exhausted: {0}")]
    AllocFailed(String),

    #[error("raid mapping failed for logical {logical}: {detail}")]
    MapFailed { logical: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),
}

impl ScrubError {
    /// Convert this error into a POSIX errno for process exit codes.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Cancelled => libc::ECANCELED,
            Self::InvalidArgument(_) | Self::Format(_) => libc::EINVAL,
            Self::NoDevice(_) => libc::ENODEV,
            Self::InProgress(_) => libc::EINPROGRESS,
            Self::Corruption { .. } | Self::Uncorrectable(_) | Self::MapFailed { .. } => libc::EIO,
            Self::AllocFailed(_) => libc::ENOMEM,
        }
    }
}

impl From<scour_types::ParseError> for ScrubError {
    fn from(err: scour_types::ParseError) -> Self {
        Self::Format(err.to_string())
    }
}

/// Result alias using `ScrubError`.
pub type Result<T> = std::result::Result<T, ScrubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_exit_contract() {
        assert_eq!(ScrubError::Cancelled.to_errno(), libc::ECANCELED);
        assert_eq!(ScrubError::Uncorrectable(0).to_errno(), libc::EIO);
        assert_eq!(
            ScrubError::AllocFailed("recheck blocks".into()).to_errno(),
            libc::ENOMEM
        );
        assert_eq!(
            ScrubError::InvalidArgument("nodesize".into()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(ScrubError::NoDevice(7).to_errno(), libc::ENODEV);
        assert_eq!(ScrubError::InProgress(7).to_errno(), libc::EINPROGRESS);
    }

    #[test]
    fn parse_error_converts_to_format() {
        let parse = scour_types::ParseError::InvalidField {
            field: "nodesize",
            reason: "too big",
        };
        let err: ScrubError = parse.into();
        assert_eq!(err.to_errno(), libc::EINVAL);
    }
}
