//! Error taxonomy for the log-unit engine.
//!
//! Expected signals get their own variant carrying the data needed to
//! diagnose them; fatal I/O failures are threaded through so the underlying
//! `io::Error` is never discarded. `AppendError` additionally classifies an
//! `ENOSPC` I/O failure as `OutOfSpace` rather than the generic `Io`.

use std::io;

use thiserror::Error;

use crate::types::OverwriteCause;

/// Error returned by [`crate::engine::LogUnit::append`] and friends.
#[derive(Debug, Error)]
pub enum AppendError {
    #[error("write-once violation at address {address}: {cause}")]
    Overwrite { address: u64, cause: OverwriteCause },
    #[error("address {address} is below the trim mark")]
    Trimmed { address: u64 },
    #[error("log quota exceeded")]
    QuotaExceeded,
    #[error("no space left on device")]
    OutOfSpace,
    #[error("{0}")]
    IllegalArgument(String),
    #[error(transparent)]
    Io(io::Error),
}

impl AppendError {
    /// `true` iff this is an [`OverwriteCause::Rank`] collision, i.e. the
    /// write lost to a higher rank already stored at the same address.
    pub fn is_data_outranked(&self) -> bool {
        matches!(
            self,
            AppendError::Overwrite {
                cause: OverwriteCause::Rank,
                ..
            }
        )
    }
}

impl From<io::Error> for AppendError {
    fn from(e: io::Error) -> Self {
        if e.raw_os_error() == Some(libc_enospc()) {
            AppendError::OutOfSpace
        } else {
            AppendError::Io(e)
        }
    }
}

/// `ENOSPC`, hardcoded rather than pulled in via a `libc` dependency for one
/// constant. Stable across the platforms this engine targets.
const fn libc_enospc() -> i32 {
    28
}

/// Error returned by [`crate::engine::LogUnit::read`].
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("checksum mismatch or malformed record at address {address}")]
    DataCorruption { address: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Fatal failure constructing or recovering a [`crate::engine::LogUnit`].
#[derive(Debug, Error)]
pub enum LogUnitError {
    #[error("log directory {path} is not writable: {source}")]
    NotWritable { path: String, source: io::Error },
    #[error("segment {segment_id} has an incompatible format version {found} (max supported {max})")]
    IncompatibleVersion { segment_id: u64, found: u16, max: u16 },
    #[error("segment {segment_id} header is invalid")]
    InvalidHeader { segment_id: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A checksum mismatch was detected.
///
/// Usually wrapped in another error, such as [`io::Error`] or [`ReadError`].
#[derive(Debug, Error)]
#[error("checksum mismatch")]
pub struct ChecksumMismatch;

pub(crate) fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enospc_is_classified_as_out_of_space() {
        let e = io::Error::from_raw_os_error(28);
        assert!(matches!(AppendError::from(e), AppendError::OutOfSpace));
    }

    #[test]
    fn other_io_errors_pass_through() {
        let e = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(AppendError::from(e), AppendError::Io(_)));
    }

    #[test]
    fn is_data_outranked_only_matches_rank_cause() {
        let outranked = AppendError::Overwrite {
            address: 1,
            cause: OverwriteCause::Rank,
        };
        let different = AppendError::Overwrite {
            address: 1,
            cause: OverwriteCause::DifferentData,
        };
        assert!(outranked.is_data_outranked());
        assert!(!different.is_data_outranked());
    }
}
