use std::num::NonZeroU64;

mod address_space;
pub mod datastore;
pub mod engine;
pub mod error;
mod metadata;
mod quota;
mod record;
mod recovery;
mod segment;
mod segment_map;
pub mod types;

pub use crate::datastore::{FileMetadataStore, MetadataStore};
pub use crate::engine::LogUnit;
pub use crate::types::{EntryType, LogEntry, OverwriteCause, StreamId, NON_ADDRESS};

/// [`LogUnit`] options.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Number of addresses per segment file.
    ///
    /// Default: 10,000.
    pub records_per_segment: NonZeroU64,
    /// The maximum segment file format version this engine will open.
    ///
    /// A segment whose header advertises a higher version fails to open with
    /// [`error::LogUnitError::IncompatibleVersion`].
    ///
    /// Default: [`segment::DEFAULT_FORMAT_VERSION`].
    pub max_log_format_version: u16,
    /// Total bytes the log may occupy on disk before `append` starts failing
    /// with `QUOTA_EXCEEDED`.
    ///
    /// Default: 16GiB.
    pub quota_bytes: u64,
    /// Persist the metadata snapshot after this many successful appends.
    ///
    /// The embedding server may also call `close`/`sync` to force a snapshot
    /// outside this cadence. Default: 10,000.
    pub snapshot_every_n_appends: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            records_per_segment: NonZeroU64::new(10_000).unwrap(),
            max_log_format_version: segment::DEFAULT_FORMAT_VERSION,
            quota_bytes: 16 * 1024 * 1024 * 1024,
            snapshot_every_n_appends: 10_000,
        }
    }
}
