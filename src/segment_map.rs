//! Concurrent map of open segments, keyed by segment id.
//!
//! Holds a pool of concurrently-accessible segments rather than a single
//! append-only writer, since reads and writes can land on any segment, not
//! just the head.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::LogUnitError;
use crate::segment::{self, SegmentFile};

/// A segment file together with an outstanding-reference count.
///
/// The count lets [`close`](SegmentMap::close) and `reset`/`compact` wait
/// until no caller is mid-operation on a segment before tearing it down.
pub struct SegmentHandle {
    pub file: Mutex<SegmentFile>,
    refs: AtomicUsize,
}

impl SegmentHandle {
    fn new(file: SegmentFile) -> Self {
        Self {
            file: Mutex::new(file),
            refs: AtomicUsize::new(0),
        }
    }

    fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

/// A retained [`SegmentHandle`] that releases its reference on drop.
pub struct SegmentRef(Arc<SegmentHandle>);

impl std::ops::Deref for SegmentRef {
    type Target = SegmentHandle;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for SegmentRef {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// The set of segment files backing a log unit, opened on demand and kept
/// around for reuse.
pub struct SegmentMap {
    root: PathBuf,
    max_format_version: u16,
    open: RwLock<HashMap<u64, Arc<SegmentHandle>>>,
}

impl SegmentMap {
    pub fn new(root: impl Into<PathBuf>, max_format_version: u16) -> Self {
        Self {
            root: root.into(),
            max_format_version,
            open: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List every segment id already present on disk, ascending.
    ///
    /// Filenames that don't parse as `<id>.log` are ignored.
    pub fn existing_segment_ids(&self) -> std::io::Result<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = segment::parse_segment_filename(&name.to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Get a retained handle to `segment_id`, opening (or creating) it first
    /// if it isn't already resident.
    pub fn get_or_open(&self, segment_id: u64) -> Result<SegmentRef, LogUnitError> {
        if let Some(handle) = self.open.read().get(&segment_id) {
            handle.retain();
            return Ok(SegmentRef(handle.clone()));
        }

        let mut open = self.open.write();
        // Someone may have raced us between the read-lock miss and taking
        // the write lock.
        if let Some(handle) = open.get(&segment_id) {
            handle.retain();
            return Ok(SegmentRef(handle.clone()));
        }
        let file = SegmentFile::open_or_create(&self.root, segment_id, self.max_format_version)?;
        let handle = Arc::new(SegmentHandle::new(file));
        open.insert(segment_id, handle.clone());
        handle.retain();
        Ok(SegmentRef(handle))
    }

    /// Drop every open segment handle from the map without touching disk.
    ///
    /// Callers must ensure no [`SegmentRef`] is outstanding; `reset` and
    /// `compact` hold the engine's write lock while calling this.
    pub fn evict_all(&self) {
        self.open.write().clear();
    }

    pub fn evict(&self, segment_id: u64) {
        self.open.write().remove(&segment_id);
    }

    pub fn is_open(&self, segment_id: u64) -> bool {
        self.open.read().contains_key(&segment_id)
    }
}
