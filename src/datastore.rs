//! The external datastore abstraction: a small write-through
//! key-value store for the handful of scalars and the per-stream metadata
//! map that aren't worth persisting inside a segment file.
//!
//! The engine only calls out to this trait; it owns the definition and
//! ships a default file-based implementation that writes each key atomically
//! (temp file in the same directory, then rename over the target).

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use tempfile::NamedTempFile;

use crate::types::StreamId;

/// Write-through persistence for the engine's small scalar metadata and the
/// per-stream address-space snapshot.
///
/// Implementations are expected to make every call durable to disk (or
/// whatever backing store they use) before returning; the engine does not
/// retry or cache on top of this trait.
pub trait MetadataStore: Send + Sync {
    fn get_starting_address(&self) -> io::Result<u64>;
    fn update_starting_address(&self, addr: u64) -> io::Result<()>;
    fn get_tail_segment(&self) -> io::Result<u64>;
    fn update_tail_segment(&self, seg: u64) -> io::Result<()>;
    fn get_committed_tail(&self) -> io::Result<Option<u64>>;
    fn update_committed_tail(&self, addr: u64) -> io::Result<()>;
    fn get_log_unit_metadata(&self) -> io::Result<HashMap<StreamId, String>>;
    fn set_log_unit_metadata(&self, map: HashMap<StreamId, String>) -> io::Result<()>;
}

const STARTING_ADDRESS_FILE: &str = "starting_address";
const TAIL_SEGMENT_FILE: &str = "tail_segment";
const COMMITTED_TAIL_FILE: &str = "committed_tail";
const STREAM_METADATA_FILE: &str = "stream_metadata";

/// The crate's default [`MetadataStore`]: each key lives in its own small
/// file under `root`, written atomically via a temp-file-then-rename.
#[derive(Debug)]
pub struct FileMetadataStore {
    root: PathBuf,
}

impl FileMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn read_u64(&self, name: &str, default: u64) -> io::Result<u64> {
        match fs::read_to_string(self.path(name)) {
            Ok(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| crate::error::invalid_data(format!("{name}: {e}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(default),
            Err(e) => Err(e),
        }
    }

    fn write_atomic(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path(name)).map_err(|e| e.error)?;
        Ok(())
    }
}

impl MetadataStore for FileMetadataStore {
    fn get_starting_address(&self) -> io::Result<u64> {
        self.read_u64(STARTING_ADDRESS_FILE, 0)
    }

    fn update_starting_address(&self, addr: u64) -> io::Result<()> {
        self.write_atomic(STARTING_ADDRESS_FILE, addr.to_string().as_bytes())
    }

    fn get_tail_segment(&self) -> io::Result<u64> {
        self.read_u64(TAIL_SEGMENT_FILE, 0)
    }

    fn update_tail_segment(&self, seg: u64) -> io::Result<()> {
        self.write_atomic(TAIL_SEGMENT_FILE, seg.to_string().as_bytes())
    }

    fn get_committed_tail(&self) -> io::Result<Option<u64>> {
        match fs::read_to_string(self.path(COMMITTED_TAIL_FILE)) {
            Ok(s) => {
                let s = s.trim();
                if s.is_empty() {
                    Ok(None)
                } else {
                    s.parse::<u64>()
                        .map(Some)
                        .map_err(|e| crate::error::invalid_data(format!("committed_tail: {e}")))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn update_committed_tail(&self, addr: u64) -> io::Result<()> {
        self.write_atomic(COMMITTED_TAIL_FILE, addr.to_string().as_bytes())
    }

    fn get_log_unit_metadata(&self) -> io::Result<HashMap<StreamId, String>> {
        let path = self.path(STREAM_METADATA_FILE);
        let mut buf = String::new();
        match fs::File::open(&path) {
            Ok(mut f) => {
                f.read_to_string(&mut buf)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        }

        let mut map = HashMap::new();
        for line in buf.lines() {
            let Some((id, value)) = line.split_once('=') else {
                continue;
            };
            let id: u128 = id.parse().map_err(|e| crate::error::invalid_data(format!("stream id: {e}")))?;
            map.insert(StreamId::new(id), value.to_string());
        }
        Ok(map)
    }

    fn set_log_unit_metadata(&self, map: HashMap<StreamId, String>) -> io::Result<()> {
        let mut buf = String::new();
        for (id, value) in &map {
            buf.push_str(&id.0.to_string());
            buf.push('=');
            buf.push_str(value);
            buf.push('\n');
        }
        self.write_atomic(STREAM_METADATA_FILE, buf.as_bytes())
    }
}

/// Base64-encode a [`crate::address_space::RangeSet`]'s byte form for storage
/// in the `get_log_unit_metadata`/`set_log_unit_metadata` string map.
pub fn encode_address_space(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_address_space(s: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

fn ensure_dir_writable(root: &Path) -> io::Result<()> {
    fs::create_dir_all(root)?;
    let probe = root.join(".write_probe");
    fs::write(&probe, b"ok")?;
    fs::remove_file(&probe)?;
    Ok(())
}

/// Create `root` (and parents) if necessary, and confirm it is writable.
pub fn ensure_log_directory(root: &Path) -> Result<(), crate::error::LogUnitError> {
    ensure_dir_writable(root).map_err(|source| crate::error::LogUnitError::NotWritable {
        path: root.display().to_string(),
        source,
    })
}

/// The `log/` subdirectory of a log unit's configurable root: where segment
/// files and the metadata snapshot both live, per the external filesystem
/// layout. `LogUnit::open` nests its segment storage here rather than in
/// `root` directly; a [`FileMetadataStore`] should be pointed at the same
/// path so its snapshot sits alongside the segments it describes.
pub fn log_directory(root: &Path) -> PathBuf {
    root.join("log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn starting_address_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileMetadataStore::new(dir.path());
        assert_eq!(store.get_starting_address().unwrap(), 0);
        store.update_starting_address(42).unwrap();
        assert_eq!(store.get_starting_address().unwrap(), 42);
    }

    #[test]
    fn committed_tail_defaults_to_none() {
        let dir = tempdir().unwrap();
        let store = FileMetadataStore::new(dir.path());
        assert_eq!(store.get_committed_tail().unwrap(), None);
        store.update_committed_tail(7).unwrap();
        assert_eq!(store.get_committed_tail().unwrap(), Some(7));
    }

    #[test]
    fn stream_metadata_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileMetadataStore::new(dir.path());
        let mut map = HashMap::new();
        map.insert(StreamId::new(1), encode_address_space(&[1, 2, 3]));
        map.insert(StreamId::new(2), encode_address_space(&[4, 5]));
        store.set_log_unit_metadata(map.clone()).unwrap();
        assert_eq!(store.get_log_unit_metadata().unwrap(), map);
    }

    #[test]
    fn log_directory_nests_under_root() {
        let root = Path::new("/var/corfu/node0");
        assert_eq!(log_directory(root), root.join("log"));
    }

    #[test]
    fn ensure_log_directory_creates_missing_dirs() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_log_directory(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
