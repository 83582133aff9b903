//! A single segment file: `records_per_segment` addresses' worth of
//! length-prefixed, checksummed records, indexed by an in-memory map
//! rebuilt by a forward scan whenever the segment is opened.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::LogUnitError;
use crate::record::{self, FrameError};
use crate::types::{EntryType, LogEntry, OverwriteCause};

pub const MAGIC: [u8; 2] = [0xF1, 0xC0];
pub const DEFAULT_FORMAT_VERSION: u16 = 1;

const SEGMENT_FILE_EXT: &str = ".log";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub format_version: u16,
    pub segment_id: u64,
}

impl Header {
    pub const LEN: usize = 2 /* magic */ + 2 /* version */ + 8 /* segment id */;

    fn write<W: Write>(&self, mut out: W) -> io::Result<()> {
        out.write_all(&MAGIC)?;
        out.write_all(&self.format_version.to_le_bytes())?;
        out.write_all(&self.segment_id.to_le_bytes())?;
        Ok(())
    }

    fn decode<R: Read>(mut r: R) -> io::Result<Self> {
        let mut buf = [0u8; Self::LEN];
        r.read_exact(&mut buf)?;
        if buf[0..2] != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "segment header: bad magic"));
        }
        let format_version = u16::from_le_bytes(buf[2..4].try_into().unwrap());
        let segment_id = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        Ok(Self {
            format_version,
            segment_id,
        })
    }
}

/// Outcome of [`SegmentFile::append`]: either the record was written (with
/// the byte size, for quota accounting), or it collided with an existing
/// record at the same address.
#[derive(Debug)]
pub enum AppendOutcome {
    Written(u64),
    Collision(OverwriteCause),
}

/// The path a segment with id `segment_id` lives at, inside `root`.
pub fn segment_path(root: &Path, segment_id: u64) -> PathBuf {
    root.join(format!("{segment_id}{SEGMENT_FILE_EXT}"))
}

/// Parse a segment id back out of a filename, as listed by `read_dir`.
///
/// Parsing failures on other files cause them to be ignored.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    name.strip_suffix(SEGMENT_FILE_EXT)?.parse::<u64>().ok()
}

/// A single open segment: its file handle, header, and address index.
pub struct SegmentFile {
    pub id: u64,
    file: File,
    header: Header,
    /// address -> byte offset of the record's length prefix within the file
    index: BTreeMap<u64, u64>,
    bytes_written: u64,
    dirty: bool,
    /// Set if the most recent open/recovery scan stopped early due to a
    /// corrupt or torn record. Surfaced for observability only.
    pub recovery_watermark: Option<u64>,
}

impl SegmentFile {
    /// Open an existing segment, or create a new, empty one, at `root` for
    /// `segment_id`. Rebuilds the address index by scanning the file.
    pub fn open_or_create(root: &Path, segment_id: u64, max_format_version: u16) -> Result<Self, LogUnitError> {
        let path = segment_path(root, segment_id);
        let existed = path.exists();

        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        if !existed {
            let header = Header {
                format_version: DEFAULT_FORMAT_VERSION,
                segment_id,
            };
            header.write(&mut file)?;
            file.sync_all()?;
            return Ok(Self {
                id: segment_id,
                file,
                header,
                index: BTreeMap::new(),
                bytes_written: Header::LEN as u64,
                dirty: false,
                recovery_watermark: None,
            });
        }

        file.seek(SeekFrom::Start(0))?;
        let header = Header::decode(&mut file).map_err(|_| LogUnitError::InvalidHeader { segment_id })?;
        if header.format_version > max_format_version {
            return Err(LogUnitError::IncompatibleVersion {
                segment_id,
                found: header.format_version,
                max: max_format_version,
            });
        }

        let mut index = BTreeMap::new();
        let mut offset = Header::LEN as u64;
        let mut recovery_watermark = None;
        loop {
            file.seek(SeekFrom::Start(offset))?;
            match record::decode_record(&mut file) {
                Ok(raw) => {
                    index.insert(raw.entry.global_address, offset);
                    offset += raw.encoded_len;
                }
                Err(FrameError::Eof) => break,
                Err(e) => {
                    warn!("segment {segment_id}: stopping scan at offset {offset}: {e:?}");
                    recovery_watermark = Some(offset);
                    break;
                }
            }
        }
        debug!("segment {segment_id}: recovered {} addresses", index.len());

        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            id: segment_id,
            file,
            header,
            index,
            bytes_written: offset,
            dirty: false,
            recovery_watermark,
        })
    }

    pub fn format_version(&self) -> u16 {
        self.header.format_version
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.index.contains_key(&addr)
    }

    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.index.keys().copied()
    }

    pub fn len_bytes(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// If `entry.global_address` is already present in this segment, read
    /// the existing record back and classify the collision cause, without
    /// writing anything. `Ok(None)` means the address is free.
    ///
    /// Exposed separately from [`append`](Self::append) so a caller writing
    /// a batch of entries can validate every address in the batch against
    /// this segment's index up front, before committing any of them.
    pub fn check_collision(&mut self, entry: &LogEntry) -> io::Result<Option<OverwriteCause>> {
        match self.index.get(&entry.global_address) {
            Some(&offset) => {
                let existing = self.read_at(offset)?;
                Ok(Some(classify_collision(entry, &existing)))
            }
            None => Ok(None),
        }
    }

    /// Append `entry` if its address is not already present; otherwise
    /// classify and return the collision cause without writing anything.
    pub fn append(&mut self, entry: &LogEntry) -> io::Result<AppendOutcome> {
        if let Some(cause) = self.check_collision(entry)? {
            return Ok(AppendOutcome::Collision(cause));
        }

        let block = record::encode_record(entry);
        let offset = self.bytes_written;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&block)?;

        self.index.insert(entry.global_address, offset);
        self.bytes_written += block.len() as u64;
        self.dirty = true;

        Ok(AppendOutcome::Written(block.len() as u64))
    }

    /// Read back the entry stored at `addr`, assuming it is known to be in
    /// this segment's index.
    pub fn read(&mut self, addr: u64) -> io::Result<Option<LogEntry>> {
        match self.index.get(&addr) {
            Some(&offset) => Ok(Some(self.read_at(offset)?)),
            None => Ok(None),
        }
    }

    fn read_at(&mut self, offset: u64) -> io::Result<LogEntry> {
        self.file.seek(SeekFrom::Start(offset))?;
        let raw = record::decode_record(&mut self.file)
            .map_err(|e| crate::error::invalid_data(format!("corrupt record at offset {offset}: {e:?}")))?;
        Ok(raw.entry)
    }

    /// Drop every record whose address is `>= from`, truncating the
    /// underlying file back to the offset the first such record started at.
    ///
    /// Used by `reset`'s segment-boundary handling; see the caller for the
    /// data-loss edge case this preserves.
    pub fn truncate_from(&mut self, from: u64) -> io::Result<()> {
        let cut = self.index.range(from..).next().map(|(_, &off)| off);
        if let Some(offset) = cut {
            self.file.set_len(offset)?;
            self.bytes_written = offset;
            self.index.retain(|addr, _| *addr < from);
            self.dirty = true;
        }
        Ok(())
    }

    pub fn fsync(&mut self) -> io::Result<()> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }
}

fn classify_collision(incoming: &LogEntry, existing: &LogEntry) -> OverwriteCause {
    if let (Some(ir), Some(er)) = (incoming.rank, existing.rank) {
        if ir <= er {
            return OverwriteCause::Rank;
        }
    }
    if existing.entry_type == EntryType::Hole && incoming.entry_type == EntryType::Data {
        return OverwriteCause::Hole;
    }
    if incoming == existing {
        OverwriteCause::SameData
    } else {
        OverwriteCause::DifferentData
    }
}
