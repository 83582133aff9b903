//! On-disk framing for a single log record.
//!
//! A fixed header, a checksum computed with `crc32c` over everything
//! preceding the checksum field itself, and a `decode` that distinguishes
//! "clean EOF" from "this data is corrupt/truncated" so callers can tell a
//! torn write from the normal end of a segment.

use std::collections::BTreeSet;
use std::io::{self, Read};

use crate::error::ChecksumMismatch;
use crate::types::{EntryType, LogEntry, StreamId};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct Flags: u8 {
        const HAS_RANK = 0b0000_0001;
    }
}

/// Smallest possible encoded record: address(8) + type(1) + flags(1) +
/// epoch(8) + stream_count(2) + payload_len(4) + checksum(4).
const MIN_RECORD_LEN: u32 = 8 + 1 + 1 + 8 + 2 + 4 + 4;

/// A record as read back from a segment, together with its checksum and the
/// total number of bytes it occupies on disk (length prefix through
/// checksum, inclusive).
#[derive(Debug)]
pub struct RawRecord {
    pub entry: LogEntry,
    pub checksum: u32,
    pub encoded_len: u64,
}

/// Why [`decode_record`] could not produce a [`RawRecord`].
#[derive(Debug)]
pub enum FrameError {
    /// The reader was exactly at EOF before any bytes of a new record were
    /// read. Not an error condition: it's the normal end of a segment.
    Eof,
    /// A length prefix was read, but the following bytes were short, or the
    /// length prefix itself is too small to be a valid record. Indicates a
    /// torn write.
    Truncated,
    /// The record's checksum did not match its contents.
    Checksum(ChecksumMismatch),
    /// The record's internal framing (counts, lengths) is inconsistent.
    Malformed(&'static str),
}

impl From<FrameError> for io::Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Eof => io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
            FrameError::Truncated => io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record"),
            FrameError::Checksum(c) => crate::error::invalid_data(c),
            FrameError::Malformed(msg) => crate::error::invalid_data(msg),
        }
    }
}

/// Encode `entry` as a complete on-disk record block: length prefix,
/// fields, and trailing checksum.
pub fn encode_record(entry: &LogEntry) -> Vec<u8> {
    assert_ne!(entry.entry_type, EntryType::Trimmed, "TRIMMED is never persisted");

    let mut mid = Vec::with_capacity(32 + entry.stream_ids.len() * 16 + entry.payload.len());
    mid.extend_from_slice(&entry.global_address.to_le_bytes());
    mid.push(entry.entry_type.to_wire());

    let flags = if entry.rank.is_some() { Flags::HAS_RANK } else { Flags::empty() };
    mid.push(flags.bits());

    mid.extend_from_slice(&entry.epoch.to_le_bytes());
    if let Some(rank) = entry.rank {
        mid.extend_from_slice(&rank.to_le_bytes());
    }

    mid.extend_from_slice(&(entry.stream_ids.len() as u16).to_le_bytes());
    for sid in &entry.stream_ids {
        mid.extend_from_slice(&sid.to_le_bytes());
    }

    mid.extend_from_slice(&(entry.payload.len() as u32).to_le_bytes());
    mid.extend_from_slice(&entry.payload);

    // `record_length` counts everything after itself, i.e. `mid` plus the
    // trailing 4-byte checksum.
    let record_length = (mid.len() + 4) as u32;

    let mut block = Vec::with_capacity(4 + mid.len() + 4);
    block.extend_from_slice(&record_length.to_le_bytes());
    block.extend_from_slice(&mid);

    let checksum = crc32c::crc32c(&block);
    block.extend_from_slice(&checksum.to_le_bytes());
    block
}

/// Attempt to decode one record from `reader`.
///
/// Returns [`FrameError::Eof`] if the reader was already at the clean end of
/// the segment (no bytes could be read for the length prefix, or the prefix
/// is all-zero, which is how preallocated-but-unwritten tail bytes read).
pub fn decode_record<R: Read>(mut reader: R) -> Result<RawRecord, FrameError> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(FrameError::Eof);
        }
        return Err(FrameError::Truncated);
    }
    if len_buf == [0, 0, 0, 0] {
        return Err(FrameError::Eof);
    }
    let record_length = u32::from_le_bytes(len_buf);
    if record_length < MIN_RECORD_LEN {
        return Err(FrameError::Truncated);
    }

    let mut rest = vec![0u8; record_length as usize];
    if reader.read_exact(&mut rest).is_err() {
        return Err(FrameError::Truncated);
    }

    let (mid, checksum_bytes) = rest.split_at(rest.len() - 4);
    let checksum = u32::from_le_bytes(checksum_bytes.try_into().unwrap());

    let mut block = Vec::with_capacity(4 + mid.len());
    block.extend_from_slice(&len_buf);
    block.extend_from_slice(mid);
    let computed = crc32c::crc32c(&block);
    if computed != checksum {
        return Err(FrameError::Checksum(ChecksumMismatch));
    }

    let mut cur = mid;
    let entry = parse_mid(&mut cur).map_err(FrameError::Malformed)?;

    Ok(RawRecord {
        entry,
        checksum,
        encoded_len: 4u64 + record_length as u64,
    })
}

fn parse_mid(cur: &mut &[u8]) -> Result<LogEntry, &'static str> {
    let global_address = take_u64(cur)?;
    let type_tag = take_u8(cur)?;
    let entry_type = EntryType::from_wire(type_tag).ok_or("unknown entry type tag")?;
    let flags = Flags::from_bits(take_u8(cur)?).ok_or("unknown flag bits")?;
    let epoch = take_u64(cur)?;
    let rank = if flags.contains(Flags::HAS_RANK) {
        Some(take_u64(cur)?)
    } else {
        None
    };

    let stream_id_count = take_u16(cur)?;
    let mut stream_ids = BTreeSet::new();
    for _ in 0..stream_id_count {
        stream_ids.insert(StreamId::from_le_bytes(take_array(cur)?));
    }

    let payload_length = take_u32(cur)? as usize;
    if cur.len() != payload_length {
        return Err("payload length does not match remaining record bytes");
    }
    let payload = cur.to_vec();

    Ok(LogEntry {
        global_address,
        entry_type,
        stream_ids,
        epoch,
        rank,
        payload,
    })
}

fn take_u8(cur: &mut &[u8]) -> Result<u8, &'static str> {
    let (b, rest) = cur.split_first().ok_or("truncated record body")?;
    *cur = rest;
    Ok(*b)
}

fn take_u16(cur: &mut &[u8]) -> Result<u16, &'static str> {
    Ok(u16::from_le_bytes(take_array(cur)?))
}

fn take_u32(cur: &mut &[u8]) -> Result<u32, &'static str> {
    Ok(u32::from_le_bytes(take_array(cur)?))
}

fn take_u64(cur: &mut &[u8]) -> Result<u64, &'static str> {
    Ok(u64::from_le_bytes(take_array(cur)?))
}

fn take_array<const N: usize>(cur: &mut &[u8]) -> Result<[u8; N], &'static str> {
    if cur.len() < N {
        return Err("truncated record body");
    }
    let (head, rest) = cur.split_at(N);
    *cur = rest;
    Ok(head.try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_entry(address: u64, rank: Option<u64>, streams: &[u128], payload: Vec<u8>) -> LogEntry {
        let mut e = LogEntry::data(address, 7, streams.iter().copied().map(StreamId::from), payload);
        if let Some(r) = rank {
            e = e.with_rank(r);
        }
        e
    }

    #[test]
    fn roundtrip_data_entry() {
        let entry = sample_entry(42, None, &[1, 2, 3], b"hello".to_vec());
        let buf = encode_record(&entry);
        let decoded = decode_record(&mut &buf[..]).unwrap();
        assert_eq!(decoded.entry, entry);
        assert_eq!(decoded.encoded_len, buf.len() as u64);
    }

    #[test]
    fn roundtrip_with_rank() {
        let entry = sample_entry(9, Some(11), &[], b"x".to_vec());
        let buf = encode_record(&entry);
        let decoded = decode_record(&mut &buf[..]).unwrap();
        assert_eq!(decoded.entry.rank, Some(11));
    }

    #[test]
    fn roundtrip_hole() {
        let entry = LogEntry::hole(3, 0);
        let buf = encode_record(&entry);
        let decoded = decode_record(&mut &buf[..]).unwrap();
        assert_eq!(decoded.entry, entry);
    }

    #[test]
    fn eof_on_empty_reader() {
        let buf: Vec<u8> = vec![];
        assert!(matches!(decode_record(&mut &buf[..]), Err(FrameError::Eof)));
    }

    #[test]
    fn eof_on_zeroed_prefix() {
        // Preallocated, unwritten tail of a segment.
        let buf = vec![0u8; 128];
        assert!(matches!(decode_record(&mut &buf[..]), Err(FrameError::Eof)));
    }

    #[test]
    fn truncated_record_detected() {
        let entry = sample_entry(1, None, &[5], b"payload".to_vec());
        let mut buf = encode_record(&entry);
        buf.truncate(buf.len() - 3);
        assert!(matches!(decode_record(&mut &buf[..]), Err(FrameError::Truncated)));
    }

    proptest! {
        #[test]
        fn bitflip_detected(pos in 4usize..40, mask in any::<u8>().prop_filter("nonzero", |m| *m != 0)) {
            let entry = sample_entry(100, None, &[42, 43], vec![1; 64]);
            let mut buf = encode_record(&entry);
            let idx = pos.min(buf.len() - 1);
            buf[idx] ^= mask;
            match decode_record(&mut &buf[..]) {
                Err(FrameError::Checksum(_)) | Err(FrameError::Truncated) | Err(FrameError::Malformed(_)) => {}
                Ok(decoded) => prop_assert_eq!(&decoded.entry, &entry, "bitflip silently accepted"),
                Err(FrameError::Eof) => prop_assert!(false, "bitflip should not look like eof"),
            }
        }
    }
}
