//! Core data types shared across the log-unit engine.

use std::collections::BTreeSet;
use std::fmt;

/// A 128-bit stream identifier.
///
/// Corfu streams are identified by a UUID-sized value; the engine never
/// interprets the bits, it only uses them as a map key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct StreamId(pub u128);

impl StreamId {
    pub const fn new(id: u128) -> Self {
        Self(id)
    }

    pub fn to_le_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl From<u128> for StreamId {
    fn from(id: u128) -> Self {
        Self(id)
    }
}

/// The kind of record stored at a given address.
///
/// `Trimmed` is never written to a segment; it is only ever synthesized by
/// [`crate::engine::LogUnit::read`] for addresses below the trim mark.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    Data,
    Hole,
    Trimmed,
}

impl EntryType {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            EntryType::Data => 1,
            EntryType::Hole => 2,
            EntryType::Trimmed => unreachable!("TRIMMED is synthetic and never serialized"),
        }
    }

    pub(crate) fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EntryType::Data),
            2 => Some(EntryType::Hole),
            _ => None,
        }
    }
}

/// A single log entry, as exchanged across the engine's public API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub global_address: u64,
    pub entry_type: EntryType,
    pub stream_ids: BTreeSet<StreamId>,
    pub epoch: u64,
    pub rank: Option<u64>,
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Construct a `DATA` entry.
    pub fn data(global_address: u64, epoch: u64, stream_ids: impl IntoIterator<Item = StreamId>, payload: Vec<u8>) -> Self {
        Self {
            global_address,
            entry_type: EntryType::Data,
            stream_ids: stream_ids.into_iter().collect(),
            epoch,
            rank: None,
            payload,
        }
    }

    /// Construct a `HOLE` entry: no payload, no streams.
    pub fn hole(global_address: u64, epoch: u64) -> Self {
        Self {
            global_address,
            entry_type: EntryType::Hole,
            stream_ids: BTreeSet::new(),
            epoch,
            rank: None,
            payload: Vec::new(),
        }
    }

    /// A synthetic entry returned for addresses below the trim mark.
    ///
    /// Never persisted; constructed on the read path only.
    pub fn trimmed(global_address: u64) -> Self {
        Self {
            global_address,
            entry_type: EntryType::Trimmed,
            stream_ids: BTreeSet::new(),
            epoch: 0,
            rank: None,
            payload: Vec::new(),
        }
    }

    pub fn with_rank(mut self, rank: u64) -> Self {
        self.rank = Some(rank);
        self
    }
}

/// Why an `append` collided with an existing record at the same address.
///
/// See `crate::segment::classify_collision`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverwriteCause {
    /// The incoming bytes are identical to what's already stored.
    SameData,
    /// The incoming bytes differ from what's already stored.
    DifferentData,
    /// The address is below the trim mark.
    Trimmed,
    /// The incoming entry's rank is not greater than the stored rank.
    Rank,
    /// A `DATA` write is attempting to supersede a stored `HOLE` at the same
    /// address. Distinct from `DifferentData`: whether this is permitted is
    /// a policy decision made above the engine, not here.
    Hole,
}

impl fmt::Display for OverwriteCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverwriteCause::SameData => "SAME_DATA",
            OverwriteCause::DifferentData => "DIFFERENT_DATA",
            OverwriteCause::Trimmed => "TRIMMED",
            OverwriteCause::Rank => "RANK",
            OverwriteCause::Hole => "HOLE",
        };
        f.write_str(s)
    }
}

/// `NON_ADDRESS`: no address has ever been written.
///
/// `u64` has no natural sentinel for "nothing written yet", so this is
/// modeled as `Option<u64>` throughout; this constant exists only for call
/// sites that need to talk about the sentinel as a value (e.g. log messages).
pub const NON_ADDRESS: Option<u64> = None;
