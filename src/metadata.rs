//! In-memory metadata index: tails, per-stream address spaces, trim mark.
//!
//! A single `parking_lot::Mutex` guards the whole struct rather than
//! fine-grained per-stream locks — see `DESIGN.md` for why this is an
//! explicit, documented simplification rather than an oversight.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::address_space::RangeSet;
use crate::datastore::MetadataStore;
use crate::types::StreamId;

#[derive(Debug, Default)]
pub struct LogMetadataInner {
    pub global_tail: Option<u64>,
    pub stream_tails: HashMap<StreamId, u64>,
    pub stream_address_space: HashMap<StreamId, RangeSet>,
    pub committed_tail: Option<u64>,
    pub starting_address: u64,
    pub tail_segment: u64,
}

impl LogMetadataInner {
    /// Record a successful append of `address` on behalf of `stream_ids`.
    pub fn record_append(&mut self, address: u64, stream_ids: impl IntoIterator<Item = StreamId>) {
        self.global_tail = Some(self.global_tail.map_or(address, |t| t.max(address)));
        for sid in stream_ids {
            self.stream_tails
                .entry(sid)
                .and_modify(|t| *t = (*t).max(address))
                .or_insert(address);
            self.stream_address_space.entry(sid).or_default().add(address);
        }
    }

    /// `sync_tail_segment(addr, force)`: advance `tail_segment` to cover
    /// `addr`'s segment; `force` permits regression, used by `reset`.
    pub fn sync_tail_segment(&mut self, addr: Option<u64>, records_per_segment: u64, force: bool) {
        let Some(addr) = addr else {
            if force {
                self.tail_segment = 0;
            }
            return;
        };
        let seg = addr / records_per_segment;
        if force {
            self.tail_segment = seg;
        } else {
            self.tail_segment = self.tail_segment.max(seg);
        }
    }

    /// Advance the trim mark to `addr + 1` and drop addresses `<= addr` from
    /// every stream's address space. Idempotent.
    pub fn prefix_trim(&mut self, addr: u64) {
        let new_starting_address = addr.saturating_add(1);
        if new_starting_address <= self.starting_address {
            return;
        }
        self.starting_address = new_starting_address;
        for space in self.stream_address_space.values_mut() {
            space.trim_prefix(addr);
        }
    }

    pub fn tails(&self, streams: &[StreamId]) -> (Option<u64>, HashMap<StreamId, u64>) {
        let mut out = HashMap::with_capacity(streams.len());
        for sid in streams {
            if let Some(&tail) = self.stream_tails.get(sid) {
                out.insert(*sid, tail);
            }
        }
        (self.global_tail, out)
    }

    /// Clear all in-memory state in preparation for a rebuild (used by
    /// `reset` and during recovery).
    pub fn clear(&mut self) {
        self.global_tail = None;
        self.stream_tails.clear();
        self.stream_address_space.clear();
    }
}

/// Thread-safe handle around [`LogMetadataInner`], plus the write-through
/// calls out to a [`MetadataStore`] for the fields that must survive a
/// restart.
pub struct LogMetadata {
    inner: Mutex<LogMetadataInner>,
}

impl LogMetadata {
    pub fn new(inner: LogMetadataInner) -> Self {
        Self { inner: Mutex::new(inner) }
    }

    /// Load persisted scalars from `store` into a fresh, otherwise-empty
    /// metadata index; stream tails/address spaces are rebuilt by recovery.
    pub fn load(store: &dyn MetadataStore) -> std::io::Result<Self> {
        let starting_address = store.get_starting_address()?;
        let tail_segment = store.get_tail_segment()?;
        let committed_tail = store.get_committed_tail()?;

        let mut stream_address_space = HashMap::new();
        for (sid, encoded) in store.get_log_unit_metadata()? {
            if let Some(bytes) = crate::datastore::decode_address_space(&encoded) {
                if let Some(space) = RangeSet::from_bytes(&bytes) {
                    stream_address_space.insert(sid, space);
                }
            }
        }
        let stream_tails = stream_address_space
            .iter()
            .filter_map(|(sid, space)| space.tail().map(|t| (*sid, t)))
            .collect();

        Ok(Self::new(LogMetadataInner {
            global_tail: None,
            stream_tails,
            stream_address_space,
            committed_tail,
            starting_address,
            tail_segment,
        }))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut LogMetadataInner) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Persist the scalar fields and the per-stream address-space snapshot
    /// via `store`. Called by `close` and periodically by the embedding
    /// server per its configured snapshot cadence.
    pub fn persist(&self, store: &dyn MetadataStore) -> std::io::Result<()> {
        let guard = self.inner.lock();
        store.update_starting_address(guard.starting_address)?;
        store.update_tail_segment(guard.tail_segment)?;
        if let Some(tail) = guard.committed_tail {
            store.update_committed_tail(tail)?;
        }
        let map = guard
            .stream_address_space
            .iter()
            .map(|(sid, space)| (*sid, crate::datastore::encode_address_space(&space.to_bytes())))
            .collect();
        store.set_log_unit_metadata(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_append_updates_tails_and_address_space() {
        let mut m = LogMetadataInner::default();
        m.record_append(5, [StreamId::new(1), StreamId::new(2)]);
        m.record_append(3, [StreamId::new(1)]);
        assert_eq!(m.global_tail, Some(5));
        assert_eq!(m.stream_tails[&StreamId::new(1)], 5);
        assert_eq!(m.stream_tails[&StreamId::new(2)], 5);
        assert!(m.stream_address_space[&StreamId::new(1)].contains(3));
    }

    #[test]
    fn prefix_trim_is_idempotent() {
        let mut m = LogMetadataInner::default();
        m.record_append(10, [StreamId::new(1)]);
        m.prefix_trim(9);
        assert_eq!(m.starting_address, 10);
        m.prefix_trim(9);
        assert_eq!(m.starting_address, 10);
    }

    #[test]
    fn prefix_trim_never_regresses() {
        let mut m = LogMetadataInner::default();
        m.prefix_trim(100);
        m.prefix_trim(5);
        assert_eq!(m.starting_address, 101);
    }

    #[test]
    fn sync_tail_segment_respects_force() {
        let mut m = LogMetadataInner::default();
        m.sync_tail_segment(Some(25_000), 10_000, false);
        assert_eq!(m.tail_segment, 2);
        m.sync_tail_segment(Some(5_000), 10_000, false);
        assert_eq!(m.tail_segment, 2);
        m.sync_tail_segment(Some(5_000), 10_000, true);
        assert_eq!(m.tail_segment, 0);
    }
}
