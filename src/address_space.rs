//! A sparse set of `u64` addresses, represented as a sorted, non-overlapping
//! list of half-open `[start, end)` ranges.
//!
//! This backs each stream's "stream address space". A bitmap sized to the
//! global tail would be wasteful given streams are typically sparse over a
//! very large address domain, so a run-length encoding is used instead.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    /// Sorted, non-overlapping, non-adjacent `[start, end)` ranges.
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// Insert a single address.
    pub fn add(&mut self, addr: u64) {
        self.add_range(addr, addr + 1);
    }

    /// Insert every address in `addrs`, merging in one pass.
    ///
    /// `addrs` need not be sorted or deduplicated.
    pub fn add_many(&mut self, addrs: impl IntoIterator<Item = u64>) {
        let mut new: Vec<u64> = addrs.into_iter().collect();
        if new.is_empty() {
            return;
        }
        new.sort_unstable();
        new.dedup();
        for addr in new {
            self.add(addr);
        }
    }

    /// Merge a half-open range `[start, end)` into the set.
    fn add_range(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        // Find the first range whose end is >= start (candidate for merging).
        let insert_at = self.ranges.partition_point(|(_, e)| *e < start);

        let mut merge_start = start;
        let mut merge_end = end;
        let mut remove_to = insert_at;

        for &(s, e) in &self.ranges[insert_at..] {
            if s > merge_end {
                break;
            }
            merge_start = merge_start.min(s);
            merge_end = merge_end.max(e);
            remove_to += 1;
        }

        self.ranges.splice(insert_at..remove_to, [(merge_start, merge_end)]);
    }

    pub fn contains(&self, addr: u64) -> bool {
        let idx = self.ranges.partition_point(|(s, _)| *s <= addr);
        idx > 0 && self.ranges[idx - 1].1 > addr
    }

    /// The maximum address in the set, if any.
    pub fn tail(&self) -> Option<u64> {
        self.ranges.last().map(|(_, e)| e - 1)
    }

    /// The minimum address in the set, if any.
    pub fn head(&self) -> Option<u64> {
        self.ranges.first().map(|(s, _)| *s)
    }

    /// All addresses in the inclusive range `[lo, hi]`.
    pub fn range(&self, lo: u64, hi: u64) -> Vec<u64> {
        if lo > hi {
            return Vec::new();
        }
        let mut out = Vec::new();
        for &(s, e) in &self.ranges {
            if e <= lo {
                continue;
            }
            if s > hi {
                break;
            }
            let from = s.max(lo);
            let to = e.min(hi + 1);
            out.extend(from..to);
        }
        out
    }

    /// Drop all addresses `<= addr`, i.e. keep only `(addr, ..]`.
    ///
    /// Idempotent: calling twice with the same `addr` has the same effect as
    /// calling once.
    pub fn trim_prefix(&mut self, addr: u64) {
        let boundary = addr + 1;
        let keep_from = self.ranges.partition_point(|(_, e)| *e <= boundary);
        self.ranges.drain(0..keep_from);
        if let Some((s, _)) = self.ranges.first_mut() {
            if *s < boundary {
                *s = boundary;
            }
        }
    }

    /// Serialize to a compact byte form (a flat `u64` pair list, little-endian).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.ranges.len() * 16);
        for (s, e) in &self.ranges {
            buf.extend_from_slice(&s.to_le_bytes());
            buf.extend_from_slice(&e.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 16 != 0 {
            return None;
        }
        let mut ranges = Vec::with_capacity(bytes.len() / 16);
        for chunk in bytes.chunks_exact(16) {
            let s = u64::from_le_bytes(chunk[0..8].try_into().ok()?);
            let e = u64::from_le_bytes(chunk[8..16].try_into().ok()?);
            ranges.push((s, e));
        }
        Some(Self { ranges })
    }
}
