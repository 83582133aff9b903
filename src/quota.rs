//! Quota & Filesystem Agent: tracks bytes used vs a configured limit.
//!
//! A plain atomic counter, matching the engine's other small atomic-counter
//! primitives (`SegmentHandle`'s ref count).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct QuotaAgent {
    used_bytes: AtomicU64,
    limit_bytes: u64,
}

impl QuotaAgent {
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            used_bytes: AtomicU64::new(0),
            limit_bytes,
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    pub fn quota_exceeded(&self) -> bool {
        self.used_bytes() >= self.limit_bytes
    }

    /// Record `n` bytes written by a successful segment append.
    pub fn record_write(&self, n: u64) {
        self.used_bytes.fetch_add(n, Ordering::SeqCst);
    }

    /// Record `n` bytes freed by deleting a segment (or shrinking one via
    /// `reset`'s truncation).
    pub fn record_free(&self, n: u64) {
        self.used_bytes.fetch_sub(n.min(self.used_bytes()), Ordering::SeqCst);
    }

    /// Reset the counter to exactly `bytes`, e.g. after recomputing usage
    /// from a directory walk at startup.
    pub fn set_used_bytes(&self, bytes: u64) {
        self.used_bytes.store(bytes, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_when_at_or_over_limit() {
        let q = QuotaAgent::new(100);
        assert!(!q.quota_exceeded());
        q.record_write(100);
        assert!(q.quota_exceeded());
    }

    #[test]
    fn record_free_never_underflows() {
        let q = QuotaAgent::new(100);
        q.record_write(10);
        q.record_free(50);
        assert_eq!(q.used_bytes(), 0);
    }
}
