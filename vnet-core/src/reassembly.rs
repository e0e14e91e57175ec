//! In-order reassembly of sequenced stream segments.
//!
//! Segments may arrive out of order or more than once (retransmissions and
//! path changes). The buffer holds early arrivals until the gap before them
//! is filled, then releases everything that is contiguous.

use std::collections::BTreeMap;

/// Default limit on segments held ahead of the next expected one.
pub const MAX_PENDING: usize = 1024;

/// Segments further than this ahead of the next expected one are rejected.
pub const WINDOW: u64 = 1 << 20;

/// Reassembly errors
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("Duplicate segment: sequence {0}")]
    Duplicate(u64),

    #[error("Segment too old: sequence {0}, expected >= {1}")]
    TooOld(u64, u64),

    #[error("Reassembly buffer full")]
    Full,

    #[error("Segment outside window: sequence {0}, expected < {1}")]
    OutOfWindow(u64, u64),
}

/// Reorders sequenced items of type `T`.
#[derive(Debug)]
pub struct Reassembly<T> {
    next_expected: u64,
    pending: BTreeMap<u64, T>,
    max_pending: usize,
}

impl<T> Reassembly<T> {
    pub fn new(first: u64) -> Self {
        Self::with_limit(first, MAX_PENDING)
    }

    pub fn with_limit(first: u64, max_pending: usize) -> Self {
        Self {
            next_expected: first,
            pending: BTreeMap::new(),
            max_pending,
        }
    }

    /// Accept a segment. Items already delivered are `TooOld`, items already
    /// buffered are `Duplicate`; both are safe to drop.
    pub fn insert(&mut self, sequence: u64, item: T) -> Result<(), ReassemblyError> {
        if sequence < self.next_expected {
            return Err(ReassemblyError::TooOld(sequence, self.next_expected));
        }
        let limit = self.next_expected.saturating_add(WINDOW);
        if sequence >= limit {
            return Err(ReassemblyError::OutOfWindow(sequence, limit));
        }
        if self.pending.contains_key(&sequence) {
            return Err(ReassemblyError::Duplicate(sequence));
        }
        // The next expected segment is always accepted so the stream can make
        // progress even when the buffer is full of later ones.
        if sequence != self.next_expected && self.pending.len() >= self.max_pending {
            return Err(ReassemblyError::Full);
        }
        self.pending.insert(sequence, item);
        Ok(())
    }

    /// Release all contiguous items starting at the next expected sequence.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = self.pending.remove(&self.next_expected) {
            out.push(item);
            self.next_expected = self.next_expected.saturating_add(1);
        }
        out
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
