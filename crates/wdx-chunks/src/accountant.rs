//! Received-range bookkeeping for a single upload.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, trace};

/// Errors raised by chunk accounting.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum ChunkError {
    /// `offset + length` does not fit in the address space.
    #[error("chunk offset plus length overflows")]
    RangeOverflow,
    /// The range map hit its memory bound and merging freed no entry.
    #[error("failed to optimize chunk map")]
    CannotOptimize,
}

/// Tracks which byte ranges of a fixed-capacity upload have been received.
///
/// The map never holds more than `floor(sqrt(capacity))` entries; adjacent
/// and overlapping ranges are merged whenever an insert would exceed that
/// bound. Non-mergeable inserts beyond the bound are rejected.
#[derive(Debug)]
pub struct ChunkAccountant {
    chunks: BTreeMap<u64, u64>,
    capacity: u64,
    received: u64,
    bound: u64,
}

impl ChunkAccountant {
    /// Creates an accountant for an upload of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        debug!(capacity, "created new chunk map");
        Self {
            chunks: BTreeMap::new(),
            capacity,
            received: 0,
            bound: capacity.isqrt(),
        }
    }

    /// Records a received range.
    ///
    /// Replacing a range at an already-known offset keeps the received
    /// counter consistent. Fails on arithmetic overflow or when the map
    /// cannot be kept within its bound.
    pub fn add_chunk(&mut self, offset: u64, length: u64) -> Result<(), ChunkError> {
        offset
            .checked_add(length)
            .ok_or(ChunkError::RangeOverflow)?;

        if let Some(previous) = self.chunks.insert(offset, length) {
            self.received -= previous;
        }
        self.received += length;
        trace!(offset, length, "added new chunk");

        while self.chunks.len() as u64 > self.bound {
            if !self.optimize() {
                return Err(ChunkError::CannotOptimize);
            }
        }
        Ok(())
    }

    /// Merges overlapping and adjacent ranges; returns whether anything changed.
    pub fn optimize(&mut self) -> bool {
        debug!(entries = self.chunks.len(), "optimize chunk map");
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.chunks.len());
        let mut changed = false;
        for (&offset, &length) in &self.chunks {
            let end = offset.saturating_add(length);
            match merged.last_mut() {
                Some(last) if offset <= last.1 => {
                    if end > last.1 {
                        last.1 = end;
                    }
                    changed = true;
                }
                _ => merged.push((offset, end)),
            }
        }
        if changed {
            self.chunks = merged
                .into_iter()
                .map(|(offset, end)| (offset, end - offset))
                .collect();
        }
        changed
    }

    /// True when the recorded ranges cover the full prefix `[0, capacity)`.
    #[must_use]
    pub fn file_completed(&self) -> bool {
        // cheap pre-check: less data received than announced cannot be complete
        if self.received < self.capacity {
            return false;
        }

        let mut iter = self.chunks.iter();
        let Some((&first_offset, &first_length)) = iter.next() else {
            return self.capacity == 0;
        };
        if first_offset != 0 {
            return false;
        }
        let mut covered_end = first_offset + first_length;
        for (&offset, &length) in iter {
            if offset > covered_end {
                return false;
            }
            covered_end = covered_end.max(offset + length);
        }
        let complete = covered_end == self.capacity;
        trace!(complete, "checked file completion");
        complete
    }

    /// Current number of tracked ranges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// True when no range has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// The capacity declared at construction.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
