//! Client-side retention of recently sent chunks.
//!
//! The ring is the only place the client holds chunk bytes after emission;
//! it lets the sender answer retransmit requests without re-reading the
//! file. Records are kept in ascending seek order and the oldest record is
//! evicted once the ring holds more than `maxqueue` entries.

use crate::error::UploadError;
use bytes::Bytes;
use std::collections::VecDeque;

/// One emitted chunk retained for possible retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Byte offset of the payload within the file.
    pub seek: u64,
    pub payload: Bytes,
    pub is_last: bool,
    /// SHA-256 trailer, present iff `is_last`.
    pub checksum: Option<[u8; 32]>,
}

/// Bounded sequence of [`ChunkRecord`]s keyed by seek.
#[derive(Debug)]
pub struct ChunkRing {
    records: VecDeque<ChunkRecord>,
    capacity: usize,
}

impl ChunkRing {
    /// Creates a ring retaining at most `maxqueue` records.
    pub fn new(maxqueue: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(maxqueue.min(1024)),
            capacity: maxqueue.max(1),
        }
    }

    /// Appends a record, evicting the lowest-seek record when full.
    pub fn push(&mut self, record: ChunkRecord) {
        debug_assert!(
            self.records
                .back()
                .map(|r| r.seek <= record.seek)
                .unwrap_or(true),
            "records must be pushed in ascending seek order"
        );
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Returns, in order, all retained records with `record.seek >= seek`.
    ///
    /// Fails with retention-exhausted when `seek` lies below the ring's
    /// low-water mark; that gap cannot be filled and is fatal for the
    /// upload.
    pub fn resend_from(&self, seek: u64) -> Result<Vec<ChunkRecord>, UploadError> {
        if let Some(low) = self.low_water() {
            if seek < low {
                return Err(UploadError::RetentionExhausted {
                    wanted: seek,
                    low_water: low,
                });
            }
        }
        Ok(self
            .records
            .iter()
            .filter(|r| r.seek >= seek)
            .cloned()
            .collect())
    }

    /// Seek of the oldest retained record.
    pub fn low_water(&self) -> Option<u64> {
        self.records.front().map(|r| r.seek)
    }

    /// Seek of the newest retained record.
    pub fn high_water(&self) -> Option<u64> {
        self.records.back().map(|r| r.seek)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops all retained records; used when the upload completes.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seek: u64, payload: &'static [u8]) -> ChunkRecord {
        ChunkRecord {
            seek,
            payload: Bytes::from_static(payload),
            is_last: false,
            checksum: None,
        }
    }

    #[test]
    fn test_push_and_waters() {
        let mut ring = ChunkRing::new(3);
        assert!(ring.is_empty());
        assert_eq!(ring.low_water(), None);

        ring.push(record(0, b"aaaa"));
        ring.push(record(4, b"bbbb"));
        assert_eq!(ring.low_water(), Some(0));
        assert_eq!(ring.high_water(), Some(4));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_eviction_drops_lowest_seek() {
        let mut ring = ChunkRing::new(2);
        ring.push(record(0, b"aaaa"));
        ring.push(record(4, b"bbbb"));
        ring.push(record(8, b"cccc"));

        assert_eq!(ring.len(), 2);
        assert_eq!(ring.low_water(), Some(4));
        assert_eq!(ring.high_water(), Some(8));
    }

    #[test]
    fn test_resend_from_returns_in_order() {
        let mut ring = ChunkRing::new(4);
        ring.push(record(0, b"aaaa"));
        ring.push(record(4, b"bbbb"));
        ring.push(record(8, b"cc"));

        let resend = ring.resend_from(4).unwrap();
        assert_eq!(resend.len(), 2);
        assert_eq!(resend[0].seek, 4);
        assert_eq!(resend[1].seek, 8);
    }

    #[test]
    fn test_resend_from_exact_high_water() {
        let mut ring = ChunkRing::new(4);
        ring.push(record(0, b"aaaa"));
        ring.push(record(4, b"bbbb"));

        let resend = ring.resend_from(4).unwrap();
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].seek, 4);
    }

    #[test]
    fn test_resend_below_low_water_fails() {
        let mut ring = ChunkRing::new(2);
        ring.push(record(0, b"aaaa"));
        ring.push(record(4, b"bbbb"));
        ring.push(record(8, b"cccc")); // evicts seek 0

        let err = ring.resend_from(0).unwrap_err();
        assert!(matches!(
            err,
            UploadError::RetentionExhausted {
                wanted: 0,
                low_water: 4
            }
        ));
    }

    #[test]
    fn test_resend_from_empty_ring() {
        let ring = ChunkRing::new(2);
        assert!(ring.resend_from(0).unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let mut ring = ChunkRing::new(2);
        ring.push(record(0, b"aaaa"));
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.low_water(), None);
    }
}
