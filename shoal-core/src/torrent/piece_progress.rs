//! Received-range bookkeeping for a partially downloaded piece.

use std::collections::BTreeMap;

/// Tracks which bytes of one piece have been written.
///
/// `next_offset` is the end of the contiguous prefix starting at 0. Blocks
/// that land past it are kept as pending ranges and absorbed once the gap
/// before them fills.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceProgress {
    piece_size: u32,
    next_offset: u32,
    pending: BTreeMap<u32, u32>,
}

impl PieceProgress {
    /// Creates progress for an untouched piece.
    pub fn new(piece_size: u32) -> Self {
        Self::resume(piece_size, 0)
    }

    /// Creates progress for a piece whose first `next_offset` bytes are
    /// already on disk.
    pub fn resume(piece_size: u32, next_offset: u32) -> Self {
        Self {
            piece_size,
            next_offset: next_offset.min(piece_size),
            pending: BTreeMap::new(),
        }
    }

    /// First byte not yet covered by the contiguous prefix.
    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }

    pub fn is_complete(&self) -> bool {
        self.next_offset >= self.piece_size
    }

    /// Records a written block. Returns true when the contiguous prefix grew.
    ///
    /// Callers validate that the block fits inside the piece.
    pub fn record(&mut self, offset: u32, length: u32) -> bool {
        let end = offset.saturating_add(length).min(self.piece_size);
        if end <= self.next_offset || length == 0 {
            return false;
        }

        if offset > self.next_offset {
            let pending_end = self.pending.entry(offset).or_insert(end);
            *pending_end = (*pending_end).max(end);
            return false;
        }

        self.next_offset = end;
        while let Some((&start, &pending_end)) = self.pending.first_key_value() {
            if start > self.next_offset {
                break;
            }
            self.pending.remove(&start);
            self.next_offset = self.next_offset.max(pending_end);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_blocks_complete_piece() {
        let mut progress = PieceProgress::new(32768);

        assert!(progress.record(0, 16384));
        assert_eq!(progress.next_offset(), 16384);
        assert!(!progress.is_complete());

        assert!(progress.record(16384, 16384));
        assert!(progress.is_complete());
        assert_eq!(progress.next_offset(), progress.piece_size);
    }

    #[test]
    fn test_out_of_order_blocks_are_absorbed() {
        let mut progress = PieceProgress::new(48);

        assert!(!progress.record(32, 16));
        assert!(!progress.record(16, 16));
        assert_eq!(progress.next_offset(), 0);

        assert!(progress.record(0, 16));
        assert_eq!(progress.next_offset(), 48);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_duplicate_block_is_ignored() {
        let mut progress = PieceProgress::new(32);

        assert!(progress.record(0, 16));
        assert!(!progress.record(0, 16));
        assert!(!progress.record(4, 8));
        assert_eq!(progress.next_offset(), 16);
    }

    #[test]
    fn test_resume_from_scanned_offset() {
        let mut progress = PieceProgress::resume(100, 40);
        assert_eq!(progress.next_offset(), 40);

        // Overlapping block still extends the prefix
        assert!(progress.record(30, 70));
        assert!(progress.is_complete());
    }

    #[test]
    fn test_resume_clamps_to_piece_size() {
        let progress = PieceProgress::resume(10, 50);
        assert!(progress.is_complete());
    }
}
