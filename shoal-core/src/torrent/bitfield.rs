//! Fixed-size piece availability bit vector.
//!
//! Bit `i` is the piece with index `i`. Bits are packed MSB-first as the
//! wire protocol requires: piece 0 is the high bit of byte 0.

use super::PieceIndex;

/// Bitfield representing which pieces a peer has.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates a bitfield for `piece_count` pieces with no bit set.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0u8; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a bitfield from wire bytes.
    ///
    /// Short input is zero-padded, long input is truncated and spare bits past
    /// `piece_count` are cleared, so the result never reports more pieces than
    /// the torrent has.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);

        let mut bitfield = Self { bits, piece_count };
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Returns the wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }

    /// Number of bits (pieces) tracked.
    pub fn len(&self) -> usize {
        self.piece_count
    }

    /// True when no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|byte| *byte == 0)
    }

    /// Check if the piece is present. Out-of-range indices report false.
    pub fn has(&self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_usize();
        if index >= self.piece_count {
            return false;
        }

        self.bits[index / 8] & Self::mask(index) != 0
    }

    /// Mark piece as present. Returns false if the index is out of range.
    pub fn set(&mut self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_usize();
        if index >= self.piece_count {
            return false;
        }

        self.bits[index / 8] |= Self::mask(index);
        true
    }

    /// Mark piece as absent.
    pub fn clear(&mut self, piece_index: PieceIndex) {
        let index = piece_index.as_usize();
        if index < self.piece_count {
            self.bits[index / 8] &= !Self::mask(index);
        }
    }

    /// Number of pieces present.
    pub fn count_ones(&self) -> usize {
        self.bits
            .iter()
            .map(|byte| byte.count_ones() as usize)
            .sum()
    }

    /// True when every piece is present.
    pub fn is_complete(&self) -> bool {
        self.count_ones() == self.piece_count
    }

    /// Iterates the indices of present pieces in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.piece_count)
            .map(|index| PieceIndex::new(index as u32))
            .filter(|piece_index| self.has(*piece_index))
    }

    fn mask(index: usize) -> u8 {
        1 << (7 - (index % 8))
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.piece_count % 8;
        if spare != 0
            && let Some(last) = self.bits.last_mut()
        {
            *last &= 0xFFu8 << (8 - spare);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_msb_first_packing() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(PieceIndex::new(0));
        bitfield.set(PieceIndex::new(9));

        assert_eq!(bitfield.to_bytes(), vec![0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn test_from_bytes_clears_spare_bits() {
        let bitfield = Bitfield::from_bytes(&[0xFF, 0xFF], 10);

        assert_eq!(bitfield.len(), 10);
        assert_eq!(bitfield.count_ones(), 10);
        assert_eq!(bitfield.to_bytes(), vec![0xFF, 0b1100_0000]);
        assert!(bitfield.is_complete());
    }

    #[test]
    fn test_from_bytes_pads_and_truncates() {
        let short = Bitfield::from_bytes(&[0b1000_0000], 16);
        assert_eq!(short.to_bytes(), vec![0b1000_0000, 0]);
        assert!(short.has(PieceIndex::new(0)));

        let long = Bitfield::from_bytes(&[0, 0, 0xFF], 16);
        assert_eq!(long.to_bytes(), vec![0, 0]);
        assert!(long.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut bitfield = Bitfield::from_bytes(&[0xFF], 8);
        bitfield.clear(PieceIndex::new(0));
        bitfield.clear(PieceIndex::new(8));

        assert!(!bitfield.has(PieceIndex::new(0)));
        assert_eq!(bitfield.count_ones(), 7);
        assert_eq!(bitfield.to_bytes(), vec![0b0111_1111]);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut bitfield = Bitfield::new(3);
        assert!(!bitfield.set(PieceIndex::new(3)));
        assert!(!bitfield.has(PieceIndex::new(3)));
        assert!(bitfield.is_empty());
    }

    #[test]
    fn test_default_is_zero_length() {
        let bitfield = Bitfield::default();
        assert_eq!(bitfield.len(), 0);
        assert!(bitfield.is_empty());
        assert!(bitfield.to_bytes().is_empty());
    }

    #[test]
    fn test_iter_set() {
        let bitfield = Bitfield::from_bytes(&[0b0101_0000], 8);
        let indices: Vec<u32> = bitfield.iter_set().map(PieceIndex::as_u32).collect();
        assert_eq!(indices, vec![1, 3]);
    }

    proptest! {
        #[test]
        fn prop_round_trip(bytes in proptest::collection::vec(any::<u8>(), 1..64)) {
            let piece_count = bytes.len() * 8;
            let bitfield = Bitfield::from_bytes(&bytes, piece_count);
            let restored = Bitfield::from_bytes(&bitfield.to_bytes(), piece_count);
            prop_assert_eq!(bitfield.to_bytes(), bytes);
            prop_assert_eq!(restored, bitfield);
        }

        #[test]
        fn prop_set_touches_one_bit(piece_count in 1usize..512, seed in any::<usize>()) {
            let index = seed % piece_count;
            let mut bitfield = Bitfield::new(piece_count);
            for other in 0..piece_count {
                prop_assert!(!bitfield.has(PieceIndex::new(other as u32)));
            }

            bitfield.set(PieceIndex::new(index as u32));

            for other in 0..piece_count {
                let expected = other == index;
                prop_assert_eq!(bitfield.has(PieceIndex::new(other as u32)), expected);
            }
            prop_assert_eq!(bitfield.count_ones(), 1);
        }
    }
}
