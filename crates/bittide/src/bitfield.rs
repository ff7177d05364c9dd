//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait BitfieldExt {
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }
    /// Set vector to a new len, in bits.
    fn new_and_resize(vec: Vec<u8>, len: usize) -> Bitfield {
        let mut s = Bitfield::from_vec(vec);
        s.resize(len, false);
        s
    }
    /// Read a bit, missing bits are unset.
    fn has(&self, index: usize) -> bool;
    /// Set a bit, growing the bitfield if needed. An index past
    /// `usize::MAX - 1` is ignored.
    fn safe_set(&mut self, index: usize);
    /// True when every one of `pieces` bits is set.
    fn is_complete(&self, pieces: usize) -> bool;
}

impl BitfieldExt for Bitfield {
    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }
    fn safe_set(&mut self, index: usize) {
        let Some(len) = index.checked_add(1) else { return };
        if self.len() < len {
            self.resize(len, false);
        }
        self.set(index, true);
    }
    fn is_complete(&self, pieces: usize) -> bool {
        pieces > 0 && self.len() >= pieces && self[..pieces].all()
    }
}
