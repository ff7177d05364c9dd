use std::ops::Range;

use crate::{error::Error, peer::BlockInfo, storage::BLOCK_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Blank,
    Reserved,
    Written,
}

/// A piece of the content and the state of each of its blocks.
///
/// The bytes themselves live in the [`StorageEngine`] buffer, the piece only
/// knows where its view begins and how long it is.
///
/// [`StorageEngine`]: super::StorageEngine
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: usize,
    pub hash: [u8; 20],
    offset: usize,
    length: usize,
    blocks: Vec<BlockState>,
    blocks_written: usize,
    verified: bool,
}

impl Piece {
    pub fn new(
        index: usize,
        hash: [u8; 20],
        offset: usize,
        length: usize,
    ) -> Self {
        let num_blocks = length.div_ceil(BLOCK_LEN as usize);
        Self {
            index,
            hash,
            offset,
            length,
            blocks: vec![BlockState::Blank; num_blocks],
            blocks_written: 0,
            verified: false,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Absolute range of this piece inside the storage buffer.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.length
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks_written(&self) -> usize {
        self.blocks_written
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// All blocks written, the piece is waiting for (or passed) verification.
    pub fn is_full(&self) -> bool {
        self.blocks_written == self.blocks.len()
    }

    pub fn block_state(&self, block: usize) -> Option<BlockState> {
        self.blocks.get(block).copied()
    }

    /// Bytes contributed to the downloaded counter.
    pub fn downloaded(&self) -> u64 {
        if self.verified {
            self.length as u64
        } else {
            (self.blocks_written * BLOCK_LEN as usize).min(self.length) as u64
        }
    }

    fn block_len(&self, block: usize) -> u32 {
        let begin = block * BLOCK_LEN as usize;
        (self.length - begin).min(BLOCK_LEN as usize) as u32
    }

    fn block_info(&self, block: usize) -> BlockInfo {
        BlockInfo {
            index: self.index,
            begin: block as u32 * BLOCK_LEN,
            len: self.block_len(block),
        }
    }

    /// Block number of a byte offset, which must be a block boundary.
    pub fn block_of(&self, offset: u32) -> Result<usize, Error> {
        let block = (offset / BLOCK_LEN) as usize;
        if offset % BLOCK_LEN != 0 || block >= self.blocks.len() {
            return Err(Error::InvalidOffset { index: self.index, offset });
        }
        Ok(block)
    }

    /// A block must be exactly [`BLOCK_LEN`] bytes, unless it is the trailing
    /// block of the piece, which covers whatever is left.
    pub fn check_block(&self, offset: u32, len: usize) -> Result<usize, Error> {
        let block = self.block_of(offset)?;
        if len != self.block_len(block) as usize {
            return Err(Error::InvalidBlockSize {
                index: self.index,
                offset,
                len,
            });
        }
        Ok(block)
    }

    /// Reserve the first blank block.
    ///
    /// In endgame, once no blank block is left, a block that is reserved but
    /// not written yet may be handed out again.
    pub fn reserve_block(&mut self, end_game: bool) -> Option<BlockInfo> {
        if let Some(block) =
            self.blocks.iter().position(|b| *b == BlockState::Blank)
        {
            self.blocks[block] = BlockState::Reserved;
            return Some(self.block_info(block));
        }
        if !end_game {
            return None;
        }
        self.blocks
            .iter()
            .position(|b| *b == BlockState::Reserved)
            .map(|block| self.block_info(block))
    }

    /// Turn a reservation back into a blank block. Written blocks stay.
    pub fn cancel_block(&mut self, block: usize) {
        if self.blocks.get(block) == Some(&BlockState::Reserved) {
            self.blocks[block] = BlockState::Blank;
        }
    }

    /// Mark the block written, returns false if it already was.
    pub fn mark_written(&mut self, block: usize) -> bool {
        match self.blocks.get_mut(block) {
            Some(BlockState::Written) | None => false,
            Some(state) => {
                *state = BlockState::Written;
                self.blocks_written += 1;
                true
            }
        }
    }

    /// Set once the piece bytes match the expected hash.
    pub(crate) fn set_verified(&mut self) {
        self.blocks.fill(BlockState::Written);
        self.blocks_written = self.blocks.len();
        self.verified = true;
    }

    /// Forget every block after a failed verification.
    pub(crate) fn reset(&mut self) {
        self.blocks.fill(BlockState::Blank);
        self.blocks_written = 0;
        self.verified = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(length: usize) -> Piece {
        Piece::new(3, [0; 20], 0, length)
    }

    #[test]
    fn blocks_of_a_piece() {
        let p = piece(BLOCK_LEN as usize * 2 + 100);
        assert_eq!(p.num_blocks(), 3);
        assert_eq!(p.block_len(0), BLOCK_LEN);
        assert_eq!(p.block_len(2), 100);
        assert_eq!(p.block_of(BLOCK_LEN).unwrap(), 1);
        assert!(matches!(p.block_of(1), Err(Error::InvalidOffset { .. })));
        assert!(matches!(
            p.block_of(3 * BLOCK_LEN),
            Err(Error::InvalidOffset { .. })
        ));
    }

    #[test]
    fn check_block_sizes() {
        let p = piece(BLOCK_LEN as usize + 100);
        assert!(p.check_block(0, BLOCK_LEN as usize).is_ok());
        assert!(p.check_block(BLOCK_LEN, 100).is_ok());
        assert!(matches!(
            p.check_block(0, 100),
            Err(Error::InvalidBlockSize { .. })
        ));
        assert!(matches!(
            p.check_block(BLOCK_LEN, BLOCK_LEN as usize),
            Err(Error::InvalidBlockSize { .. })
        ));
    }

    #[test]
    fn reserve_in_order() {
        let mut p = piece(BLOCK_LEN as usize * 2 + 1);

        let b0 = p.reserve_block(false).unwrap();
        let b1 = p.reserve_block(false).unwrap();
        let b2 = p.reserve_block(false).unwrap();
        assert_eq!((b0.begin, b0.len), (0, BLOCK_LEN));
        assert_eq!((b1.begin, b1.len), (BLOCK_LEN, BLOCK_LEN));
        assert_eq!((b2.begin, b2.len), (2 * BLOCK_LEN, 1));
        assert_eq!(b2.index, 3);

        // everything is reserved
        assert!(p.reserve_block(false).is_none());

        p.cancel_block(1);
        assert_eq!(p.reserve_block(false).unwrap().begin, BLOCK_LEN);
    }

    #[test]
    fn endgame_hands_out_reserved_blocks() {
        let mut p = piece(BLOCK_LEN as usize * 2);
        p.reserve_block(false).unwrap();
        p.reserve_block(false).unwrap();
        assert!(p.reserve_block(false).is_none());

        p.mark_written(0);
        let dup = p.reserve_block(true).unwrap();
        assert_eq!(dup.begin, BLOCK_LEN);

        p.mark_written(1);
        assert!(p.reserve_block(true).is_none());
        assert!(p.is_full());
    }

    #[test]
    fn cancel_keeps_written_blocks() {
        let mut p = piece(BLOCK_LEN as usize);
        p.cancel_block(0);
        assert_eq!(p.block_state(0), Some(BlockState::Blank));

        p.reserve_block(false);
        assert!(p.mark_written(0));
        assert!(!p.mark_written(0));
        p.cancel_block(0);
        assert_eq!(p.block_state(0), Some(BlockState::Written));
        assert_eq!(p.blocks_written(), 1);
    }

    #[test]
    fn downloaded_and_reset() {
        let mut p = piece(BLOCK_LEN as usize + 10);
        assert_eq!(p.downloaded(), 0);

        // counted in whole blocks, capped at the piece length
        p.mark_written(1);
        assert_eq!(p.downloaded(), BLOCK_LEN as u64);
        p.mark_written(0);
        assert_eq!(p.downloaded(), BLOCK_LEN as u64 + 10);

        p.reset();
        assert_eq!(p.blocks_written(), 0);
        assert_eq!(p.block_state(0), Some(BlockState::Blank));
        assert_eq!(p.downloaded(), 0);

        p.set_verified();
        assert!(p.is_verified());
        assert_eq!(p.downloaded(), BLOCK_LEN as u64 + 10);
    }
}
