//! Storage of the content: the bytes of every piece, the state of their
//! blocks and the bitfield of verified pieces.
//!
//! The [`StorageEngine`] owns one buffer spanning the whole content, pieces
//! and files are views into it. Writing the last missing block of a piece
//! makes the piece full, and a full piece is verified against its hash before
//! it is readable. A piece failing verification loses all of its blocks and
//! is downloaded again.
mod backend;
mod file;
mod piece;

pub use backend::DiskBackend;
pub use file::File;
pub use piece::{BlockState, Piece};

use std::{ops::Range, path::Path};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    descriptor::ContentDescriptor,
    error::Error,
    peer::BlockInfo,
};

/// Length of a block, the unit of a request.
pub const BLOCK_LEN: u32 = 16384;

/// Peers requesting more than this in a single block are disconnected.
pub const MAX_BLOCK_LEN: u32 = 131072;

/// State changes produced by verifying a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEvent {
    PieceVerified(usize),
    VerificationFailed(usize),
    /// Index of a file whose pieces are all verified.
    FileDone(usize),
    /// Every file is done.
    Done,
}

/// Outcome of staging a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockWrite {
    Written,
    /// The block was already written, nothing changed.
    Duplicate,
    /// This was the last missing block, the piece must be verified.
    PieceFull,
}

#[derive(Debug)]
pub struct StorageEngine {
    buffer: Vec<u8>,
    pieces: Vec<Piece>,
    files: Vec<File>,
    bitfield: Bitfield,
    backend: Option<DiskBackend>,
    done: bool,
}

impl StorageEngine {
    pub fn new(descriptor: &ContentDescriptor) -> Result<Self, Error> {
        descriptor.validate()?;

        let piece_length = descriptor.piece_length as usize;
        let pieces = descriptor
            .pieces
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                Piece::new(
                    index,
                    *hash,
                    index * piece_length,
                    descriptor.piece_len(index) as usize,
                )
            })
            .collect();

        let files = descriptor
            .files
            .iter()
            .map(|f| File::new(f, descriptor.piece_length))
            .collect();

        Ok(Self {
            buffer: vec![0; descriptor.length as usize],
            bitfield: Bitfield::from_piece(descriptor.num_pieces()),
            pieces,
            files,
            backend: None,
            done: false,
        })
    }

    /// Storage persisting verified pieces under `dir`.
    pub fn with_backend(
        descriptor: &ContentDescriptor,
        dir: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        let mut storage = Self::new(descriptor)?;
        storage.backend = Some(DiskBackend::new(dir.as_ref(), &storage.files));
        Ok(storage)
    }

    pub fn backend(&self) -> Option<&DiskBackend> {
        self.backend.as_ref()
    }

    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn piece(&self, index: usize) -> Result<&Piece, Error> {
        self.pieces.get(index).ok_or(Error::InvalidIndex(index))
    }

    fn piece_mut(&mut self, index: usize) -> Result<&mut Piece, Error> {
        self.pieces.get_mut(index).ok_or(Error::InvalidIndex(index))
    }

    pub fn files(&self) -> &[File] {
        &self.files
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.has(index)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Sum of verified pieces plus whole blocks written of the others.
    pub fn downloaded(&self) -> u64 {
        self.pieces.iter().map(Piece::downloaded).sum()
    }

    /// Pieces that are not verified.
    pub fn num_missing(&self) -> usize {
        self.bitfield.count_zeros()
    }

    /// Read the bytes of a block.
    ///
    /// Only addressing is checked here, callers serving peers must check
    /// that the piece is verified.
    pub fn read_block(
        &self,
        index: usize,
        offset: u32,
        len: u32,
    ) -> Result<&[u8], Error> {
        let piece = self.piece(index)?;
        piece.block_of(offset)?;
        let range = piece.range();
        let start = range.start + offset as usize;
        let end = start + len as usize;
        if len == 0 || end > range.end {
            return Err(Error::InvalidOffset { index, offset });
        }
        Ok(&self.buffer[start..end])
    }

    /// Read a verified piece, or a sub range of it.
    pub fn read(
        &self,
        index: usize,
        range: Option<Range<usize>>,
    ) -> Result<Bytes, Error> {
        let piece = self.piece(index)?;
        if !piece.is_verified() {
            return Err(Error::PieceNotVerified(index));
        }
        let bytes = &self.buffer[piece.range()];
        let range = range.unwrap_or(0..bytes.len());
        if range.start > range.end || range.end > bytes.len() {
            let offset = range.start as u32;
            return Err(Error::InvalidOffset { index, offset });
        }
        Ok(Bytes::copy_from_slice(&bytes[range]))
    }

    /// Read an absolute byte range, every piece covering it must be verified.
    pub fn read_range(&self, range: Range<u64>) -> Result<Bytes, Error> {
        if range.start > range.end || range.end > self.len() {
            return Err(Error::InvalidRange {
                start: range.start as usize,
                end: range.end as usize,
            });
        }
        for index in self.pieces_of(range.clone()) {
            if !self.has_piece(index) {
                return Err(Error::PieceNotVerified(index));
            }
        }
        Ok(Bytes::copy_from_slice(
            &self.buffer[range.start as usize..range.end as usize],
        ))
    }

    /// Indices of the pieces overlapping an absolute byte range.
    pub fn pieces_of(&self, range: Range<u64>) -> Range<usize> {
        let Some(first) = self.pieces.first() else { return 0..0 };
        if range.is_empty() {
            return 0..0;
        }
        let piece_length = first.len() as u64;
        let start = (range.start / piece_length) as usize;
        let end = ((range.end - 1) / piece_length) as usize + 1;
        start.min(self.pieces.len())..end.min(self.pieces.len())
    }

    /// Reserve the first blank block of a piece.
    pub fn reserve_block(
        &mut self,
        index: usize,
        end_game: bool,
    ) -> Option<BlockInfo> {
        if self.has_piece(index) {
            return None;
        }
        self.pieces.get_mut(index)?.reserve_block(end_game)
    }

    /// Give back a reservation, written blocks are left alone.
    pub fn cancel_block(
        &mut self,
        index: usize,
        offset: u32,
    ) -> Result<(), Error> {
        let piece = self.piece_mut(index)?;
        let block = piece.block_of(offset)?;
        piece.cancel_block(block);
        Ok(())
    }

    /// Copy a block into the buffer without verifying the piece.
    pub fn stage_block(
        &mut self,
        index: usize,
        offset: u32,
        data: &[u8],
    ) -> Result<BlockWrite, Error> {
        let piece =
            self.pieces.get_mut(index).ok_or(Error::InvalidIndex(index))?;
        let block = piece.check_block(offset, data.len())?;

        if piece.block_state(block) == Some(BlockState::Written) {
            return Ok(BlockWrite::Duplicate);
        }

        let start = piece.range().start + offset as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        piece.mark_written(block);

        Ok(if piece.is_full() {
            BlockWrite::PieceFull
        } else {
            BlockWrite::Written
        })
    }

    /// Write a block, verifying the piece right away if it becomes full.
    pub fn write_block(
        &mut self,
        index: usize,
        offset: u32,
        data: &[u8],
    ) -> Result<Vec<StorageEvent>, Error> {
        match self.stage_block(index, offset, data)? {
            BlockWrite::PieceFull => self.verify(index),
            _ => Ok(Vec::new()),
        }
    }

    /// Copy of the bytes of a piece, to be hashed off the engine task.
    pub fn piece_bytes(&self, index: usize) -> Result<Vec<u8>, Error> {
        let piece = self.piece(index)?;
        Ok(self.buffer[piece.range()].to_vec())
    }

    /// Hash a full piece and apply the result.
    pub fn verify(&mut self, index: usize) -> Result<Vec<StorageEvent>, Error> {
        let piece = self.piece(index)?;
        let digest =
            sha1_smol::Sha1::from(&self.buffer[piece.range()]).digest().bytes();
        self.apply_digest(index, digest)
    }

    /// Compare the digest of a full piece with its expected hash.
    ///
    /// A matching piece becomes verified and readable, a mismatching piece is
    /// reset to blank. Digests of pieces that are not full, or already
    /// verified, are stale and ignored.
    pub fn apply_digest(
        &mut self,
        index: usize,
        digest: [u8; 20],
    ) -> Result<Vec<StorageEvent>, Error> {
        let piece = self.piece_mut(index)?;
        if piece.is_verified() || !piece.is_full() {
            return Ok(Vec::new());
        }

        if piece.hash != digest {
            warn!("piece {index} failed verification");
            piece.reset();
            return Ok(vec![StorageEvent::VerificationFailed(index)]);
        }

        Ok(self.mark_verified(index))
    }

    /// Accept existing data of a piece if it matches the expected hash.
    ///
    /// Used when checking data loaded from the backing store, where a
    /// mismatch means the piece was never downloaded and nothing is reset.
    pub fn apply_existing(
        &mut self,
        index: usize,
        digest: [u8; 20],
    ) -> Result<Vec<StorageEvent>, Error> {
        let piece = self.piece(index)?;
        if piece.is_verified() || piece.hash != digest {
            return Ok(Vec::new());
        }
        Ok(self.mark_verified(index))
    }

    /// Replace the whole buffer with existing content.
    pub fn load(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() != self.buffer.len() {
            return Err(Error::InvalidRange { start: 0, end: data.len() });
        }
        self.buffer.copy_from_slice(data);
        Ok(())
    }

    /// Load whatever the backing store already has. Returns true if there
    /// was anything to load.
    pub async fn load_existing(&mut self) -> Result<bool, Error> {
        let Some(backend) = self.backend.clone() else { return Ok(false) };
        backend.load(&mut self.buffer).await
    }

    fn mark_verified(&mut self, index: usize) -> Vec<StorageEvent> {
        let mut events = vec![StorageEvent::PieceVerified(index)];
        self.pieces[index].set_verified();
        self.bitfield.set(index, true);
        debug!("piece {index} verified");

        for (i, file) in self.files.iter_mut().enumerate() {
            if file.done || !file.contains_piece(index) {
                continue;
            }
            if file.pieces.clone().all(|p| self.bitfield.has(p)) {
                file.done = true;
                events.push(StorageEvent::FileDone(i));
            }
        }

        if !self.done && self.files.iter().all(File::is_done) {
            self.done = true;
            events.push(StorageEvent::Done);
        }
        events
    }

    /// Flush the backing store.
    pub async fn close(&self) -> Result<(), Error> {
        match &self.backend {
            Some(backend) => backend.close().await,
            None => Ok(()),
        }
    }

    /// Delete the content from the backing store.
    pub async fn remove(&self) -> Result<(), Error> {
        match &self.backend {
            Some(backend) => backend.remove().await,
            None => Ok(()),
        }
    }
}
