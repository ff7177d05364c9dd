use std::{ops::Range, path::PathBuf};

use crate::descriptor::FileEntry;

/// A file of the content and the pieces that cover its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub name: String,
    pub path: PathBuf,
    pub length: u64,
    /// Absolute offset of the first byte.
    pub offset: u64,
    /// Indices of the pieces holding bytes of this file. Empty files own no
    /// pieces.
    pub pieces: Range<usize>,
    pub(crate) done: bool,
}

impl File {
    pub fn new(entry: &FileEntry, piece_length: u32) -> Self {
        let piece_length = piece_length as u64;
        let pieces = if entry.length == 0 {
            0..0
        } else {
            let first = entry.offset / piece_length;
            let last = (entry.offset + entry.length - 1) / piece_length;
            first as usize..last as usize + 1
        };

        Self {
            name: entry.name.clone(),
            path: entry.path.clone(),
            length: entry.length,
            offset: entry.offset,
            done: pieces.is_empty(),
            pieces,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn contains_piece(&self, index: usize) -> bool {
        self.pieces.contains(&index)
    }

    /// Absolute range of bytes of the file.
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}
