//! Persist verified pieces to the files of the content.
use std::{
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    fs::{create_dir_all, remove_dir, remove_file, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;

use crate::{error::Error, storage::file};

#[derive(Debug)]
struct FileSlot {
    path: PathBuf,
    offset: u64,
    length: u64,
}

/// Maps the absolute byte space of the content onto files in a directory.
///
/// Cheap to clone, so flushes can run on their own task.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    root: PathBuf,
    files: Arc<[FileSlot]>,
}

impl DiskBackend {
    pub fn new(root: impl Into<PathBuf>, files: &[file::File]) -> Self {
        let root = root.into();
        let files = files
            .iter()
            .map(|f| FileSlot {
                path: root.join(&f.path),
                offset: f.offset,
                length: f.length,
            })
            .collect();
        Self { root, files }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn open_file(path: impl AsRef<Path>) -> Result<File, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?)
    }

    /// Slots overlapping `offset..offset + len`, with the overlapping range
    /// relative to the slot and relative to the given buffer.
    fn overlapping(
        &self,
        offset: u64,
        len: usize,
    ) -> impl Iterator<Item = (&FileSlot, u64, std::ops::Range<usize>)> + '_ {
        let end = offset + len as u64;
        self.files.iter().filter_map(move |slot| {
            let start = slot.offset.max(offset);
            let stop = (slot.offset + slot.length).min(end);
            if start >= stop {
                return None;
            }
            let buf = (start - offset) as usize..(stop - offset) as usize;
            Some((slot, start - slot.offset, buf))
        })
    }

    /// Write `bytes` at the absolute `offset`, splitting them across files.
    pub async fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), Error> {
        let slices = self.overlapping(offset, bytes.len());
        for (slot, file_offset, range) in slices {
            let mut file = Self::open_file(&slot.path).await?;
            file.seek(SeekFrom::Start(file_offset)).await?;
            file.write_all(&bytes[range]).await?;
            file.flush().await?;
        }
        Ok(())
    }

    /// Read whatever already exists on disk into `buf`, which spans the whole
    /// content. Returns true if any file was found.
    pub async fn load(&self, buf: &mut [u8]) -> Result<bool, Error> {
        let mut found = false;
        for (slot, _, range) in self.overlapping(0, buf.len()) {
            let mut file = match File::open(&slot.path).await {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            found = true;

            let dst = &mut buf[range];
            let mut pos = 0;
            while pos < dst.len() {
                let n = file.read(&mut dst[pos..]).await?;
                if n == 0 {
                    break;
                }
                pos += n;
            }
            debug!("loaded {pos} bytes of {:?}", slot.path);
        }
        Ok(found)
    }

    /// Flush every existing file to the device.
    pub async fn close(&self) -> Result<(), Error> {
        for slot in self.files.iter() {
            match OpenOptions::new().write(true).open(&slot.path).await {
                Ok(file) => file.sync_all().await?,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Delete the files of the content, and the folders they leave empty.
    pub async fn remove(&self) -> Result<(), Error> {
        for slot in self.files.iter() {
            match remove_file(&slot.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let mut dir = slot.path.parent();
            while let Some(d) = dir {
                if d == self.root || !d.starts_with(&self.root) {
                    break;
                }
                // fails when it is not empty, which ends the walk
                if remove_dir(d).await.is_err() {
                    break;
                }
                dir = d.parent();
            }
        }
        Ok(())
    }
}
