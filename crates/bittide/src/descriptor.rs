//! The content descriptor: piece hashes and file layout of a torrent.
//!
//! Descriptors are usually decoded from the bencoded `info` dictionary, which
//! is also what the metadata extension transfers between peers and what the
//! info hash is computed over.
use std::{
    fmt::Display,
    ops::Deref,
    path::{Component, Path, PathBuf},
};

use bendy::{
    decoding::{self, FromBencode, Object, ResultExt},
    encoding::{self, AsString, SingleItemEncoder, ToBencode},
};

use crate::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Hash of the bencoded info dictionary.
    pub fn from_metadata(metadata: &[u8]) -> Self {
        InfoHash(sha1_smol::Sha1::from(metadata).digest().bytes())
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<&str> for InfoHash {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let buff = hex::decode(value)
            .map_err(|e| Error::InvalidContentDescriptor(e.to_string()))?;
        let hash: [u8; 20] = buff.try_into().map_err(|_| {
            Error::InvalidContentDescriptor(
                "The infohash must have exactly 20 bytes".into(),
            )
        })?;
        Ok(InfoHash(hash))
    }
}

/// One file of the content, addressed in the synthetic byte space of the
/// whole torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// Relative path, including the torrent directory for multi file
    /// torrents.
    pub path: PathBuf,
    pub length: u64,
    /// Absolute offset of the first byte.
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDescriptor {
    pub name: String,
    pub piece_length: u32,
    pub last_piece_length: u32,
    pub pieces: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub length: u64,
}

impl ContentDescriptor {
    /// Decode and validate a bencoded info dictionary.
    pub fn from_metadata(metadata: &[u8]) -> Result<Self, Error> {
        let info = Info::from_bencode(metadata)?;
        Self::try_from(info)
    }

    /// Describe a single file made of `data`.
    pub fn single_file(name: &str, piece_length: u32, data: &[u8]) -> Self {
        let piece_length = piece_length.max(1);
        let pieces: Vec<[u8; 20]> = data
            .chunks(piece_length as usize)
            .map(|c| sha1_smol::Sha1::from(c).digest().bytes())
            .collect();
        let len = data.len() as u64;
        let last_piece_length = match len % piece_length as u64 {
            0 if len > 0 => piece_length,
            r => r as u32,
        };

        Self {
            name: name.to_owned(),
            piece_length,
            last_piece_length,
            pieces,
            files: vec![FileEntry {
                name: name.to_owned(),
                path: PathBuf::from(name),
                length: len,
                offset: 0,
            }],
            length: len,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_len(&self, index: usize) -> u32 {
        if index + 1 == self.pieces.len() {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }

    /// Check that the layout is self consistent.
    pub fn validate(&self) -> Result<(), Error> {
        let err = |s: &str| Err(Error::InvalidContentDescriptor(s.to_owned()));

        if self.piece_length == 0 {
            return err("piece length must be positive");
        }
        if self.pieces.is_empty() || self.length == 0 {
            return err("content must have at least one piece");
        }
        let expected =
            self.length.div_ceil(self.piece_length as u64) as usize;
        if expected != self.pieces.len() {
            return err("number of piece hashes does not match the length");
        }
        let last = self.length
            - (self.pieces.len() as u64 - 1) * self.piece_length as u64;
        if last != self.last_piece_length as u64 {
            return err("last piece length does not match the length");
        }

        let mut offset = 0;
        for file in &self.files {
            if file.offset != offset {
                return err("files are not contiguous");
            }
            offset += file.length;
        }
        if offset != self.length {
            return err("file lengths do not add up to the total length");
        }
        Ok(())
    }

    /// Encode back into the bencoded info dictionary.
    pub fn to_metadata(&self) -> Result<Vec<u8>, Error> {
        Ok(Info::from(self).to_bencode()?)
    }
}

/// Bencode shape of the `info` dictionary.
#[derive(Debug, PartialEq, Clone, Default)]
struct Info {
    piece_length: u32,
    /// Concatenation of all 20-byte SHA1 hash values, one per piece.
    pieces: Vec<u8>,
    name: String,
    /// Single file format only.
    file_length: Option<u64>,
    /// Multi file format only.
    files: Option<Vec<InfoFile>>,
}

#[derive(Debug, PartialEq, Clone, Default)]
struct InfoFile {
    length: u64,
    path: Vec<String>,
}

impl TryFrom<Info> for ContentDescriptor {
    type Error = Error;

    fn try_from(info: Info) -> Result<Self, Self::Error> {
        if !is_plain_component(&info.name) {
            return Err(Error::InvalidContentDescriptor(format!(
                "unsafe name {:?}",
                info.name
            )));
        }
        if info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidContentDescriptor(
                "pieces is not a multiple of 20 bytes".into(),
            ));
        }
        let pieces: Vec<[u8; 20]> = info
            .pieces
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let files = match (info.file_length, info.files) {
            (Some(length), None) => vec![FileEntry {
                name: info.name.clone(),
                path: PathBuf::from(&info.name),
                length,
                offset: 0,
            }],
            (None, Some(files)) => {
                let mut offset = 0;
                let mut entries = Vec::with_capacity(files.len());
                for f in files {
                    let Some(name) = f.path.last().cloned() else {
                        return Err(Error::InvalidContentDescriptor(
                            "file with an empty path".into(),
                        ));
                    };
                    if !f.path.iter().all(|c| is_plain_component(c)) {
                        return Err(Error::InvalidContentDescriptor(format!(
                            "unsafe file path {:?}",
                            f.path
                        )));
                    }
                    let mut path = PathBuf::from(&info.name);
                    path.extend(&f.path);
                    entries.push(FileEntry {
                        name,
                        path,
                        length: f.length,
                        offset,
                    });
                    offset = offset.checked_add(f.length).ok_or_else(|| {
                        Error::InvalidContentDescriptor(
                            "content length overflows".into(),
                        )
                    })?;
                }
                entries
            }
            _ => {
                let msg = "exactly one of `length` and `files` must be present";
                return Err(Error::InvalidContentDescriptor(msg.into()));
            }
        };

        let length = files.last().map_or(0, |f| f.offset + f.length);
        let piece_length = info.piece_length;
        let last_piece_length = (pieces.len() as u64)
            .checked_sub(1)
            .and_then(|full| full.checked_mul(piece_length as u64))
            .and_then(|full| length.checked_sub(full))
            .filter(|last| *last <= piece_length as u64)
            .unwrap_or(0) as u32;

        let descriptor = ContentDescriptor {
            name: info.name,
            piece_length,
            last_piece_length,
            pieces,
            files,
            length,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// A single normal path component: no separators, no `..`, not absolute.
fn is_plain_component(s: &str) -> bool {
    let mut components = Path::new(s).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl From<&ContentDescriptor> for Info {
    fn from(d: &ContentDescriptor) -> Self {
        let pieces = d.pieces.iter().flatten().copied().collect();
        let single =
            d.files.len() == 1 && d.files[0].path == PathBuf::from(&d.name);

        let (file_length, files) = if single {
            (Some(d.length), None)
        } else {
            let files = d
                .files
                .iter()
                .map(|f| InfoFile {
                    length: f.length,
                    path: f
                        .path
                        .strip_prefix(&d.name)
                        .unwrap_or(&f.path)
                        .iter()
                        .map(|c| c.to_string_lossy().into_owned())
                        .collect(),
                })
                .collect();
            (None, Some(files))
        };

        Info {
            piece_length: d.piece_length,
            pieces,
            name: d.name.clone(),
            file_length,
            files,
        }
    }
}

impl ToBencode for InfoFile {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.length)?;
            e.emit_pair(b"path", &self.path)
        })?;
        Ok(())
    }
}

impl FromBencode for InfoFile {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict_dec = object.try_into_dictionary()?;
        let mut length = None;
        let mut path = None;

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"length", value) => {
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"path", value) => {
                    path = Vec::<String>::decode_bencode_object(value)
                        .context("path")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let length =
            length.ok_or_else(|| decoding::Error::missing_field("length"))?;
        let path = path.ok_or_else(|| decoding::Error::missing_field("path"))?;

        Ok(Self { length, path })
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), encoding::Error> {
        // keys must be emitted in lexicographic order
        encoder.emit_dict(|mut e| {
            if let Some(files) = &self.files {
                e.emit_pair(b"files", files)?;
            }
            if let Some(file_length) = &self.file_length {
                e.emit_pair(b"length", file_length)?;
            }
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(&self.pieces))
        })?;
        Ok(())
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut files = None;
        let mut file_length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"files", value) => {
                    files = Vec::<InfoFile>::decode_bencode_object(value)
                        .context("files")
                        .map(Some)?;
                }
                (b"length", value) => {
                    file_length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = u32::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                _ => {}
            }
        }

        let name = name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece_length"))?;
        let pieces =
            pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        Ok(Info { files, file_length, name, piece_length, pieces })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file_layout() -> Result<(), Error> {
        let data = vec![7u8; 16384 + 1000];
        let d = ContentDescriptor::single_file("a.bin", 16384, &data);

        assert_eq!(d.num_pieces(), 2);
        assert_eq!(d.piece_len(0), 16384);
        assert_eq!(d.piece_len(1), 1000);
        assert_eq!(d.last_piece_length, 1000);
        assert_eq!(d.length, 17384);
        let digest = sha1_smol::Sha1::from(&data[..16384]).digest().bytes();
        assert_eq!(d.pieces[0], digest);
        d.validate()?;

        // exact multiple keeps a full last piece
        let d = ContentDescriptor::single_file("b.bin", 4, &[1u8; 8]);
        assert_eq!(d.num_pieces(), 2);
        assert_eq!(d.last_piece_length, 4);
        d.validate()
    }

    #[test]
    fn metadata_survives_bencode() -> Result<(), Error> {
        let data = vec![3u8; 40_000];
        let d = ContentDescriptor::single_file("movie.mkv", 16384, &data);
        let metadata = d.to_metadata()?;

        assert_eq!(ContentDescriptor::from_metadata(&metadata)?, d);
        assert_eq!(
            InfoHash::from_metadata(&metadata).0,
            sha1_smol::Sha1::from(&metadata).digest().bytes()
        );
        Ok(())
    }

    #[test]
    fn multi_file_offsets() -> Result<(), Error> {
        let info = Info {
            piece_length: 10,
            pieces: vec![0u8; 20 * 3],
            name: "dir".into(),
            file_length: None,
            files: Some(vec![
                InfoFile { length: 12, path: vec!["a.txt".into()] },
                InfoFile { length: 0, path: vec!["empty".into()] },
                InfoFile {
                    length: 13,
                    path: vec!["sub".into(), "b.txt".into()],
                },
            ]),
        };
        let bytes = info.to_bencode()?;
        let d = ContentDescriptor::from_metadata(&bytes)?;

        assert_eq!(d.length, 25);
        assert_eq!(d.last_piece_length, 5);
        assert_eq!(d.files[0].offset, 0);
        assert_eq!(d.files[1].offset, 12);
        assert_eq!(d.files[2].offset, 12);
        assert_eq!(d.files[2].name, "b.txt");
        assert_eq!(d.files[2].path, PathBuf::from("dir/sub/b.txt"));

        // and back to the same bytes
        assert_eq!(d.to_metadata()?, bytes);
        Ok(())
    }

    #[test]
    fn invalid_descriptors() {
        let invalid = |r: Result<(), Error>| {
            matches!(r, Err(Error::InvalidContentDescriptor(_)))
        };
        let mut d = ContentDescriptor::single_file("a", 4, &[1u8; 10]);
        d.pieces.pop();
        assert!(invalid(d.validate()));

        let mut d = ContentDescriptor::single_file("a", 4, &[1u8; 10]);
        d.files[0].offset = 1;
        assert!(invalid(d.validate()));

        let mut d = ContentDescriptor::single_file("a", 4, &[1u8; 10]);
        d.last_piece_length = 4;
        assert!(invalid(d.validate()));

        assert!(matches!(
            ContentDescriptor::from_metadata(b"not bencode"),
            Err(Error::InvalidContentDescriptor(_))
        ));
    }

    #[test]
    fn more_hashes_than_length() -> Result<(), Error> {
        let info = Info {
            piece_length: 16384,
            pieces: vec![0u8; 40],
            name: "a".into(),
            file_length: Some(100),
            files: None,
        };
        let r = ContentDescriptor::from_metadata(&info.to_bencode()?);
        assert!(matches!(r, Err(Error::InvalidContentDescriptor(_))));

        // and fewer
        let info = Info { file_length: Some(40_000), ..info };
        let r = ContentDescriptor::from_metadata(&info.to_bencode()?);
        assert!(matches!(r, Err(Error::InvalidContentDescriptor(_))));
        Ok(())
    }

    #[test]
    fn paths_stay_inside_the_torrent() -> Result<(), Error> {
        let info = |name: &str, path: Vec<&str>| Info {
            piece_length: 10,
            pieces: vec![0u8; 20],
            name: name.into(),
            file_length: None,
            files: Some(vec![InfoFile {
                length: 5,
                path: path.into_iter().map(String::from).collect(),
            }]),
        };

        for bad in [
            info("t", vec!["..", "..", "evil"]),
            info("t", vec!["/etc", "passwd"]),
            info("t", vec!["sub/../../evil"]),
            info("t", vec!["."]),
            info("..", vec!["evil"]),
            info("/tmp", vec!["evil"]),
            info("", vec!["evil"]),
        ] {
            let r = ContentDescriptor::from_metadata(&bad.to_bencode()?);
            assert!(
                matches!(r, Err(Error::InvalidContentDescriptor(_))),
                "{bad:?} was accepted"
            );
        }

        let d = ContentDescriptor::from_metadata(
            &info("t", vec!["sub", "ok.txt"]).to_bencode()?,
        )?;
        assert_eq!(d.files[0].path, PathBuf::from("t/sub/ok.txt"));
        Ok(())
    }

    #[test]
    fn info_hash_hex() -> Result<(), Error> {
        let hash = InfoHash([0xab; 20]);
        assert_eq!(hash.to_string(), "ab".repeat(20));
        assert_eq!(InfoHash::try_from(hash.to_string().as_str())?, hash);
        assert!(InfoHash::try_from("abcd").is_err());
        Ok(())
    }
}
