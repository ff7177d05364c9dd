use std::{io, net::SocketAddr};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::engine::EngineMsg;

impl From<bendy::decoding::Error> for Error {
    fn from(value: bendy::decoding::Error) -> Self {
        Self::InvalidContentDescriptor(value.to_string())
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(_value: bendy::encoding::Error) -> Self {
        Self::BencodeError
    }
}

impl From<mpsc::error::SendError<EngineMsg>> for Error {
    fn from(_value: mpsc::error::SendError<EngineMsg>) -> Self {
        Self::SendErrorEngine
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Piece index `{0}` is out of range")]
    InvalidIndex(usize),

    #[error("Offset `{offset}` is not a block boundary of piece `{index}`")]
    InvalidOffset { index: usize, offset: u32 },

    #[error(
        "A block of `{len}` bytes does not fit at offset `{offset}` of piece \
         `{index}`"
    )]
    InvalidBlockSize { index: usize, offset: u32, len: usize },

    #[error("The range `{start}..={end}` is not a valid range of pieces")]
    InvalidRange { start: usize, end: usize },

    #[error("File index `{0}` is out of range")]
    InvalidFile(usize),

    #[error("Piece `{0}` was not verified yet")]
    PieceNotVerified(usize),

    #[error("The storage is still verifying existing data")]
    StorageVerifying,

    #[error("The metadata of this content is not known yet")]
    NoMetadata,

    #[error("The content descriptor is not valid: {0}")]
    InvalidContentDescriptor(String),

    #[error("Failed to decode or encode the bencode buffer")]
    BencodeError,

    #[error("The request took to long to arrive")]
    RequestTimeout,

    #[error("The peer closed the connection")]
    PeerClosed,

    #[error("The peer is choked and cannot request blocks")]
    PeerChoked,

    #[error("The peer `{addr}` is blocked: {reason}")]
    PeerBlocked { addr: SocketAddr, reason: String },

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format"
    )]
    ConfigDeserializeError(#[from] toml::de::Error),

    #[error("Could not serialize the configuration")]
    ConfigSerializeError(#[from] toml::ser::Error),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error("Could not send message to the engine")]
    SendErrorEngine,

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),

    #[error("A background task of the engine failed")]
    JoinError(#[from] tokio::task::JoinError),
}
