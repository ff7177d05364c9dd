use std::{fmt::Display, net::SocketAddr, time::Duration};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{
    bitfield::Bitfield,
    engine::EngineMsg,
    error::Error,
    peer::BlockInfo,
};

/// Identifies a connected peer inside one engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PeerKey(pub u64);

impl Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where the bytes of a requested block are delivered.
pub type BlockReply = oneshot::Sender<Result<Bytes, Error>>;

/// Events the peer transport delivers to the engine, already decoded from
/// the wire.
#[derive(Debug)]
pub enum WireEvent {
    Bitfield(Bitfield),
    Have(usize),
    /// The peer wants a block from us, the bytes go into `reply`.
    Request { block: BlockInfo, reply: BlockReply },
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// DHT port of the peer.
    Port(u16),
    /// The connection went silent for too long.
    Timeout,
    Close,
    /// Info dictionary fetched from this peer with the metadata extension.
    Metadata(Bytes),
    /// The peer asks for our info dictionary.
    MetadataRequest(oneshot::Sender<Option<Bytes>>),
    /// Addresses gossiped by the peer exchange extension.
    PeerExchange(Vec<SocketAddr>),
}

/// Commands the engine gives to the peer transport.
#[derive(Debug)]
pub enum WireCommand {
    /// Ask the peer for a block. The transport answers on `reply`, or drops
    /// it when the connection dies.
    Request { block: BlockInfo, reply: BlockReply },
    Cancel(BlockInfo),
    Have(usize),
    Bitfield(Bitfield),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    SetRequestTimeout(Duration),
    SetKeepAlive(bool),
    /// Our DHT port.
    Port(u16),
    /// Fetch the info dictionary with the metadata extension, the result
    /// comes back as [`WireEvent::Metadata`].
    FetchMetadata,
    Close,
}

/// Handle given to the transport of a connected peer, used to forward what
/// the peer says to the engine.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub key: PeerKey,
    pub addr: SocketAddr,
    tx: mpsc::Sender<EngineMsg>,
}

impl PeerLink {
    pub(crate) fn new(
        key: PeerKey,
        addr: SocketAddr,
        tx: mpsc::Sender<EngineMsg>,
    ) -> Self {
        Self { key, addr, tx }
    }

    pub async fn send(&self, event: WireEvent) -> Result<(), Error> {
        self.tx.send(EngineMsg::Wire(self.key, event)).await?;
        Ok(())
    }
}
