use std::{
    net::SocketAddr,
    ops::Range,
    path::PathBuf,
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    bitfield::Bitfield,
    descriptor::InfoHash,
    error::Error,
    peer::{PeerKey, PeerLink, WireCommand, WireEvent},
    selection::Notify,
};

/// What the engine starts from.
#[derive(Debug, Clone)]
pub enum ContentSource {
    /// Bencoded info dictionary.
    Metadata(Bytes),
    /// Info dictionary and the whole content, to be served to others.
    Seed { metadata: Bytes, data: Bytes },
    /// Only the info hash, the metadata is fetched from peers.
    InfoHash(InfoHash),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineStatus {
    #[default]
    AwaitingMetadata,
    /// Hashing data that already existed.
    Verifying,
    Downloading,
    Seeding,
    /// The content can not be downloaded, see the `Error` event.
    Error,
    Destroyed,
}

/// Broadcasted to every subscriber of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The metadata is known, from the start or fetched from a peer.
    Metadata,
    Verifying { percent_done: f64, percent_verified: f64 },
    /// Existing data was checked, the engine is downloading or seeding.
    Ready,
    /// Every piece is verified.
    Done,

    /// A downloaded piece was verified.
    Piece(usize),
    VerificationFailed(usize),
    FileDone(usize),

    /// `from` lost its reservations on piece `index` to the faster `to`.
    Hotswap { from: SocketAddr, to: SocketAddr, index: usize },
    BlockedPeer { addr: SocketAddr, reason: String },
    PeerQueued(SocketAddr),
    DhtPort { addr: SocketAddr, port: u16 },

    Interested,
    Uninterested,
    /// There is nothing left to download.
    Idle,

    Warning(String),
    StorageError(String),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub status: EngineStatus,
    pub length: u64,
    /// Bytes of pieces written, see [`StorageEngine::downloaded`].
    ///
    /// [`StorageEngine::downloaded`]: crate::storage::StorageEngine::downloaded
    pub downloaded: u64,
    pub uploaded: u64,
    /// Every byte of every block received, including duplicates and pieces
    /// that failed verification.
    pub received: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub peers: usize,
    pub num_missing: usize,
    /// From 0.0 to 1.0.
    pub progress: f64,
    pub ratio: f64,
    pub time_remaining: Option<Duration>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
    pub pieces: Range<usize>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceInfo {
    pub index: usize,
    pub length: usize,
    pub blocks: usize,
    pub blocks_written: usize,
    pub verified: bool,
}

/// Messages handled by the engine task.
pub enum EngineMsg {
    Select {
        start: usize,
        end: usize,
        priority: i32,
        notify: Option<Notify>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Deselect {
        start: usize,
        end: usize,
        priority: i32,
        reply: oneshot::Sender<Result<bool, Error>>,
    },
    Critical {
        start: usize,
        end: usize,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    SelectFile {
        file: usize,
        priority: i32,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    DeselectFile {
        file: usize,
        priority: i32,
        reply: oneshot::Sender<Result<bool, Error>>,
    },
    /// Bytes of a file, relative to its start. Answered once the pieces
    /// covering the range are verified.
    ReadFile {
        file: usize,
        range: Option<Range<u64>>,
        reply: oneshot::Sender<Result<Bytes, Error>>,
    },
    Read {
        index: usize,
        range: Option<Range<usize>>,
        reply: oneshot::Sender<Result<Bytes, Error>>,
    },

    /// Candidate address from discovery, trackers or peer exchange.
    AddPeer(SocketAddr, oneshot::Sender<Result<(), Error>>),
    QueuedPeers(oneshot::Sender<Vec<SocketAddr>>),
    PeerDialing(SocketAddr),
    PeerDialFailed(SocketAddr),
    PeerConnected {
        addr: SocketAddr,
        supports_dht: bool,
        commands: mpsc::UnboundedSender<WireCommand>,
        reply: oneshot::Sender<Result<PeerLink, Error>>,
    },
    Wire(PeerKey, WireEvent),

    AnnounceWarning(String),
    Stats(oneshot::Sender<EngineStats>),
    Files(oneshot::Sender<Result<Vec<FileInfo>, Error>>),
    PieceInfo(usize, oneshot::Sender<Result<PieceInfo, Error>>),
    Bitfield(oneshot::Sender<Option<Bitfield>>),
    /// Run a choking pass now.
    Rechoke,
    /// Stop the engine, closing peers and storage. With `remove` the stored
    /// files are deleted.
    Destroy { remove: bool, reply: oneshot::Sender<Result<(), Error>> },
}

/// Cheap to clone handle to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    pub(crate) tx: mpsc::Sender<EngineMsg>,
    pub(crate) events: broadcast::Sender<EngineEvent>,
    pub(crate) info_hash: InfoHash,
}

impl EngineHandle {
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn ask<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> EngineMsg,
    ) -> Result<T, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(msg(otx)).await?;
        Ok(orx.await?)
    }

    /// Select pieces `start..=end`. Higher priorities are scheduled first.
    pub async fn select(
        &self,
        start: usize,
        end: usize,
        priority: i32,
        notify: Option<Notify>,
    ) -> Result<(), Error> {
        self.ask(|reply| EngineMsg::Select {
            start,
            end,
            priority,
            notify,
            reply,
        })
        .await?
    }

    /// Returns false if no selection matched.
    pub async fn deselect(
        &self,
        start: usize,
        end: usize,
        priority: i32,
    ) -> Result<bool, Error> {
        self.ask(|reply| EngineMsg::Deselect { start, end, priority, reply })
            .await?
    }

    pub async fn critical(
        &self,
        start: usize,
        end: usize,
    ) -> Result<(), Error> {
        self.ask(|reply| EngineMsg::Critical { start, end, reply }).await?
    }

    pub async fn select_file(
        &self,
        file: usize,
        priority: i32,
    ) -> Result<(), Error> {
        self.ask(|reply| EngineMsg::SelectFile { file, priority, reply })
            .await?
    }

    pub async fn deselect_file(
        &self,
        file: usize,
        priority: i32,
    ) -> Result<bool, Error> {
        self.ask(|reply| EngineMsg::DeselectFile { file, priority, reply })
            .await?
    }

    /// Wait for and return bytes of a file, the whole file if `range` is
    /// `None`.
    pub async fn read_file(
        &self,
        file: usize,
        range: Option<Range<u64>>,
    ) -> Result<Bytes, Error> {
        self.ask(|reply| EngineMsg::ReadFile { file, range, reply }).await?
    }

    /// Bytes of a verified piece.
    pub async fn read(
        &self,
        index: usize,
        range: Option<Range<usize>>,
    ) -> Result<Bytes, Error> {
        self.ask(|reply| EngineMsg::Read { index, range, reply }).await?
    }

    pub async fn add_peer(&self, addr: SocketAddr) -> Result<(), Error> {
        self.ask(|reply| EngineMsg::AddPeer(addr, reply)).await?
    }

    /// Addresses waiting to be dialed.
    pub async fn queued_peers(&self) -> Result<Vec<SocketAddr>, Error> {
        self.ask(EngineMsg::QueuedPeers).await
    }

    pub async fn peer_dialing(&self, addr: SocketAddr) -> Result<(), Error> {
        Ok(self.tx.send(EngineMsg::PeerDialing(addr)).await?)
    }

    pub async fn peer_dial_failed(
        &self,
        addr: SocketAddr,
    ) -> Result<(), Error> {
        Ok(self.tx.send(EngineMsg::PeerDialFailed(addr)).await?)
    }

    /// Attach a connected peer. The transport forwards what the peer says
    /// through the returned link and executes the commands coming out of the
    /// receiver.
    pub async fn connect_peer(
        &self,
        addr: SocketAddr,
        supports_dht: bool,
    ) -> Result<(PeerLink, mpsc::UnboundedReceiver<WireCommand>), Error> {
        let (commands, rx) = mpsc::unbounded_channel();
        let link = self
            .ask(|reply| EngineMsg::PeerConnected {
                addr,
                supports_dht,
                commands,
                reply,
            })
            .await??;
        Ok((link, rx))
    }

    /// Report a failure of discovery or of a tracker.
    pub async fn warn(&self, msg: impl Into<String>) -> Result<(), Error> {
        Ok(self.tx.send(EngineMsg::AnnounceWarning(msg.into())).await?)
    }

    pub async fn stats(&self) -> Result<EngineStats, Error> {
        self.ask(EngineMsg::Stats).await
    }

    pub async fn files(&self) -> Result<Vec<FileInfo>, Error> {
        self.ask(EngineMsg::Files).await?
    }

    pub async fn piece_info(&self, index: usize) -> Result<PieceInfo, Error> {
        self.ask(|reply| EngineMsg::PieceInfo(index, reply)).await?
    }

    /// Verified pieces, `None` while the metadata is not known.
    pub async fn bitfield(&self) -> Result<Option<Bitfield>, Error> {
        self.ask(EngineMsg::Bitfield).await
    }

    pub async fn rechoke(&self) -> Result<(), Error> {
        Ok(self.tx.send(EngineMsg::Rechoke).await?)
    }

    pub async fn destroy(&self, remove: bool) -> Result<(), Error> {
        self.ask(|reply| EngineMsg::Destroy { remove, reply }).await?
    }
}
