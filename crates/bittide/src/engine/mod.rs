//! The download engine: one task owning the storage, the selections and the
//! peers of a torrent.
//!
//! Every mutation happens inside [`DownloadEngine::run`]. Wire events, block
//! replies, hashing results and timers all come back to that loop, which
//! handles them one at a time and then drains the deferred queue, so any
//! number of triggers inside one iteration causes a single scheduling pass.
mod choke;
mod deferred;
mod reservations;
mod schedule;
mod types;

// re-exports
pub use types::*;

use std::{net::SocketAddr, ops::ControlFlow, ops::Range, time::Duration};

use bytes::Bytes;
use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use hashbrown::{HashMap, HashSet};
use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    select,
    sync::{broadcast, mpsc, oneshot},
    task::{JoinError, JoinHandle, JoinSet},
    time::{interval, interval_at, Instant},
};
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    blocklist::Blocklist,
    config::Config,
    counter::Counter,
    descriptor::{ContentDescriptor, InfoHash},
    error::Error,
    peer::{BlockInfo, PeerKey, PeerLink, PeerState, WireCommand, WireEvent},
    rarity::RarityMap,
    selection::SelectionManager,
    storage::{StorageEngine, StorageEvent, MAX_BLOCK_LEN},
};

use choke::{Candidate, Choker};
use deferred::{Deferred, DeferredQueue};
use reservations::Reservations;
use schedule::Completed;

const MSG_BOUND: usize = 256;
const EVENT_CAPACITY: usize = 1024;

/// Pieces hashed at the same time while checking existing data.
const RESUME_JOBS: usize = 4;

/// Priority of the selections made to answer file reads.
const READ_PRIORITY: i32 = 1;

/// Bytes at the start of a read that are flagged critical.
const CRITICAL_BYTES: usize = 1024 * 1024;

/// Bits of a peer's bitfield kept while the metadata is unknown.
pub const MAX_UNKNOWN_PIECES: usize = 1 << 20;

/// Everything that exists once the metadata is known.
struct Content {
    descriptor: ContentDescriptor,
    metadata: Bytes,
    storage: StorageEngine,
    rarity: RarityMap,
    selections: SelectionManager,
    reservations: Reservations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashKind {
    /// Data that was already there when the engine started.
    Existing,
    Downloaded,
}

#[derive(Debug)]
struct HashJob {
    index: usize,
    digest: [u8; 20],
    kind: HashKind,
}

fn spawn_hash(
    hashing: &mut JoinSet<HashJob>,
    index: usize,
    bytes: Vec<u8>,
    kind: HashKind,
) {
    hashing.spawn_blocking(move || HashJob {
        index,
        digest: sha1_smol::Sha1::from(&bytes).digest().bytes(),
        kind,
    });
}

/// `part / whole`, zero when `whole` is.
fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Progress of the check of existing data.
#[derive(Debug, Default)]
struct Resume {
    next: usize,
    checked: usize,
}

struct PendingRead {
    /// Absolute byte range.
    range: Range<u64>,
    pieces: Range<usize>,
    reply: oneshot::Sender<Result<Bytes, Error>>,
}

pub struct DownloadEngine {
    config: Config,
    info_hash: InfoHash,
    status: EngineStatus,
    content: Option<Content>,
    /// Content given by [`ContentSource::Seed`], loaded into the storage
    /// when verification starts.
    seed: Option<Bytes>,
    resume: Option<Resume>,

    peers: HashMap<PeerKey, PeerState>,
    next_key: u64,
    queued: Vec<SocketAddr>,
    dialing: HashSet<SocketAddr>,
    blocklist: Blocklist,
    choker: Choker,

    counter: Counter,
    received: u64,
    interested: bool,
    idle: bool,
    pending_reads: Vec<PendingRead>,

    in_flight: FuturesUnordered<BoxFuture<'static, Completed>>,
    hashing: JoinSet<HashJob>,
    flushes: JoinSet<Result<(), Error>>,
    choke_timers: DelayQueue<PeerKey>,
    deferred: DeferredQueue,
    rng: StdRng,

    events: broadcast::Sender<EngineEvent>,
    tx: mpsc::WeakSender<EngineMsg>,
    rx: mpsc::Receiver<EngineMsg>,
}

impl DownloadEngine {
    pub fn new(
        config: Config,
        source: ContentSource,
    ) -> Result<(Self, EngineHandle), Error> {
        let (info_hash, metadata, seed) = match source {
            ContentSource::Metadata(metadata) => {
                (InfoHash::from_metadata(&metadata), Some(metadata), None)
            }
            ContentSource::Seed { metadata, data } => {
                (InfoHash::from_metadata(&metadata), Some(metadata), Some(data))
            }
            ContentSource::InfoHash(info_hash) => (info_hash, None, None),
        };

        let (tx, rx) = mpsc::channel(MSG_BOUND);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut engine = Self {
            blocklist: Blocklist::new(config.blocklist.clone()),
            choker: Choker::new(config.optimistic_duration),
            config,
            info_hash,
            status: EngineStatus::AwaitingMetadata,
            content: None,
            seed,
            resume: None,
            peers: HashMap::new(),
            next_key: 0,
            queued: Vec::new(),
            dialing: HashSet::new(),
            counter: Counter::default(),
            received: 0,
            interested: false,
            idle: false,
            pending_reads: Vec::new(),
            in_flight: FuturesUnordered::new(),
            hashing: JoinSet::new(),
            flushes: JoinSet::new(),
            choke_timers: DelayQueue::new(),
            deferred: DeferredQueue::default(),
            rng: StdRng::from_entropy(),
            events: events.clone(),
            tx: tx.downgrade(),
            rx,
        };

        if let Some(metadata) = metadata {
            let descriptor = ContentDescriptor::from_metadata(&metadata)?;
            engine.install(descriptor, metadata)?;
        }

        Ok((engine, EngineHandle { tx, events, info_hash }))
    }

    /// Create an engine and run it on a new task.
    pub fn spawn(
        config: Config,
        source: ContentSource,
    ) -> Result<(EngineHandle, JoinHandle<Result<(), Error>>), Error> {
        let (engine, handle) = Self::new(config, source)?;
        Ok((handle, tokio::spawn(engine.run())))
    }

    /// Run the event loop until the engine is destroyed, or every handle is
    /// dropped.
    #[tracing::instrument(
        name = "engine",
        skip_all,
        fields(info = ?self.info_hash)
    )]
    pub async fn run(mut self) -> Result<(), Error> {
        self.start_verification().await;
        self.run_deferred();

        let min = Duration::from_millis(1);
        let mut heartbeat = interval(self.config.heartbeat().max(min));
        let period = self.config.rechoke_interval().max(min);
        let mut rechoke = interval_at(Instant::now() + period, period);

        loop {
            select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    if self.handle_msg(msg).await.is_break() {
                        return Ok(());
                    }
                }
                Some(done) = self.in_flight.next(),
                    if !self.in_flight.is_empty() => {
                    self.on_block(done);
                }
                Some(job) = self.hashing.join_next(),
                    if !self.hashing.is_empty() => {
                    match job {
                        Ok(job) => self.on_hash(job),
                        Err(e) => warn!("hashing job failed: {e}"),
                    }
                }
                Some(flush) = self.flushes.join_next(),
                    if !self.flushes.is_empty() => {
                    self.on_flush(flush);
                }
                Some(expired) = self.choke_timers.next(),
                    if !self.choke_timers.is_empty() => {
                    self.on_choke_timeout(expired.into_inner());
                }
                _ = heartbeat.tick() => {
                    self.heartbeat();
                }
                _ = rechoke.tick() => {
                    self.rechoke();
                }
            }
            self.run_deferred();
        }

        debug!("every handle was dropped");
        self.destroy(false).await
    }

    async fn handle_msg(&mut self, msg: EngineMsg) -> ControlFlow<()> {
        match msg {
            EngineMsg::Select { start, end, priority, notify, reply } => {
                let r = self
                    .selections_mut()
                    .and_then(|s| s.select(start, end, priority, notify));
                if r.is_ok() {
                    self.selections_changed();
                }
                let _ = reply.send(r);
            }
            EngineMsg::Deselect { start, end, priority, reply } => {
                let r = self
                    .selections_mut()
                    .map(|s| s.deselect(start, end, priority));
                self.selections_changed();
                let _ = reply.send(r);
            }
            EngineMsg::Critical { start, end, reply } => {
                let r =
                    self.selections_mut().and_then(|s| s.critical(start, end));
                self.deferred.push(Deferred::Update);
                let _ = reply.send(r);
            }
            EngineMsg::SelectFile { file, priority, reply } => {
                let r = match self.file_pieces(file) {
                    Ok(pieces) if pieces.is_empty() => Ok(()),
                    Ok(pieces) => self.selections_mut().and_then(|s| {
                        s.select(pieces.start, pieces.end - 1, priority, None)
                    }),
                    Err(e) => Err(e),
                };
                self.selections_changed();
                let _ = reply.send(r);
            }
            EngineMsg::DeselectFile { file, priority, reply } => {
                let r = match self.file_pieces(file) {
                    Ok(pieces) if pieces.is_empty() => Ok(false),
                    Ok(pieces) => self.selections_mut().map(|s| {
                        s.deselect(pieces.start, pieces.end - 1, priority)
                    }),
                    Err(e) => Err(e),
                };
                self.selections_changed();
                let _ = reply.send(r);
            }
            EngineMsg::ReadFile { file, range, reply } => {
                self.read_file(file, range, reply);
            }
            EngineMsg::Read { index, range, reply } => {
                let r = self.storage().and_then(|s| s.read(index, range));
                let _ = reply.send(r);
            }
            EngineMsg::AddPeer(addr, reply) => {
                let _ = reply.send(self.add_peer(addr));
            }
            EngineMsg::QueuedPeers(reply) => {
                let _ = reply.send(self.queued.clone());
            }
            EngineMsg::PeerDialing(addr) => {
                self.queued.retain(|a| *a != addr);
                self.dialing.insert(addr);
            }
            EngineMsg::PeerDialFailed(addr) => {
                debug!("dial to {addr} failed");
                self.dialing.remove(&addr);
            }
            EngineMsg::PeerConnected {
                addr,
                supports_dht,
                commands,
                reply,
            } => {
                let r = self.connect_peer(addr, supports_dht, commands);
                let _ = reply.send(r);
            }
            EngineMsg::Wire(key, event) => {
                self.on_wire(key, event).await;
            }
            EngineMsg::AnnounceWarning(msg) => {
                warn!("announce: {msg}");
                self.emit(EngineEvent::Warning(msg));
            }
            EngineMsg::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            EngineMsg::Files(reply) => {
                let r = self.storage().map(|s| {
                    s.files()
                        .iter()
                        .map(|f| FileInfo {
                            name: f.name.clone(),
                            path: f.path.clone(),
                            length: f.length,
                            offset: f.offset,
                            pieces: f.pieces.clone(),
                            done: f.is_done(),
                        })
                        .collect()
                });
                let _ = reply.send(r);
            }
            EngineMsg::PieceInfo(index, reply) => {
                let r = self.storage().and_then(|s| s.piece(index)).map(|p| {
                    PieceInfo {
                        index: p.index,
                        length: p.len(),
                        blocks: p.num_blocks(),
                        blocks_written: p.blocks_written(),
                        verified: p.is_verified(),
                    }
                });
                let _ = reply.send(r);
            }
            EngineMsg::Bitfield(reply) => {
                let r = self.storage().ok().map(|s| s.bitfield().clone());
                let _ = reply.send(r);
            }
            EngineMsg::Rechoke => {
                self.rechoke();
            }
            EngineMsg::Destroy { remove, reply } => {
                let _ = reply.send(self.destroy(remove).await);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Halt the transfer. Only the first failure is reported.
    fn fail(&mut self, msg: String) {
        if self.status == EngineStatus::Error {
            return;
        }
        warn!("{msg}");
        self.status = EngineStatus::Error;
        self.emit(EngineEvent::Error(msg));
    }

    fn storage(&self) -> Result<&StorageEngine, Error> {
        self.content.as_ref().map(|c| &c.storage).ok_or(Error::NoMetadata)
    }

    fn selections_mut(&mut self) -> Result<&mut SelectionManager, Error> {
        self.content
            .as_mut()
            .map(|c| &mut c.selections)
            .ok_or(Error::NoMetadata)
    }

    fn file_pieces(&self, file: usize) -> Result<Range<usize>, Error> {
        self.storage()?
            .files()
            .get(file)
            .map(|f| f.pieces.clone())
            .ok_or(Error::InvalidFile(file))
    }

    fn selections_changed(&mut self) {
        self.update_interest();
        self.deferred.push(Deferred::GcSelections);
        self.deferred.push(Deferred::Update);
    }

    fn run_deferred(&mut self) {
        while let Some(work) = self.deferred.pop() {
            match work {
                Deferred::GcSelections => self.gc_selections(),
                Deferred::Update => self.update(),
            }
        }
    }

    fn gc_selections(&mut self) {
        let Some(content) = self.content.as_mut() else { return };
        let removed = content.selections.gc(content.storage.bitfield());
        if removed > 0 {
            debug!("{removed} selections complete");
        }
        let empty = content.selections.is_empty();

        self.update_interest();
        if empty && !self.idle {
            self.idle = true;
            self.emit(EngineEvent::Idle);
        } else if !empty {
            self.idle = false;
        }
    }

    /// We are interested while anything is selected.
    fn update_interest(&mut self) {
        let Some(content) = self.content.as_ref() else { return };
        let interested = !content.selections.is_empty();

        for peer in self.peers.values_mut() {
            if peer.am_interested != interested {
                peer.set_interested(interested);
            }
        }
        if interested != self.interested {
            self.interested = interested;
            self.emit(if interested {
                EngineEvent::Interested
            } else {
                EngineEvent::Uninterested
            });
        }
    }

    /// Build the storage once the metadata is known.
    fn install(
        &mut self,
        descriptor: ContentDescriptor,
        metadata: Bytes,
    ) -> Result<(), Error> {
        let storage = match &self.config.download_dir {
            Some(dir) => StorageEngine::with_backend(&descriptor, dir)?,
            None => StorageEngine::new(&descriptor)?,
        };
        let num_pieces = storage.num_pieces();
        let mut rarity = RarityMap::new(num_pieces);

        // bitfields received before we could make sense of them
        for peer in self.peers.values_mut() {
            peer.bitfield.resize(num_pieces, false);
            rarity.observe(&peer.bitfield);
            peer.send(WireCommand::Bitfield(storage.bitfield().clone()));
        }

        info!("{} has {num_pieces} pieces", descriptor.name);

        self.content = Some(Content {
            selections: SelectionManager::new(num_pieces),
            reservations: Reservations::new(),
            rarity,
            storage,
            descriptor,
            metadata,
        });
        self.status = EngineStatus::Verifying;
        self.emit(EngineEvent::Metadata);
        Ok(())
    }

    async fn on_metadata(&mut self, metadata: Bytes) {
        if self.content.is_some() || self.status == EngineStatus::Error {
            return;
        }
        if InfoHash::from_metadata(&metadata) != self.info_hash {
            warn!("received metadata with a different info hash");
            self.emit(EngineEvent::Warning(
                "received metadata that does not match the info hash".into(),
            ));
            return;
        }

        let installed = ContentDescriptor::from_metadata(&metadata)
            .and_then(|descriptor| self.install(descriptor, metadata));
        if let Err(e) = installed {
            self.fail(e.to_string());
            return;
        }
        self.start_verification().await;
    }

    /// Load existing data and hash it, pieces that match are kept.
    async fn start_verification(&mut self) {
        let Some(content) = self.content.as_mut() else { return };

        let has_data = match self.seed.take() {
            Some(data) => match content.storage.load(&data) {
                Ok(()) => true,
                Err(e) => {
                    self.fail(format!(
                        "seed data does not match the content: {e}"
                    ));
                    return;
                }
            },
            None => match content.storage.load_existing().await {
                Ok(found) => found,
                Err(e) => {
                    warn!("could not load existing data: {e}");
                    self.emit(EngineEvent::StorageError(e.to_string()));
                    false
                }
            },
        };

        if !has_data {
            self.finish_verification();
            return;
        }

        self.resume = Some(Resume::default());
        for _ in 0..RESUME_JOBS {
            self.spawn_resume_job();
        }
    }

    fn spawn_resume_job(&mut self) {
        let (Some(content), Some(resume)) =
            (self.content.as_ref(), self.resume.as_mut())
        else {
            return;
        };
        if resume.next >= content.storage.num_pieces() {
            return;
        }
        let index = resume.next;
        resume.next += 1;
        match content.storage.piece_bytes(index) {
            Ok(bytes) => {
                spawn_hash(&mut self.hashing, index, bytes, HashKind::Existing)
            }
            Err(e) => warn!("{e}"),
        }
    }

    fn finish_verification(&mut self) {
        let Some(content) = self.content.as_mut() else { return };
        let done = content.storage.is_done();
        self.status = if done {
            EngineStatus::Seeding
        } else {
            EngineStatus::Downloading
        };

        if self.config.auto_select && !done {
            let last = content.storage.num_pieces().saturating_sub(1);
            if let Err(e) = content.selections.select(0, last, 0, None) {
                warn!("{e}");
            }
        }

        info!(
            "ready with {} of {} pieces",
            content.storage.bitfield().count_ones(),
            content.storage.num_pieces()
        );
        self.emit(EngineEvent::Ready);
        if done {
            self.emit(EngineEvent::Done);
        }
        self.selections_changed();
    }

    fn on_hash(&mut self, job: HashJob) {
        let Some(content) = self.content.as_mut() else { return };
        let storage = &mut content.storage;
        let applied = match job.kind {
            HashKind::Existing => storage.apply_existing(job.index, job.digest),
            HashKind::Downloaded => storage.apply_digest(job.index, job.digest),
        };
        let downloaded = job.kind == HashKind::Downloaded;
        match applied {
            Ok(events) => self.on_storage_events(events, downloaded),
            Err(e) => warn!("{e}"),
        }

        if job.kind == HashKind::Existing {
            self.on_resume_progress();
        }
    }

    fn on_resume_progress(&mut self) {
        let (Some(content), Some(resume)) =
            (self.content.as_ref(), self.resume.as_mut())
        else {
            return;
        };
        resume.checked += 1;
        let total = content.storage.num_pieces();
        let checked = resume.checked;
        let verified = content.storage.bitfield().count_ones();

        self.emit(EngineEvent::Verifying {
            percent_done: checked as f64 * 100.0 / total as f64,
            percent_verified: verified as f64 * 100.0 / total as f64,
        });

        if checked >= total {
            self.resume = None;
            self.finish_verification();
        } else {
            self.spawn_resume_job();
        }
    }

    fn on_storage_events(
        &mut self,
        events: Vec<StorageEvent>,
        downloaded: bool,
    ) {
        for event in events {
            match event {
                StorageEvent::PieceVerified(index) => {
                    self.on_piece_verified(index, downloaded)
                }
                StorageEvent::VerificationFailed(index) => {
                    self.release_piece(index);
                    self.emit(EngineEvent::VerificationFailed(index));
                    self.deferred.push(Deferred::Update);
                }
                StorageEvent::FileDone(index) => {
                    debug!("file {index} done");
                    self.emit(EngineEvent::FileDone(index));
                }
                StorageEvent::Done => {
                    if self.status == EngineStatus::Downloading {
                        info!("download complete");
                        self.status = EngineStatus::Seeding;
                        self.emit(EngineEvent::Done);
                    }
                }
            }
        }
    }

    fn on_piece_verified(&mut self, index: usize, downloaded: bool) {
        self.release_piece(index);
        for peer in self.peers.values() {
            peer.send(WireCommand::Have(index));
        }
        if downloaded {
            self.emit(EngineEvent::Piece(index));
            self.flush_piece(index);
        }
        self.resolve_reads();
        self.deferred.push(Deferred::GcSelections);
        self.deferred.push(Deferred::Update);
    }

    /// Drop every reservation of a piece, cancelling the requests that are
    /// still out.
    fn release_piece(&mut self, index: usize) {
        let Some(content) = self.content.as_mut() else { return };
        for (key, block) in content.reservations.clear_piece(index) {
            let Some(peer) = self.peers.get_mut(&key) else { continue };
            if peer.remove_request(&block) {
                peer.send(WireCommand::Cancel(block));
            }
        }
    }

    fn flush_piece(&mut self, index: usize) {
        let Some(content) = self.content.as_ref() else { return };
        let Some(backend) = content.storage.backend().cloned() else { return };
        let Ok(piece) = content.storage.piece(index) else { return };
        let offset = piece.range().start as u64;

        match content.storage.piece_bytes(index) {
            Ok(bytes) => {
                self.flushes
                    .spawn(async move { backend.write(offset, &bytes).await });
            }
            Err(e) => warn!("{e}"),
        }
    }

    fn on_flush(&mut self, flush: Result<Result<(), Error>, JoinError>) {
        let err = match flush {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(e) => e.into(),
        };
        warn!("could not write to disk: {err}");
        self.emit(EngineEvent::StorageError(err.to_string()));
    }

    fn read_file(
        &mut self,
        file: usize,
        range: Option<Range<u64>>,
        reply: oneshot::Sender<Result<Bytes, Error>>,
    ) {
        let Some(content) = self.content.as_mut() else {
            let _ = reply.send(Err(Error::NoMetadata));
            return;
        };
        let Some(f) = content.storage.files().get(file) else {
            let _ = reply.send(Err(Error::InvalidFile(file)));
            return;
        };

        let range = range.unwrap_or(0..f.length);
        if range.start > range.end || range.end > f.length {
            let _ = reply.send(Err(Error::InvalidRange {
                start: range.start as usize,
                end: range.end as usize,
            }));
            return;
        }
        let abs = f.offset + range.start..f.offset + range.end;
        let pieces = content.storage.pieces_of(abs.clone());

        if pieces.clone().all(|p| content.storage.has_piece(p)) {
            let _ = reply.send(content.storage.read_range(abs));
            return;
        }

        let last = pieces.end - 1;
        if let Err(e) =
            content.selections.select(pieces.start, last, READ_PRIORITY, None)
        {
            let _ = reply.send(Err(e));
            return;
        }
        let piece_length = content.descriptor.piece_length.max(1) as usize;
        let critical = (CRITICAL_BYTES / piece_length).clamp(1, 2);
        let critical_end = (pieces.start + critical - 1).min(last);
        if let Err(e) = content.selections.critical(pieces.start, critical_end)
        {
            warn!("{e}");
        }

        self.pending_reads.push(PendingRead { range: abs, pieces, reply });
        self.selections_changed();
    }

    /// Answer the reads whose pieces are all verified.
    fn resolve_reads(&mut self) {
        let Some(content) = self.content.as_mut() else { return };
        let mut i = 0;
        while i < self.pending_reads.len() {
            let ready = self.pending_reads[i]
                .pieces
                .clone()
                .all(|p| content.storage.has_piece(p));
            if !ready {
                i += 1;
                continue;
            }
            let read = self.pending_reads.swap_remove(i);
            let (start, end) = (read.pieces.start, read.pieces.end - 1);
            content.selections.deselect(start, end, READ_PRIORITY);
            let _ = read.reply.send(content.storage.read_range(read.range));
        }
    }

    fn add_peer(&mut self, addr: SocketAddr) -> Result<(), Error> {
        if let Some(reason) = self.blocklist.check(addr.ip()) {
            debug!("{addr} is blocked: {reason}");
            let event =
                EngineEvent::BlockedPeer { addr, reason: reason.clone() };
            self.emit(event);
            return Err(Error::PeerBlocked { addr, reason });
        }
        let known = self.queued.contains(&addr)
            || self.dialing.contains(&addr)
            || self.peers.values().any(|p| p.addr == addr);
        if !known {
            self.queued.push(addr);
            self.emit(EngineEvent::PeerQueued(addr));
        }
        Ok(())
    }

    fn connect_peer(
        &mut self,
        addr: SocketAddr,
        supports_dht: bool,
        commands: mpsc::UnboundedSender<WireCommand>,
    ) -> Result<PeerLink, Error> {
        if let Some(reason) = self.blocklist.check(addr.ip()) {
            debug!("refusing blocked {addr}: {reason}");
            let event =
                EngineEvent::BlockedPeer { addr, reason: reason.clone() };
            self.emit(event);
            return Err(Error::PeerBlocked { addr, reason });
        }
        let tx = self.tx.upgrade().ok_or(Error::SendErrorEngine)?;

        self.queued.retain(|a| *a != addr);
        self.dialing.remove(&addr);

        let key = PeerKey(self.next_key);
        self.next_key += 1;

        let num_pieces =
            self.content.as_ref().map_or(0, |c| c.storage.num_pieces());
        let mut peer = PeerState::new(addr, commands, supports_dht, num_pieces);

        peer.send(WireCommand::SetKeepAlive(true));
        peer.send(WireCommand::SetRequestTimeout(self.config.piece_timeout()));
        if let Some(content) = &self.content {
            let bitfield = content.storage.bitfield().clone();
            peer.send(WireCommand::Bitfield(bitfield));
        }
        peer.set_interested(true);
        if let (true, Some(port)) = (supports_dht, self.config.dht_port) {
            peer.send(WireCommand::Port(port));
        }
        if self.content.is_none() {
            peer.send(WireCommand::FetchMetadata);
        }
        peer.choke_timer =
            Some(self.choke_timers.insert(key, self.config.choke_timeout()));

        debug!("{addr} connected as {key}");
        self.peers.insert(key, peer);
        self.deferred.push(Deferred::Update);

        Ok(PeerLink::new(key, addr, tx))
    }

    /// Ask the transport to close the connection and forget the peer.
    fn close_peer(&mut self, key: PeerKey) {
        if let Some(peer) = self.peers.get(&key) {
            peer.send(WireCommand::Close);
        }
        self.remove_peer(key);
    }

    fn remove_peer(&mut self, key: PeerKey) {
        let Some(peer) = self.peers.remove(&key) else { return };
        if let Some(timer) = peer.choke_timer {
            self.choke_timers.remove(&timer);
        }
        self.choker.forget(key);

        if let Some(content) = self.content.as_mut() {
            content.rarity.forget(&peer.bitfield);
            for block in content.reservations.drain_peer(key) {
                if content.reservations.holders(&block).is_empty() {
                    if let Err(e) =
                        content.storage.cancel_block(block.index, block.begin)
                    {
                        warn!("{e}");
                    }
                }
            }
        }

        debug!("{} disconnected", peer.addr);
        self.deferred.push(Deferred::Update);
    }

    async fn on_wire(&mut self, key: PeerKey, event: WireEvent) {
        let Some(peer) = self.peers.get_mut(&key) else {
            // late events of a peer that is gone
            if let WireEvent::Request { reply, .. } = event {
                let _ = reply.send(Err(Error::PeerClosed));
            }
            return;
        };

        match event {
            WireEvent::Bitfield(bitfield) => self.on_bitfield(key, bitfield),
            WireEvent::Have(index) => self.on_have(key, index),
            WireEvent::Request { block, reply } => {
                self.on_request(key, block, reply)
            }
            WireEvent::Choke => {
                peer.peer_choking = true;
                if peer.choke_timer.is_none() {
                    let after = self.config.choke_timeout();
                    let timer = self.choke_timers.insert(key, after);
                    peer.choke_timer = Some(timer);
                }
            }
            WireEvent::Unchoke => {
                peer.peer_choking = false;
                if let Some(timer) = peer.choke_timer.take() {
                    self.choke_timers.remove(&timer);
                }
                self.deferred.push(Deferred::Update);
            }
            WireEvent::Interested => self.on_interested(key),
            WireEvent::NotInterested => {
                peer.peer_interested = false;
            }
            WireEvent::Port(port) => {
                let addr = peer.addr;
                self.emit(EngineEvent::DhtPort { addr, port });
            }
            WireEvent::Timeout => {
                debug!("{} timed out", peer.addr);
                self.close_peer(key);
            }
            WireEvent::Close => self.remove_peer(key),
            WireEvent::Metadata(metadata) => self.on_metadata(metadata).await,
            WireEvent::MetadataRequest(reply) => {
                let metadata =
                    self.content.as_ref().map(|c| c.metadata.clone());
                let _ = reply.send(metadata);
            }
            WireEvent::PeerExchange(addrs) => {
                for addr in addrs {
                    let _ = self.add_peer(addr);
                }
            }
        }
    }

    fn on_bitfield(&mut self, key: PeerKey, mut bitfield: Bitfield) {
        let Some(peer) = self.peers.get_mut(&key) else { return };
        if let Some(content) = self.content.as_mut() {
            bitfield.resize(content.storage.num_pieces(), false);
            content.rarity.forget(&peer.bitfield);
            content.rarity.observe(&bitfield);
        } else {
            bitfield.truncate(MAX_UNKNOWN_PIECES);
        }
        peer.bitfield = bitfield;
        self.deferred.push(Deferred::Update);
    }

    fn on_have(&mut self, key: PeerKey, index: usize) {
        let Some(peer) = self.peers.get_mut(&key) else { return };
        let num_pieces = self
            .content
            .as_ref()
            .map_or(MAX_UNKNOWN_PIECES, |c| c.storage.num_pieces());
        if index >= num_pieces {
            debug!("{} has piece {index}, which does not exist", peer.addr);
            return;
        }
        if peer.has(index) {
            return;
        }

        peer.bitfield.safe_set(index);
        if let Some(content) = self.content.as_mut() {
            content.rarity.observe_piece(index);
        }
        self.deferred.push(Deferred::Update);
    }

    /// Serve a block to a peer.
    fn on_request(
        &mut self,
        key: PeerKey,
        block: BlockInfo,
        reply: oneshot::Sender<Result<Bytes, Error>>,
    ) {
        let Some(peer) = self.peers.get_mut(&key) else { return };

        if block.len > MAX_BLOCK_LEN {
            warn!("{} requested {} bytes, disconnecting", peer.addr, block.len);
            let _ = reply.send(Err(Error::InvalidBlockSize {
                index: block.index,
                offset: block.begin,
                len: block.len as usize,
            }));
            self.close_peer(key);
            return;
        }
        if peer.am_choking {
            let _ = reply.send(Err(Error::PeerChoked));
            return;
        }
        let Some(content) = self.content.as_ref() else {
            let _ = reply.send(Err(Error::NoMetadata));
            return;
        };

        let begin = block.begin as usize;
        let range = begin..begin + block.len as usize;
        let result = content.storage.read(block.index, Some(range));
        if result.is_ok() {
            peer.counter.record_upload(block.len as u64);
            self.counter.record_upload(block.len as u64);
        }
        let _ = reply.send(result);
    }

    fn on_interested(&mut self, key: PeerKey) {
        let num_pieces =
            self.content.as_ref().map_or(0, |c| c.storage.num_pieces());
        let slots = self.config.upload_slots;
        let Some(peer) = self.peers.get_mut(&key) else { return };

        peer.peer_interested = true;
        if peer.interest_seen {
            return;
        }
        peer.interest_seen = true;
        if slots > 0 && !peer.is_seeder(num_pieces) {
            peer.unchoke();
        }
    }

    /// The peer kept us choked for too long. It is dropped when other
    /// connections are waiting, otherwise it gets another round.
    fn on_choke_timeout(&mut self, key: PeerKey) {
        let pressure = self.queued.len() > 2 * self.dialing.len();
        let timeout = self.config.choke_timeout();
        let Some(peer) = self.peers.get_mut(&key) else { return };

        peer.choke_timer = None;
        if !peer.peer_choking {
            return;
        }
        if pressure && peer.am_interested {
            debug!("{} choked us for too long", peer.addr);
            self.close_peer(key);
            return;
        }
        peer.choke_timer = Some(self.choke_timers.insert(key, timeout));
    }

    fn heartbeat(&mut self) {
        for peer in self.peers.values_mut() {
            peer.counter.update_rates();
        }
        self.counter.update_rates();
        self.deferred.push(Deferred::Update);
    }

    fn rechoke(&mut self) {
        let num_pieces =
            self.content.as_ref().map_or(0, |c| c.storage.num_pieces());
        let mut candidates: Vec<Candidate> = self
            .peers
            .iter()
            .map(|(key, p)| Candidate {
                key: *key,
                download_rate: p.counter.download_rate(),
                upload_rate: p.counter.upload_rate(),
                unchoked: !p.am_choking,
                interested: p.peer_interested,
                seeder: p.is_seeder(num_pieces),
            })
            .collect();
        candidates.sort_by_key(|c| c.key);

        let slots = self.config.upload_slots;
        let decisions = self.choker.rechoke(&candidates, slots, &mut self.rng);
        for (key, unchoke) in decisions {
            let Some(peer) = self.peers.get_mut(&key) else { continue };
            if unchoke {
                peer.unchoke();
            } else {
                peer.choke();
            }
        }
    }

    fn stats(&self) -> EngineStats {
        let (length, downloaded, num_missing, done) = match &self.content {
            Some(c) => (
                c.storage.len(),
                c.storage.downloaded(),
                c.storage.num_missing(),
                c.storage.is_done(),
            ),
            None => (0, 0, 0, false),
        };
        let uploaded = self.counter.total_upload();
        let download_rate = self.counter.download_rate();

        let time_remaining = if done {
            Some(Duration::ZERO)
        } else if download_rate > 0.0 {
            Some(Duration::from_secs_f64(
                length.saturating_sub(downloaded) as f64 / download_rate,
            ))
        } else {
            None
        };

        EngineStats {
            status: self.status,
            length,
            downloaded,
            uploaded,
            received: self.received,
            download_rate,
            upload_rate: self.counter.upload_rate(),
            peers: self.peers.len(),
            num_missing,
            progress: ratio(downloaded, length),
            ratio: ratio(uploaded, downloaded),
            time_remaining,
            done,
        }
    }

    /// Stop requesting, then close the peers and the storage at the same
    /// time, returning the first error of either.
    async fn destroy(&mut self, remove: bool) -> Result<(), Error> {
        info!("destroying");
        self.status = EngineStatus::Destroyed;
        self.choke_timers.clear();
        self.in_flight.clear();
        self.hashing.abort_all();
        self.deferred.clear();
        self.pending_reads.clear();
        self.resume = None;

        let peers = std::mem::take(&mut self.peers);
        let mut flushes = std::mem::take(&mut self.flushes);
        let storage = self.content.take().map(|c| c.storage);

        let close_peers = async {
            for peer in peers.values() {
                peer.send(WireCommand::Close);
            }
            Ok::<_, Error>(())
        };
        let close_storage = async {
            while let Some(flush) = flushes.join_next().await {
                flush??;
            }
            if let Some(storage) = &storage {
                storage.close().await?;
                if remove {
                    storage.remove().await?;
                }
            }
            Ok::<_, Error>(())
        };

        tokio::try_join!(close_peers, close_storage)?;
        Ok(())
    }
}
