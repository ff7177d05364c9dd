//! Block scheduling: which peer is asked for what.
//!
//! A pass walks the peers in random order. Peers that never sent us anything
//! get a single request from the least important selection, the others get
//! their request window filled from the most important one.
use bytes::Bytes;
use futures::FutureExt;
use hashbrown::HashSet;
use rand::seq::SliceRandom;
use tokio::{sync::oneshot, time::timeout};
use tracing::{debug, warn};

use crate::{
    config::Strategy,
    error::Error,
    peer::{BlockInfo, PeerKey, WireCommand},
    selection::Span,
    storage::{BlockWrite, BLOCK_LEN},
};

use super::{
    spawn_hash, Deferred, DownloadEngine, EngineEvent, EngineStatus, HashKind,
};

/// Outcome of a block request.
pub(super) struct Completed {
    pub peer: PeerKey,
    pub block: BlockInfo,
    pub result: Result<Bytes, Error>,
}

/// Skips pieces that faster peers are expected to finish before a slow peer
/// could deliver its share.
#[derive(Debug, Clone)]
pub(crate) struct SpeedFilter {
    speed: f64,
    /// Time the peer needs for the requests it has out.
    secs: f64,
    fast_threshold: f64,
    tries: usize,
    active: bool,
}

impl SpeedFilter {
    pub fn new(
        speed: f64,
        outstanding: usize,
        fast_threshold: f64,
        tries: usize,
    ) -> Self {
        let active = speed <= fast_threshold;
        let speed = speed.max(1.0);
        Self {
            speed,
            secs: outstanding.max(1) as f64 * BLOCK_LEN as f64 / speed,
            fast_threshold,
            tries,
            active,
        }
    }

    /// `others` are the download rates of the other peers holding the piece.
    pub fn excludes(
        &mut self,
        missing_blocks: usize,
        others: impl IntoIterator<Item = f64>,
    ) -> bool {
        if !self.active || self.tries == 0 {
            return false;
        }
        let mut missing = missing_blocks as f64 * BLOCK_LEN as f64;
        for rate in others {
            if rate < self.fast_threshold || rate <= self.speed {
                continue;
            }
            missing -= rate * self.secs;
            if missing <= 0.0 {
                self.tries -= 1;
                return true;
            }
        }
        false
    }
}

/// The slowest of `holders` that is neither fast nor at least half as fast
/// as `speed`.
pub(crate) fn pick_victim(
    speed: f64,
    fast_threshold: f64,
    holders: impl IntoIterator<Item = (PeerKey, f64)>,
) -> Option<PeerKey> {
    holders
        .into_iter()
        .filter(|(_, rate)| *rate < fast_threshold && 2.0 * rate <= speed)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(key, _)| key)
}

impl DownloadEngine {
    pub(super) fn update(&mut self) {
        if self.status != EngineStatus::Downloading {
            return;
        }
        let Some(content) = self.content.as_ref() else { return };
        if content.selections.is_empty() {
            return;
        }

        let mut keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        keys.sort_unstable();
        keys.shuffle(&mut self.rng);

        for key in keys {
            let Some(peer) = self.peers.get(&key) else { continue };
            if peer.peer_choking {
                continue;
            }
            if peer.is_untested() {
                self.validate(key);
            } else if !self.fill(key, false) {
                self.fill(key, true);
            }
        }
    }

    fn spans(&self) -> Vec<Span> {
        self.content.as_ref().map(|c| c.selections.spans()).unwrap_or_default()
    }

    /// The peer has the piece and we still need it.
    fn wants(&self, key: PeerKey, index: usize) -> bool {
        let (Some(content), Some(peer)) =
            (self.content.as_ref(), self.peers.get(&key))
        else {
            return false;
        };
        peer.has(index) && !content.storage.has_piece(index)
    }

    fn window_full(&self, key: PeerKey) -> bool {
        self.peers
            .get(&key)
            .map_or(true, |p| p.requests.len() >= self.config.max_requests)
    }

    fn rarest(
        &self,
        key: PeerKey,
        span: &Span,
        tried: &HashSet<usize>,
    ) -> Option<usize> {
        let content = self.content.as_ref()?;
        content.rarity.get_rarest_piece(|i| {
            span.indices().contains(&i)
                && !tried.contains(&i)
                && self.wants(key, i)
        })
    }

    /// A single request on the least important selection, to find out what
    /// a new peer is worth.
    fn validate(&mut self, key: PeerKey) {
        if self.peers.get(&key).map_or(true, |p| !p.requests.is_empty()) {
            return;
        }

        for span in self.spans().iter().rev() {
            match self.config.strategy {
                Strategy::Sequential => {
                    for index in span.indices() {
                        if self.wants(key, index)
                            && self.request(key, index, false)
                        {
                            return;
                        }
                    }
                }
                Strategy::Rarest => {
                    let mut tried = HashSet::new();
                    while let Some(index) = self.rarest(key, span, &tried) {
                        tried.insert(index);
                        if self.request(key, index, false) {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Fill the request window of a peer. Returns true once it is full.
    fn fill(&mut self, key: PeerKey, hotswap: bool) -> bool {
        // a full window only rotates the selection that filled it
        if self.window_full(key) {
            return true;
        }
        let mut filter = match self.peers.get(&key) {
            Some(peer) => SpeedFilter::new(
                peer.counter.download_rate(),
                peer.requests.len(),
                self.config.fast_threshold,
                self.config.speed_filter_tries,
            ),
            None => return false,
        };

        for (pos, span) in self.spans().iter().enumerate() {
            match self.config.strategy {
                Strategy::Sequential => {
                    for index in span.indices() {
                        if self.window_full(key) {
                            break;
                        }
                        if !self.wants(key, index)
                            || self.filtered(key, index, &mut filter)
                        {
                            continue;
                        }
                        self.request_piece(key, index, hotswap);
                    }
                }
                Strategy::Rarest => {
                    let mut tried = HashSet::new();
                    while !self.window_full(key) {
                        let Some(index) = self.rarest(key, span, &tried) else {
                            break;
                        };
                        tried.insert(index);
                        if self.filtered(key, index, &mut filter) {
                            continue;
                        }
                        self.request_piece(key, index, hotswap);
                    }
                }
            }

            if !self.window_full(key) {
                continue;
            }
            // equal priorities share slow and fast peers
            if span.priority != 0 {
                if let Some(content) = self.content.as_mut() {
                    content.selections.rotate(pos);
                }
            }
            return true;
        }
        false
    }

    fn filtered(
        &self,
        key: PeerKey,
        index: usize,
        filter: &mut SpeedFilter,
    ) -> bool {
        let Some(piece) =
            self.content.as_ref().and_then(|c| c.storage.piece(index).ok())
        else {
            return false;
        };
        let missing = piece.num_blocks() - piece.blocks_written();
        let others = self
            .peers
            .iter()
            .filter(|(k, p)| **k != key && p.has(index))
            .map(|(_, p)| p.counter.download_rate());
        filter.excludes(missing, others)
    }

    /// Request blocks of a piece until the window is full or the piece has
    /// nothing left to reserve.
    fn request_piece(&mut self, key: PeerKey, index: usize, hotswap: bool) {
        let critical = self
            .content
            .as_ref()
            .is_some_and(|c| c.selections.is_critical(index));
        while self.request(key, index, hotswap || critical) {}
    }

    /// Reserve and request one block of `index` from the peer.
    fn request(&mut self, key: PeerKey, index: usize, hotswap: bool) -> bool {
        let max_requests = self.config.max_requests;
        let threshold = self.config.endgame_threshold;
        let (Some(content), Some(peer)) =
            (self.content.as_mut(), self.peers.get(&key))
        else {
            return false;
        };
        if peer.requests.len() >= max_requests || !peer.has(index) {
            return false;
        }

        let end_game = peer.requests.is_empty()
            && content.storage.num_missing() < threshold;
        let mut block = content.storage.reserve_block(index, end_game);
        if block.is_none() && hotswap && !end_game && self.hotswap(key, index) {
            block = self
                .content
                .as_mut()
                .and_then(|c| c.storage.reserve_block(index, false));
        }
        let Some(block) = block else { return false };

        let piece_timeout = self.config.piece_timeout();
        let (Some(content), Some(peer)) =
            (self.content.as_mut(), self.peers.get_mut(&key))
        else {
            return false;
        };
        content.reservations.add(key, block);
        peer.requests.push(block);

        let (otx, orx) = oneshot::channel();
        peer.send(WireCommand::Request { block, reply: otx });

        self.in_flight.push(
            async move {
                let result = match timeout(piece_timeout, orx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(Error::PeerClosed),
                    Err(_) => Err(Error::RequestTimeout),
                };
                Completed { peer: key, block, result }
            }
            .boxed(),
        );
        true
    }

    /// Take the reservations of piece `index` away from its slowest holder.
    fn hotswap(&mut self, key: PeerKey, index: usize) -> bool {
        if !self.config.hotswap {
            return false;
        }
        let (Some(content), Some(peer)) =
            (self.content.as_ref(), self.peers.get(&key))
        else {
            return false;
        };
        let speed = peer.counter.download_rate();
        if speed < self.config.hotswap_min_speed {
            return false;
        }

        let holders = content
            .reservations
            .holders_of(index)
            .into_iter()
            .filter(|k| *k != key)
            .filter_map(|k| {
                self.peers.get(&k).map(|p| (k, p.counter.download_rate()))
            });
        let Some(victim) =
            pick_victim(speed, self.config.fast_threshold, holders)
        else {
            return false;
        };
        let to = peer.addr;

        let (Some(content), Some(slow)) =
            (self.content.as_mut(), self.peers.get_mut(&victim))
        else {
            return false;
        };
        for block in content.reservations.take_piece_for(victim, index) {
            if content.reservations.holders(&block).is_empty() {
                if let Err(e) =
                    content.storage.cancel_block(block.index, block.begin)
                {
                    warn!("{e}");
                }
            }
            if slow.remove_request(&block) {
                slow.send(WireCommand::Cancel(block));
            }
        }

        let from = slow.addr;
        debug!("piece {index} hotswapped from {from} to {to}");
        self.emit(EngineEvent::Hotswap { from, to, index });
        true
    }

    /// Stage the bytes of a finished request.
    pub(super) fn on_block(&mut self, done: Completed) {
        let Completed { peer: key, block, result } = done;
        let outstanding = self
            .peers
            .get_mut(&key)
            .is_some_and(|p| p.remove_request(&block));
        let Some(content) = self.content.as_mut() else { return };
        if outstanding {
            content.reservations.remove(key, &block);
        }

        match result {
            Ok(bytes) => {
                let len = bytes.len() as u64;
                self.received += len;
                self.counter.record_download(len);
                if let Some(peer) = self.peers.get_mut(&key) {
                    peer.counter.record_download(len);
                }

                let staged = if self.status == EngineStatus::Verifying {
                    Err(Error::StorageVerifying)
                } else {
                    let storage = &mut content.storage;
                    storage.stage_block(block.index, block.begin, &bytes)
                };
                match staged {
                    Ok(write) => {
                        if write == BlockWrite::PieceFull {
                            match content.storage.piece_bytes(block.index) {
                                Ok(piece) => spawn_hash(
                                    &mut self.hashing,
                                    block.index,
                                    piece,
                                    HashKind::Downloaded,
                                ),
                                Err(e) => warn!("{e}"),
                            }
                        }
                        // endgame duplicates are not needed anymore
                        for other in content.reservations.holders(&block) {
                            content.reservations.remove(other, &block);
                            let Some(peer) = self.peers.get_mut(&other) else {
                                continue;
                            };
                            if peer.remove_request(&block) {
                                peer.send(WireCommand::Cancel(block));
                            }
                        }
                    }
                    Err(e) => {
                        warn!("{key} sent an invalid block: {e}");
                        let storage = &mut content.storage;
                        if content.reservations.holders(&block).is_empty() {
                            if let Err(e) =
                                storage.cancel_block(block.index, block.begin)
                            {
                                warn!("{e}");
                            }
                        }
                    }
                }
            }
            Err(e) => {
                debug!("request {block:?} to {key} failed: {e}");
                let unheld = content.reservations.holders(&block).is_empty();
                if outstanding && unheld {
                    if let Err(e) =
                        content.storage.cancel_block(block.index, block.begin)
                    {
                        warn!("{e}");
                    }
                }
            }
        }

        self.deferred.push(Deferred::Update);
    }
}
