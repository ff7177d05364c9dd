//! A remote peer, as seen by the engine.
//!
//! The engine never talks to sockets. A peer is a channel of
//! [`WireCommand`]s going out and [`WireEvent`]s coming in through its
//! [`PeerLink`], with the protocol state the engine needs to schedule it.
mod types;

// re-exports
pub use types::*;

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio_util::time::delay_queue;
use tracing::debug;

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    counter::Counter,
    storage::BLOCK_LEN,
};

/// A block of a piece, the unit of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: usize,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes. <= 16 KiB, except for requests from
    /// other clients.
    pub len: u32,
}

impl BlockInfo {
    pub fn new(index: usize, begin: u32, len: u32) -> Self {
        Self { index, begin, len }
    }
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

/// State of a connected peer.
#[derive(Debug)]
pub struct PeerState {
    pub addr: SocketAddr,
    tx: mpsc::UnboundedSender<WireCommand>,
    /// Pieces the peer announced.
    pub bitfield: Bitfield,
    /// We are choking the peer.
    pub am_choking: bool,
    pub am_interested: bool,
    /// The peer is choking us.
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// The peer declared interest at least once.
    pub interest_seen: bool,
    /// Blocks we requested and did not receive yet.
    pub requests: Vec<BlockInfo>,
    pub counter: Counter,
    pub supports_dht: bool,
    pub choke_timer: Option<delay_queue::Key>,
}

impl PeerState {
    pub fn new(
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<WireCommand>,
        supports_dht: bool,
        num_pieces: usize,
    ) -> Self {
        Self {
            addr,
            tx,
            bitfield: Bitfield::from_piece(num_pieces),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            interest_seen: false,
            requests: Vec::new(),
            counter: Counter::default(),
            supports_dht,
            choke_timer: None,
        }
    }

    /// Hand a command to the transport. A closed transport is reported by
    /// the transport itself with [`WireEvent::Close`], so failures are only
    /// logged.
    pub fn send(&self, cmd: WireCommand) {
        if self.tx.send(cmd).is_err() {
            debug!("{} transport is gone", self.addr);
        }
    }

    pub fn has(&self, index: usize) -> bool {
        self.bitfield.has(index)
    }

    /// The peer has all `num_pieces`.
    pub fn is_seeder(&self, num_pieces: usize) -> bool {
        self.bitfield.is_complete(num_pieces)
    }

    /// Nothing was received from the peer yet.
    pub fn is_untested(&self) -> bool {
        self.counter.total_download() == 0
    }

    pub fn choke(&mut self) {
        if !self.am_choking {
            self.am_choking = true;
            self.send(WireCommand::Choke);
        }
    }

    pub fn unchoke(&mut self) {
        if self.am_choking {
            self.am_choking = false;
            self.send(WireCommand::Unchoke);
        }
    }

    pub fn set_interested(&mut self, interested: bool) {
        self.am_interested = interested;
        self.send(if interested {
            WireCommand::Interested
        } else {
            WireCommand::NotInterested
        });
    }

    /// Forget a request, returns false if it was not outstanding.
    pub fn remove_request(&mut self, block: &BlockInfo) -> bool {
        let Some(i) = self.requests.iter().position(|b| b == block) else {
            return false;
        };
        self.requests.swap_remove(i);
        true
    }
}
