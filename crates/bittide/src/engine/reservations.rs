use std::collections::BTreeMap;

use crate::peer::{BlockInfo, PeerKey};

/// Who holds a reservation on which block.
///
/// Outside of endgame a block has at most one holder, in endgame the same
/// block may be requested from several peers.
#[derive(Debug, Default)]
pub(crate) struct Reservations {
    requests: BTreeMap<usize, Vec<(PeerKey, BlockInfo)>>,
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: PeerKey, block: BlockInfo) {
        let entry = self.requests.entry(block.index).or_default();
        if !entry.contains(&(peer, block)) {
            entry.push((peer, block));
        }
    }

    /// Return true if the reservation existed.
    pub fn remove(&mut self, peer: PeerKey, block: &BlockInfo) -> bool {
        let Some(blocks) = self.requests.get_mut(&block.index) else {
            return false;
        };
        let Some(pos) =
            blocks.iter().position(|(p, b)| *p == peer && b == block)
        else {
            return false;
        };
        blocks.remove(pos);
        if blocks.is_empty() {
            self.requests.remove(&block.index);
        }
        true
    }

    /// Peers holding this block.
    pub fn holders(&self, block: &BlockInfo) -> Vec<PeerKey> {
        self.requests
            .get(&block.index)
            .map(|v| {
                v.iter().filter(|(_, b)| b == block).map(|(p, _)| *p).collect()
            })
            .unwrap_or_default()
    }

    /// Distinct peers holding any block of a piece.
    pub fn holders_of(&self, index: usize) -> Vec<PeerKey> {
        let mut peers: Vec<PeerKey> = self
            .requests
            .get(&index)
            .map(|v| v.iter().map(|(p, _)| *p).collect())
            .unwrap_or_default();
        peers.sort_unstable();
        peers.dedup();
        peers
    }

    /// Remove and return the reservations of `peer` on a piece.
    pub fn take_piece_for(
        &mut self,
        peer: PeerKey,
        index: usize,
    ) -> Vec<BlockInfo> {
        let Some(blocks) = self.requests.get_mut(&index) else {
            return Vec::new();
        };
        let mut taken = Vec::new();
        blocks.retain(|(p, b)| {
            if *p == peer {
                taken.push(*b);
                return false;
            }
            true
        });
        if blocks.is_empty() {
            self.requests.remove(&index);
        }
        taken
    }

    /// Remove every reservation of a piece.
    pub fn clear_piece(&mut self, index: usize) -> Vec<(PeerKey, BlockInfo)> {
        self.requests.remove(&index).unwrap_or_default()
    }

    /// Remove every reservation held by `peer`.
    pub fn drain_peer(&mut self, peer: PeerKey) -> Vec<BlockInfo> {
        let mut taken = Vec::new();
        self.requests.retain(|_, blocks| {
            blocks.retain(|(p, b)| {
                if *p == peer {
                    taken.push(*b);
                    return false;
                }
                true
            });
            !blocks.is_empty()
        });
        taken
    }
}
