//! Decide which peers may download from us.
use std::cmp::Ordering;

use rand::Rng;

use crate::peer::PeerKey;

/// What the choker needs to know about a peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub key: PeerKey,
    /// Rate we download from the peer.
    pub download_rate: f64,
    /// Rate we upload to the peer.
    pub upload_rate: f64,
    /// The peer is currently unchoked by us.
    pub unchoked: bool,
    pub interested: bool,
    pub seeder: bool,
}

/// Tit-for-tat with one optimistic slot.
///
/// The optimistic peer is kept for `duration` passes, then the slot goes to
/// another random interested peer that did not make the cut.
#[derive(Debug)]
pub(crate) struct Choker {
    optimistic: Option<PeerKey>,
    remaining: u8,
    duration: u8,
}

impl Choker {
    pub fn new(duration: u8) -> Self {
        Self { optimistic: None, remaining: 0, duration: duration.max(1) }
    }

    pub fn optimistic(&self) -> Option<PeerKey> {
        self.optimistic
    }

    /// Drop a peer that disconnected.
    pub fn forget(&mut self, key: PeerKey) {
        if self.optimistic == Some(key) {
            self.optimistic = None;
            self.remaining = 0;
        }
    }

    /// Run a pass and return the new state of every candidate, true meaning
    /// unchoked.
    pub fn rechoke(
        &mut self,
        candidates: &[Candidate],
        slots: usize,
        rng: &mut impl Rng,
    ) -> Vec<(PeerKey, bool)> {
        if self.remaining > 0 {
            self.remaining -= 1;
        }
        if self.remaining == 0 {
            self.optimistic = None;
        }
        if let Some(opt) = self.optimistic {
            let still_eligible =
                candidates.iter().any(|c| c.key == opt && !c.seeder);
            if !still_eligible {
                self.forget(opt);
            }
        }

        let mut decisions = Vec::with_capacity(candidates.len());
        let mut ranked: Vec<(Candidate, f64)> =
            Vec::with_capacity(candidates.len());

        for c in candidates {
            if c.seeder {
                decisions.push((c.key, false));
            } else if Some(c.key) == self.optimistic {
                decisions.push((c.key, true));
            } else {
                ranked.push((*c, rng.gen::<f64>()));
            }
        }

        ranked.sort_by(|(a, salt_a), (b, salt_b)| {
            rank(a, b).then(salt_a.total_cmp(salt_b))
        });

        let top = slots.min(ranked.len());
        for (c, _) in &ranked[..top] {
            decisions.push((c.key, true));
        }

        let mut optimistic = None;
        if self.optimistic.is_none() && slots > 0 {
            let interested: Vec<PeerKey> = ranked[top..]
                .iter()
                .filter(|(c, _)| c.interested)
                .map(|(c, _)| c.key)
                .collect();
            if !interested.is_empty() {
                let pick = interested[rng.gen_range(0..interested.len())];
                self.optimistic = Some(pick);
                self.remaining = self.duration;
                optimistic = Some(pick);
            }
        }

        for (c, _) in &ranked[top..] {
            decisions.push((c.key, Some(c.key) == optimistic));
        }
        decisions
    }
}

/// Faster downloaders first, then faster uploads, then peers that were
/// already unchoked.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.download_rate
        .total_cmp(&a.download_rate)
        .then(b.upload_rate.total_cmp(&a.upload_rate))
        .then(b.unchoked.cmp(&a.unchoked))
}
