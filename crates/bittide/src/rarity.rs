//! How many connected peers hold each piece.
use crate::bitfield::Bitfield;

/// Per piece count of the peers that announced it, used by the rarest-first
/// strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RarityMap {
    counts: Vec<usize>,
}

impl RarityMap {
    pub fn new(num_pieces: usize) -> Self {
        Self { counts: vec![0; num_pieces] }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Number of peers holding the piece.
    pub fn count(&self, index: usize) -> usize {
        self.counts.get(index).copied().unwrap_or(0)
    }

    /// Count every piece of a newly received bitfield.
    pub fn observe(&mut self, pieces: &Bitfield) {
        for index in pieces.iter_ones() {
            self.observe_piece(index);
        }
    }

    /// Count a single `have`.
    pub fn observe_piece(&mut self, index: usize) {
        if let Some(count) = self.counts.get_mut(index) {
            *count += 1;
        }
    }

    /// Undo [`observe`] for a peer that went away.
    ///
    /// [`observe`]: Self::observe
    pub fn forget(&mut self, pieces: &Bitfield) {
        for index in pieces.iter_ones() {
            if let Some(count) = self.counts.get_mut(index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Index with the fewest holders among those accepted by `filter`.
    /// Ties go to the lowest index.
    pub fn get_rarest_piece(
        &self,
        mut filter: impl FnMut(usize) -> bool,
    ) -> Option<usize> {
        let mut rarest: Option<(usize, usize)> = None;
        for (index, &count) in self.counts.iter().enumerate() {
            if rarest.is_some_and(|(_, min)| count >= min) || !filter(index) {
                continue;
            }
            rarest = Some((index, count));
        }
        rarest.map(|(index, _)| index)
    }
}
