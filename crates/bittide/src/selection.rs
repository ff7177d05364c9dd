//! Ranges of pieces the local side wants, in priority order.
use std::fmt;

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
};

/// Called whenever a selection makes progress, and once more when it is
/// complete.
pub type Notify = Box<dyn FnMut() + Send + Sync>;

pub struct Selection {
    pub from: usize,
    pub to: usize,
    /// First index of `from..=to` that may still be missing.
    pub cursor: usize,
    pub priority: i32,
    notify: Option<Notify>,
}

impl Selection {
    fn notify(&mut self) {
        if let Some(notify) = self.notify.as_mut() {
            notify();
        }
    }
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("cursor", &self.cursor)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Copy of the schedulable part of a selection, the scheduler works on these
/// so it can mutate the manager while walking them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub cursor: usize,
    pub to: usize,
    pub priority: i32,
}

impl Span {
    pub fn indices(&self) -> std::ops::RangeInclusive<usize> {
        self.cursor..=self.to
    }
}

#[derive(Debug, Default)]
pub struct SelectionManager {
    /// Sorted by priority, highest first. Equal priorities keep insertion
    /// order.
    selections: Vec<Selection>,
    critical: Vec<bool>,
}

impl SelectionManager {
    pub fn new(num_pieces: usize) -> Self {
        Self { selections: Vec::new(), critical: vec![false; num_pieces] }
    }

    fn check_range(&self, start: usize, end: usize) -> Result<(), Error> {
        if start > end || end >= self.critical.len() {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(())
    }

    pub fn select(
        &mut self,
        start: usize,
        end: usize,
        priority: i32,
        notify: Option<Notify>,
    ) -> Result<(), Error> {
        self.check_range(start, end)?;
        let at = self.selections.partition_point(|s| s.priority >= priority);
        self.selections.insert(
            at,
            Selection { from: start, to: end, cursor: start, priority, notify },
        );
        Ok(())
    }

    /// Remove the first selection matching exactly. Returns false if there
    /// was none.
    pub fn deselect(
        &mut self,
        start: usize,
        end: usize,
        priority: i32,
    ) -> bool {
        let Some(i) = self.selections.iter().position(|s| {
            s.from == start && s.to == end && s.priority == priority
        }) else {
            return false;
        };
        self.selections.remove(i);
        true
    }

    /// Flag pieces to be requested right away, hotswapping if needed.
    pub fn critical(&mut self, start: usize, end: usize) -> Result<(), Error> {
        self.check_range(start, end)?;
        self.critical[start..=end].fill(true);
        Ok(())
    }

    pub fn is_critical(&self, index: usize) -> bool {
        self.critical.get(index).copied().unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.selections.len()
    }

    pub fn get(&self, i: usize) -> Option<&Selection> {
        self.selections.get(i)
    }

    pub fn spans(&self) -> Vec<Span> {
        self.selections
            .iter()
            .map(|s| Span { cursor: s.cursor, to: s.to, priority: s.priority })
            .collect()
    }

    /// Move the selection at `i` behind the others of the same priority.
    pub fn rotate(&mut self, i: usize) {
        let Some(priority) = self.selections.get(i).map(|s| s.priority) else {
            return;
        };
        let end = self.selections[i..]
            .iter()
            .position(|s| s.priority != priority)
            .map_or(self.selections.len(), |n| i + n);
        self.selections[i..end].rotate_left(1);
    }

    /// Advance cursors past verified pieces and drop complete selections.
    /// Returns how many selections were removed.
    pub fn gc(&mut self, bitfield: &Bitfield) -> usize {
        let before = self.selections.len();
        self.selections.retain_mut(|s| {
            let old = s.cursor;
            while s.cursor < s.to && bitfield.has(s.cursor) {
                s.cursor += 1;
            }
            if s.cursor != old {
                s.notify();
            }
            if s.cursor == s.to && bitfield.has(s.to) {
                s.notify();
                return false;
            }
            true
        });
        before - self.selections.len()
    }
}
