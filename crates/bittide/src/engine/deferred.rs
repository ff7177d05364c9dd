use std::collections::VecDeque;

/// Work scheduled to run once the current message is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    GcSelections,
    Update,
}

/// Queue of deferred passes. Scheduling a pass that is already pending does
/// nothing, so any number of triggers inside one cycle run it once.
#[derive(Debug, Default)]
pub(crate) struct DeferredQueue {
    queue: VecDeque<Deferred>,
}

impl DeferredQueue {
    pub fn push(&mut self, work: Deferred) {
        if !self.queue.contains(&work) {
            self.queue.push_back(work);
        }
    }

    pub fn pop(&mut self) -> Option<Deferred> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_in_order() {
        let mut q = DeferredQueue::default();
        q.push(Deferred::GcSelections);
        q.push(Deferred::Update);
        q.push(Deferred::GcSelections);
        q.push(Deferred::Update);

        assert_eq!(q.pop(), Some(Deferred::GcSelections));
        // once popped it may be scheduled again
        q.push(Deferred::GcSelections);
        assert_eq!(q.pop(), Some(Deferred::Update));
        assert_eq!(q.pop(), Some(Deferred::GcSelections));
        assert!(q.is_empty());
    }
}
