use crate::types::{ContentId, PinTier};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    tier: PinTier,
    seq: u64,
    content_id: ContentId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.tier, self.seq).cmp(&(other.tier, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Tier-ordered pin queue. FIFO within a tier; an item is queued at most once.
#[derive(Debug, Default)]
pub struct PinQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    queued: HashSet<ContentId>,
    next_seq: u64,
}

impl PinQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the item is already waiting.
    pub fn push(&mut self, content_id: impl Into<ContentId>, tier: PinTier) -> bool {
        let content_id = content_id.into();
        if !self.queued.insert(content_id.clone()) {
            return false;
        }
        self.heap.push(Reverse(Entry {
            tier,
            seq: self.next_seq,
            content_id,
        }));
        self.next_seq += 1;
        true
    }

    pub fn pop(&mut self) -> Option<(ContentId, PinTier)> {
        let Reverse(entry) = self.heap.pop()?;
        self.queued.remove(&entry.content_id);
        Some((entry.content_id, entry.tier))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, content_id: &str) -> bool {
        self.queued.contains(content_id)
    }
}
