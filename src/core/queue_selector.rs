//! Play-next ordering
//!
//! Most upvotes wins. Ties go to the earliest submission, then to the lowest
//! insertion sequence, so the choice is deterministic for any input order.

use std::cmp::Ordering;

use crate::storage::QueueEntry;

/// Pick the next unplayed entry, if any
pub fn select_next(entries: &[QueueEntry]) -> Option<&QueueEntry> {
    entries
        .iter()
        .filter(|entry| !entry.item.played)
        .min_by(|a, b| play_order(a, b))
}

/// Total order in which unplayed entries should be played
pub fn play_order(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    b.upvotes
        .cmp(&a.upvotes)
        .then_with(|| a.item.created_at.cmp(&b.item.created_at))
        .then_with(|| a.seq.cmp(&b.seq))
}
