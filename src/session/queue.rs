//! Tags scheduled between the media and the net selector

use std::collections::VecDeque;

use crate::tag::Tag;

/// FIFO of `(tag, timestamp_ms)` waiting to be written
///
/// Its length in time (`back.ts - front.ts`) drives flow control.
#[derive(Debug, Default)]
pub struct TagQueue {
    tags: VecDeque<(Tag, i64)>,
}

impl TagQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tag
    pub fn push(&mut self, tag: Tag, timestamp_ms: i64) {
        self.tags.push_back((tag, timestamp_ms));
    }

    /// Oldest tag
    pub fn front(&self) -> Option<&(Tag, i64)> {
        self.tags.front()
    }

    /// Remove the oldest tag
    pub fn pop(&mut self) -> Option<(Tag, i64)> {
        self.tags.pop_front()
    }

    /// Number of tags
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Time span covered by the queue
    pub fn len_ms(&self) -> i64 {
        match (self.tags.front(), self.tags.back()) {
            (Some((_, first)), Some((_, last))) => (last - first).max(0),
            _ => 0,
        }
    }

    /// Whether the newest tag is an EOS
    pub fn ends_with_eos(&self) -> bool {
        self.tags.back().is_some_and(|(t, _)| t.is_eos())
    }

    /// Drop everything; returns how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.tags.len();
        self.tags.clear();
        dropped
    }
}
