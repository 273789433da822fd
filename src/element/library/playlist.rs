//! Playlist policy: plays a fixed list of media one after the other

use parking_lot::Mutex;

use crate::element::{Policy, PolicyDrivenElement};

/// Plays each entry in order, optionally starting over at the end
pub struct PlaylistPolicy {
    name: String,
    playlist: Vec<String>,
    looping: bool,
    index: Mutex<Option<usize>>,
}

impl PlaylistPolicy {
    /// Create a playlist
    pub fn new(name: impl Into<String>, playlist: Vec<String>, looping: bool) -> Self {
        Self {
            name: name.into(),
            playlist,
            looping,
            index: Mutex::new(None),
        }
    }

    /// Index of the entry playing now
    pub fn position(&self) -> Option<usize> {
        *self.index.lock()
    }

    /// Switch to the next entry that can be attached
    ///
    /// Entries that fail to attach are skipped; every entry is tried at
    /// most once per call.
    fn advance(&self, element: &dyn PolicyDrivenElement) -> bool {
        for _ in 0..self.playlist.len() {
            let next = {
                let mut index = self.index.lock();
                let next = index.map_or(0, |i| i + 1);
                let next = if next < self.playlist.len() {
                    next
                } else if self.looping {
                    0
                } else {
                    tracing::info!(policy = %self.name, "Playlist finished");
                    return false;
                };
                *index = Some(next);
                next
            };
            let media = &self.playlist[next];
            if element.switch_current_media(media, None, true) {
                tracing::debug!(policy = %self.name, media = %media, index = next, "Playlist advanced");
                return true;
            }
            tracing::warn!(policy = %self.name, media = %media, "Skipping playlist entry");
        }
        false
    }
}

impl Policy for PlaylistPolicy {
    fn kind(&self) -> &str {
        "playlist"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self, element: &dyn PolicyDrivenElement) -> bool {
        self.reset();
        self.advance(element)
    }

    fn reset(&self) {
        *self.index.lock() = None;
    }

    fn notify_eos(&self, element: &dyn PolicyDrivenElement) -> bool {
        self.advance(element)
    }
}
