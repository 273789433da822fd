//! Catch-up cache for late joiners
//!
//! A request attaching to a running stream needs, in order:
//! 1. The media description and cue points
//! 2. Metadata and sequence headers
//! 3. The most recent video keyframe and everything since
//!
//! so that its decoder can start immediately instead of waiting for the
//! next keyframe.

use std::collections::VecDeque;

use crate::tag::{Tag, TagKind};

/// Default cap on cached frame bytes (4MB)
pub const DEFAULT_MAX_BOOTSTRAP_SIZE: usize = 4 * 1024 * 1024;

/// Per-stream catch-up cache
#[derive(Debug)]
pub struct Bootstrapper {
    max_size: usize,
    current_size: usize,
    media_info: Option<Tag>,
    cue_points: Option<Tag>,
    metadata: Option<Tag>,
    video_header: Option<Tag>,
    audio_header: Option<Tag>,
    /// Frames since the last video keyframe
    frames: VecDeque<Tag>,
    has_complete_gop: bool,
}

impl Bootstrapper {
    /// Create a cache with the default size cap
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_BOOTSTRAP_SIZE)
    }

    /// Create a cache holding at most `max_size` bytes of frames
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            media_info: None,
            cue_points: None,
            metadata: None,
            video_header: None,
            audio_header: None,
            frames: VecDeque::new(),
            has_complete_gop: false,
        }
    }

    /// Account for a tag that went out live
    pub fn push(&mut self, tag: &Tag) {
        match tag.kind() {
            TagKind::MediaInfo(_) => self.media_info = Some(tag.clone()),
            TagKind::CuePoint(_) => self.cue_points = Some(tag.clone()),
            TagKind::Media { .. } | TagKind::Composed(_) if tag.is_metadata() => {
                if tag.is_video() {
                    self.video_header = Some(tag.clone());
                } else if tag.is_audio() {
                    self.audio_header = Some(tag.clone());
                } else {
                    self.metadata = Some(tag.clone());
                }
            }
            TagKind::Media { .. } | TagKind::Composed(_) => self.push_frame(tag),
            _ => {}
        }
    }

    fn push_frame(&mut self, tag: &Tag) {
        if tag.is_video() && tag.can_resync() {
            self.clear_frames();
            self.has_complete_gop = true;
        }

        let size = tag.size();
        while self.current_size + size > self.max_size {
            match self.frames.pop_front() {
                Some(old) => self.current_size -= old.size(),
                None => return,
            }
        }
        self.frames.push_back(tag.clone());
        self.current_size += size;
    }

    /// Drop cached frames, keeping headers
    pub fn clear_frames(&mut self) {
        self.frames.clear();
        self.current_size = 0;
        self.has_complete_gop = false;
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.clear_frames();
        self.media_info = None;
        self.cue_points = None;
        self.metadata = None;
        self.video_header = None;
        self.audio_header = None;
    }

    /// Whether a full GOP (starting at a keyframe) is cached
    pub fn has_complete_gop(&self) -> bool {
        self.has_complete_gop
    }

    /// Number of cached frames
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Cached frame bytes
    pub fn size(&self) -> usize {
        self.current_size
    }

    /// Catch-up sequence for a request in `flavour_mask`
    ///
    /// Wrapped in `BootstrapBegin`/`BootstrapEnd`; paired with the
    /// delivery timestamps to use, which never decrease. Empty when
    /// nothing is cached.
    pub fn catchup(&self, flavour_mask: u32) -> Vec<(Tag, i64)> {
        let cached: Vec<&Tag> = [
            &self.media_info,
            &self.cue_points,
            &self.metadata,
            &self.video_header,
            &self.audio_header,
        ]
        .into_iter()
        .flatten()
        .chain(self.frames.iter())
        .filter(|t| t.flavour_mask() & flavour_mask != 0)
        .collect();

        let Some(first) = cached.first() else {
            return Vec::new();
        };
        let flavour = first.flavour_mask();
        let mut ts = first.timestamp_ms();
        let mut out = Vec::with_capacity(cached.len() + 2);
        out.push((Tag::bootstrap_begin(flavour, ts), ts));
        for tag in cached {
            ts = ts.max(tag.timestamp_ms());
            out.push((tag.clone(), ts));
        }
        out.push((Tag::bootstrap_end(flavour, ts), ts));
        out
    }
}

impl Default for Bootstrapper {
    fn default() -> Self {
        Self::new()
    }
}
