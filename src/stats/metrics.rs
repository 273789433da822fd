//! Per-export counters

use std::time::{Duration, Instant};

use crate::tag::Tag;

/// Counters kept by an exporter while it serves one request
#[derive(Debug, Clone)]
pub struct ExportMetrics {
    /// When serving started
    pub started_at: Instant,
    /// Tags written to the wire
    pub tags_sent: u64,
    /// Media tags written to the wire
    pub media_tags_sent: u64,
    /// Keyframes written
    pub keyframes_sent: u64,
    /// Tags dropped by flow control
    pub tags_dropped: u64,
    /// Payload bytes written
    pub bytes_sent: u64,
    /// Timestamp of the first media tag written
    pub first_media_ts: Option<i64>,
    /// Timestamp of the last media tag written
    pub last_media_ts: Option<i64>,
}

impl Default for ExportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportMetrics {
    /// Start counting now
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            tags_sent: 0,
            media_tags_sent: 0,
            keyframes_sent: 0,
            tags_dropped: 0,
            bytes_sent: 0,
            first_media_ts: None,
            last_media_ts: None,
        }
    }

    /// Count a tag written at `timestamp_ms`
    pub fn record_sent(&mut self, tag: &Tag, timestamp_ms: i64) {
        self.tags_sent += 1;
        self.bytes_sent += tag.size() as u64;
        if tag.is_media() {
            self.media_tags_sent += 1;
            if tag.is_video() && tag.can_resync() {
                self.keyframes_sent += 1;
            }
            self.first_media_ts.get_or_insert(timestamp_ms);
            self.last_media_ts = Some(timestamp_ms);
        }
    }

    /// Count a dropped tag
    pub fn record_dropped(&mut self) {
        self.tags_dropped += 1;
    }

    /// Wall time since serving started
    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Media time covered by the tags written
    pub fn media_duration_ms(&self) -> i64 {
        match (self.first_media_ts, self.last_media_ts) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        }
    }

    /// Average bits per second over the wall time
    pub fn bitrate(&self) -> u64 {
        let millis = self.duration().as_millis() as u64;
        if millis > 0 {
            self.bytes_sent * 8 * 1000 / millis
        } else {
            0
        }
    }
}
