//! RTMP play stream
//!
//! Serves one `play` on a message stream. Session outcomes become
//! `onStatus` events; media goes out as audio/video/data messages.
//!
//! Status codes:
//! ```text
//! NetStream.Play.StreamNotFound   not found, attach failed
//! NetStream.Play.Failed           too many clients, (re)authorization
//! NetStream.Play.Reset/Start      play started
//! NetStream.Play.Complete/Stop    EOS
//! NetStream.Play.Switch           source switched
//! NetStream.Seek.Notify/Failed    seek
//! NetStream.Pause.Notify/Failed   pause
//! NetStream.Unpause.Notify        resume
//! ```

use std::time::Instant;

use bytes::Bytes;

use super::OutboundBuffer;
use crate::callback::Closure;
use crate::error::ControlOp;
use crate::request::Request;
use crate::session::ExportProtocol;
use crate::tag::{Tag, TagKind};

/// `onStatus` level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Status,
    Error,
}

impl StatusLevel {
    /// Wire value
    pub fn as_str(self) -> &'static str {
        match self {
            StatusLevel::Status => "status",
            StatusLevel::Error => "error",
        }
    }
}

/// RTMP message type of an outgoing media payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaMessage {
    Audio,
    Video,
    Data,
}

/// The connection side a play stream writes through
pub trait RtmpConnection: Send + 'static {
    /// Send an `onStatus` event on `stream_id`
    fn send_status(&mut self, stream_id: u32, level: StatusLevel, code: &str, description: &str);

    /// Send a media message on `stream_id`
    fn send_media(&mut self, stream_id: u32, kind: MediaMessage, timestamp: u32, data: Bytes);

    /// Outbound byte accounting
    fn outbound(&self) -> &OutboundBuffer;

    /// Close the whole connection
    fn close(&mut self);

    /// The peer went away
    fn is_closed(&self) -> bool;

    /// The exporter is done with the stream
    fn release(&mut self) {}
}

/// Per-stream counters
#[derive(Debug, Clone, Default)]
pub struct PlayStats {
    /// Time play started
    pub started_at: Option<Instant>,
    /// Video messages sent
    pub video_frames: u64,
    /// Audio messages sent
    pub audio_frames: u64,
    /// Keyframes sent
    pub keyframes: u64,
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Last media timestamp sent
    pub last_ts: u32,
}

/// [`ExportProtocol`] for one RTMP `play`
pub struct PlayStream<C: RtmpConnection> {
    conn: C,
    stream_id: u32,
    stream_name: String,
    /// Session over for this stream
    done: bool,
    /// A seek was confirmed and awaits its `SeekPerformed`
    seeking: bool,
    /// A source ended; announce the switch before the next payload
    switch_pending: bool,
    stats: PlayStats,
}

impl<C: RtmpConnection> PlayStream<C> {
    /// Create a play stream on message stream `stream_id`
    pub fn new(conn: C, stream_id: u32, stream_name: impl Into<String>) -> Self {
        Self {
            conn,
            stream_id,
            stream_name: stream_name.into(),
            done: false,
            seeking: false,
            switch_pending: false,
            stats: PlayStats::default(),
        }
    }

    /// The connection
    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Message stream id
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Name given to `play`
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Counters
    pub fn stats(&self) -> &PlayStats {
        &self.stats
    }

    fn status(&mut self, level: StatusLevel, code: &str, description: &str) {
        if self.conn.is_closed() {
            return;
        }
        tracing::debug!(stream_id = self.stream_id, stream = %self.stream_name, code = %code, "Sending status");
        self.conn.send_status(self.stream_id, level, code, description);
    }

    fn fail(&mut self, code: &str, description: &str) {
        if self.done {
            return;
        }
        self.done = true;
        self.status(StatusLevel::Error, code, description);
    }

    fn send_media(&mut self, tag: &Tag, timestamp_ms: i64) {
        match tag.kind() {
            TagKind::Media { data, .. } => {
                let kind = if tag.is_video() {
                    MediaMessage::Video
                } else if tag.is_audio() {
                    MediaMessage::Audio
                } else {
                    MediaMessage::Data
                };
                let ts = timestamp_ms.max(0) as u32;
                match kind {
                    MediaMessage::Video => {
                        self.stats.video_frames += 1;
                        if tag.can_resync() {
                            self.stats.keyframes += 1;
                        }
                    }
                    MediaMessage::Audio => self.stats.audio_frames += 1,
                    MediaMessage::Data => {}
                }
                self.stats.bytes_sent += data.len() as u64;
                self.stats.last_ts = ts;
                self.conn.send_media(self.stream_id, kind, ts, data.clone());
            }
            TagKind::Composed(tags) => {
                for t in tags.iter() {
                    self.send_media(t, timestamp_ms + t.timestamp_ms());
                }
            }
            _ => {}
        }
    }
}

impl<C: RtmpConnection> ExportProtocol for PlayStream<C> {
    fn protocol_name(&self) -> &str {
        "rtmp"
    }

    fn is_closed(&self) -> bool {
        self.done || self.conn.is_closed()
    }

    fn on_stream_not_found(&mut self) {
        self.fail("NetStream.Play.StreamNotFound", "Export not found");
    }

    fn on_too_many_clients(&mut self) {
        self.fail("NetStream.Play.Failed", "Too many requests");
    }

    fn on_authorization_failed(&mut self) {
        self.fail("NetStream.Play.Failed", "Authorization failed");
    }

    fn on_reauthorization_failed(&mut self) {
        self.fail("NetStream.Play.Failed", "Reauthorization failed");
    }

    fn on_add_request_failed(&mut self) {
        self.fail("NetStream.Play.StreamNotFound", "Stream not found");
    }

    fn on_play(&mut self, _req: &Request) {
        self.stats.started_at = Some(Instant::now());
        self.status(StatusLevel::Status, "NetStream.Play.Reset", "Play reset");
        self.status(StatusLevel::Status, "NetStream.Play.Start", "Play started");
    }

    fn on_control_failed(&mut self, op: ControlOp) {
        match op {
            ControlOp::Pause => self.status(StatusLevel::Error, "NetStream.Pause.Failed", "Pause failed"),
            ControlOp::Seek => self.status(StatusLevel::Error, "NetStream.Seek.Failed", "Seek failed"),
        }
    }

    fn on_paused(&mut self, paused: bool) {
        if paused {
            self.status(StatusLevel::Status, "NetStream.Pause.Notify", "Stream paused");
        } else {
            self.status(StatusLevel::Status, "NetStream.Unpause.Notify", "Stream resumed");
        }
    }

    fn on_seeked(&mut self, _seek_ms: i64) {
        self.seeking = true;
    }

    fn can_send_tag(&self) -> bool {
        !self.is_closed() && self.conn.outbound().can_send()
    }

    fn set_notify_ready(&mut self, ready: Closure) {
        if self.is_closed() {
            return;
        }
        self.conn.outbound().set_ready_callback(ready);
    }

    fn send_tag(&mut self, tag: &Tag, timestamp_ms: i64) {
        if self.is_closed() {
            return;
        }
        match tag.kind() {
            TagKind::Eos { forced } => {
                self.status(StatusLevel::Status, "NetStream.Play.Complete", "EOS");
                self.status(StatusLevel::Status, "NetStream.Play.Stop", "EOS");
                self.done = true;
                if *forced {
                    self.conn.close();
                }
            }
            TagKind::SourceEnded(_) => self.switch_pending = true,
            TagKind::SeekPerformed => {
                if std::mem::take(&mut self.seeking) {
                    self.status(StatusLevel::Status, "NetStream.Seek.Notify", "Seek completed");
                    self.status(StatusLevel::Status, "NetStream.Play.Start", "Play started");
                }
            }
            TagKind::Media { .. } | TagKind::Composed(_) => {
                if std::mem::take(&mut self.switch_pending) {
                    self.status(StatusLevel::Status, "NetStream.Play.Complete", "SWITCH");
                    self.status(StatusLevel::Status, "NetStream.Play.Switch", "SWITCH");
                }
                self.send_media(tag, timestamp_ms);
            }
            _ => {}
        }
    }

    fn on_transport_closed(&mut self) {
        self.done = true;
        self.conn.outbound().close();
    }

    fn on_released(&mut self) {
        self.conn.release();
    }
}
