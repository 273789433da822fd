//! In-memory connections
//!
//! Loopback implementations of [`HttpConnection`] and [`RtmpConnection`]
//! that record what the session writes. Each comes with a log handle for
//! inspection and for driving the peer side (draining, disconnecting).

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::http::{HttpConnection, HttpStatus};
use super::rtmp::{MediaMessage, RtmpConnection, StatusLevel};
use super::OutboundBuffer;
use crate::selector::Selector;

/// Something an HTTP connection was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpEvent {
    /// Body-less reply
    Status(u16),
    /// Streamed reply started
    Begin {
        status: u16,
        headers: Vec<(String, String)>,
    },
    /// Body bytes
    Data(Bytes),
    /// Streamed reply finished
    End,
    /// Connection released by the exporter
    Released,
}

struct Peer<E> {
    events: Vec<E>,
    disconnected: bool,
    auto_drain: bool,
}

impl<E> Default for Peer<E> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            disconnected: false,
            auto_drain: true,
        }
    }
}

/// Shared recorder behind a memory connection
///
/// Writes drain immediately unless [`Log::set_auto_drain`] turned that off.
pub struct Log<E> {
    peer: Arc<Mutex<Peer<E>>>,
    outbound: OutboundBuffer,
}

impl<E> Clone for Log<E> {
    fn clone(&self) -> Self {
        Self {
            peer: Arc::clone(&self.peer),
            outbound: self.outbound.clone(),
        }
    }
}

impl<E: Clone> Log<E> {
    fn new(selector: Arc<Selector>, max_buffer: usize) -> Self {
        Self {
            peer: Arc::new(Mutex::new(Peer::default())),
            outbound: OutboundBuffer::new(selector, max_buffer),
        }
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<E> {
        self.peer.lock().events.clone()
    }

    /// Keep written bytes pending until [`Log::drain`]
    pub fn set_auto_drain(&self, auto_drain: bool) {
        self.peer.lock().auto_drain = auto_drain;
    }

    /// Let the socket take `len` bytes
    pub fn drain(&self, len: usize) {
        self.outbound.consume(len);
    }

    /// Bytes written but not drained
    pub fn pending(&self) -> usize {
        self.outbound.pending()
    }

    /// The peer hangs up
    pub fn disconnect(&self) {
        self.peer.lock().disconnected = true;
        self.outbound.close();
    }

    fn record(&self, event: E) {
        self.peer.lock().events.push(event);
    }

    fn written(&self, len: usize) {
        self.outbound.push(len);
        if self.peer.lock().auto_drain {
            self.outbound.consume(len);
        }
    }

    fn is_disconnected(&self) -> bool {
        self.peer.lock().disconnected
    }
}

/// Recorder of a [`MemoryHttpConnection`]
pub type HttpLog = Log<HttpEvent>;

impl HttpLog {
    /// Statuses replied or streamed with
    pub fn statuses(&self) -> Vec<u16> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HttpEvent::Status(code) | HttpEvent::Begin { status: code, .. } => Some(code),
                _ => None,
            })
            .collect()
    }

    /// Body bytes written
    pub fn body(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HttpEvent::Data(d) => Some(d),
                _ => None,
            })
            .flat_map(|d| d.to_vec())
            .collect()
    }

    /// Times the exporter released the connection
    pub fn releases(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == HttpEvent::Released)
            .count()
    }
}

/// Loopback HTTP exchange
pub struct MemoryHttpConnection {
    path: String,
    accept: Option<String>,
    log: HttpLog,
}

impl MemoryHttpConnection {
    /// Create an exchange for `path` with an outbound buffer of `max_buffer` bytes
    pub fn new(selector: Arc<Selector>, path: impl Into<String>, max_buffer: usize) -> (Self, HttpLog) {
        let log = HttpLog::new(selector, max_buffer);
        (
            Self {
                path: path.into(),
                accept: None,
                log: log.clone(),
            },
            log,
        )
    }

    /// Set the request `Accept` header
    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }
}

impl HttpConnection for MemoryHttpConnection {
    fn path(&self) -> &str {
        &self.path
    }

    fn accept(&self) -> Option<&str> {
        self.accept.as_deref()
    }

    fn outbound(&self) -> &OutboundBuffer {
        &self.log.outbound
    }

    fn reply_with_status(&mut self, status: HttpStatus) {
        self.log.record(HttpEvent::Status(status.code()));
    }

    fn begin_streaming(&mut self, status: HttpStatus, headers: &[(String, String)]) {
        self.log.record(HttpEvent::Begin {
            status: status.code(),
            headers: headers.to_vec(),
        });
    }

    fn write(&mut self, data: Bytes) {
        let len = data.len();
        self.log.record(HttpEvent::Data(data));
        self.log.written(len);
    }

    fn end_streaming(&mut self) {
        self.log.record(HttpEvent::End);
    }

    fn is_closed(&self) -> bool {
        self.log.is_disconnected()
    }

    fn release(&mut self) {
        self.log.record(HttpEvent::Released);
    }
}

/// Something an RTMP connection was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtmpEvent {
    /// `onStatus`
    Status {
        stream_id: u32,
        level: StatusLevel,
        code: String,
    },
    /// Media message
    Media {
        stream_id: u32,
        kind: MediaMessage,
        timestamp: u32,
        len: usize,
    },
    /// Connection closed by the server
    Closed,
    /// Stream released by the exporter
    Released,
}

/// Recorder of a [`MemoryRtmpConnection`]
pub type RtmpLog = Log<RtmpEvent>;

impl RtmpLog {
    /// Status codes in order
    pub fn status_codes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RtmpEvent::Status { code, .. } => Some(code),
                _ => None,
            })
            .collect()
    }

    /// Timestamps of media messages in order
    pub fn media_timestamps(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RtmpEvent::Media { timestamp, .. } => Some(timestamp),
                _ => None,
            })
            .collect()
    }

    /// Whether the server closed the connection
    pub fn is_connection_closed(&self) -> bool {
        self.events().contains(&RtmpEvent::Closed)
    }

    /// Times the exporter released the stream
    pub fn releases(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == RtmpEvent::Released)
            .count()
    }
}

/// Loopback RTMP connection
pub struct MemoryRtmpConnection {
    log: RtmpLog,
    closed: bool,
}

impl MemoryRtmpConnection {
    /// Create a connection with an outbound buffer of `max_buffer` bytes
    pub fn new(selector: Arc<Selector>, max_buffer: usize) -> (Self, RtmpLog) {
        let log = RtmpLog::new(selector, max_buffer);
        (
            Self {
                log: log.clone(),
                closed: false,
            },
            log,
        )
    }
}

impl RtmpConnection for MemoryRtmpConnection {
    fn send_status(&mut self, stream_id: u32, level: StatusLevel, code: &str, _description: &str) {
        self.log.record(RtmpEvent::Status {
            stream_id,
            level,
            code: code.to_string(),
        });
    }

    fn send_media(&mut self, stream_id: u32, kind: MediaMessage, timestamp: u32, data: Bytes) {
        self.log.record(RtmpEvent::Media {
            stream_id,
            kind,
            timestamp,
            len: data.len(),
        });
        self.log.written(data.len());
    }

    fn outbound(&self) -> &OutboundBuffer {
        &self.log.outbound
    }

    fn close(&mut self) {
        if !std::mem::replace(&mut self.closed, true) {
            self.log.record(RtmpEvent::Closed);
            self.log.outbound.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed || self.log.is_disconnected()
    }

    fn release(&mut self) {
        self.log.record(RtmpEvent::Released);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_drain() {
        let selector = Selector::spawn("net").unwrap();
        let (mut conn, log) = MemoryHttpConnection::new(Arc::clone(&selector), "/a", 100);
        log.set_auto_drain(false);

        conn.write(Bytes::from_static(&[0u8; 60]));
        assert_eq!(log.pending(), 60);
        assert!(!conn.outbound().can_send());
        log.drain(20);
        assert!(conn.outbound().can_send());
        assert_eq!(log.body().len(), 60);

        log.disconnect();
        assert!(conn.is_closed());
        selector.stop_and_join();
    }
}
