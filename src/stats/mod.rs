//! Session statistics
//!
//! A [`StatsCollector`] receives begin/end records bracketing every
//! connection and every stream served. Calls are fire-and-forget.

mod metrics;

pub use metrics::ExportMetrics;

use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;

/// A connection was accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionBegin {
    /// Connection id
    pub connection_id: u64,
    /// Wire protocol (`"http"`, `"rtmp"`)
    pub protocol: String,
    /// Peer address
    pub remote_address: Option<SocketAddr>,
    /// Local address
    pub local_address: Option<SocketAddr>,
}

/// A connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEnd {
    /// Connection id
    pub connection_id: u64,
    /// Why it ended
    pub result: String,
    /// How long it lasted
    pub duration: Duration,
    /// Bytes written to the peer
    pub bytes_sent: u64,
}

/// A stream started playing
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamBegin {
    /// Stream id (the request id)
    pub stream_id: u64,
    /// Wire protocol
    pub protocol: String,
    /// Media being served
    pub media: String,
    /// Session id from the request
    pub session_id: String,
    /// Client id from the request
    pub client_id: String,
    /// Affiliate id from the request
    pub affiliate_id: String,
    /// Peer address
    pub remote_address: Option<SocketAddr>,
    /// Peer user agent
    pub user_agent: String,
}

/// A stream ended
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamEnd {
    /// Stream id (the request id)
    pub stream_id: u64,
    /// Outcome (`"EOS"`, `"END"`, `"AUTHORIZATION FAILED"`, ...)
    pub result: String,
    /// How long it played
    pub duration: Duration,
    /// Tags written to the wire
    pub tags_sent: u64,
    /// Tags dropped by flow control
    pub tags_dropped: u64,
    /// Payload bytes written
    pub bytes_sent: u64,
}

/// Opening record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsBegin {
    /// Connection accepted
    Connection(ConnectionBegin),
    /// Stream started
    Stream(StreamBegin),
}

/// Closing record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsEnd {
    /// Connection closed
    Connection(ConnectionEnd),
    /// Stream ended
    Stream(StreamEnd),
}

/// Sink for statistics records
pub trait StatsCollector: Send + Sync {
    /// Something started
    fn start_stats(&self, begin: &StatsBegin);

    /// Something ended
    fn end_stats(&self, end: &StatsEnd);
}

/// Writes records to the log
#[derive(Debug, Default)]
pub struct LogStatsCollector;

impl StatsCollector for LogStatsCollector {
    fn start_stats(&self, begin: &StatsBegin) {
        match begin {
            StatsBegin::Connection(c) => tracing::info!(
                connection_id = c.connection_id,
                protocol = %c.protocol,
                remote = ?c.remote_address,
                "Connection begin"
            ),
            StatsBegin::Stream(s) => tracing::info!(
                stream_id = s.stream_id,
                protocol = %s.protocol,
                media = %s.media,
                session_id = %s.session_id,
                client_id = %s.client_id,
                affiliate_id = %s.affiliate_id,
                "Stream begin"
            ),
        }
    }

    fn end_stats(&self, end: &StatsEnd) {
        match end {
            StatsEnd::Connection(c) => tracing::info!(
                connection_id = c.connection_id,
                result = %c.result,
                duration_ms = c.duration.as_millis() as u64,
                bytes_sent = c.bytes_sent,
                "Connection end"
            ),
            StatsEnd::Stream(s) => tracing::info!(
                stream_id = s.stream_id,
                result = %s.result,
                duration_ms = s.duration.as_millis() as u64,
                tags_sent = s.tags_sent,
                tags_dropped = s.tags_dropped,
                bytes_sent = s.bytes_sent,
                "Stream end"
            ),
        }
    }
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryStatsCollector {
    begins: Mutex<Vec<StatsBegin>>,
    ends: Mutex<Vec<StatsEnd>>,
}

impl MemoryStatsCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Opening records so far
    pub fn begins(&self) -> Vec<StatsBegin> {
        self.begins.lock().clone()
    }

    /// Closing records so far
    pub fn ends(&self) -> Vec<StatsEnd> {
        self.ends.lock().clone()
    }

    /// Stream end records
    pub fn stream_ends(&self) -> Vec<StreamEnd> {
        self.ends
            .lock()
            .iter()
            .filter_map(|e| match e {
                StatsEnd::Stream(s) => Some(s.clone()),
                StatsEnd::Connection(_) => None,
            })
            .collect()
    }

    /// Number of streams begun and not yet ended
    pub fn open_streams(&self) -> usize {
        let begun = self
            .begins
            .lock()
            .iter()
            .filter(|b| matches!(b, StatsBegin::Stream(_)))
            .count();
        begun.saturating_sub(self.stream_ends().len())
    }
}

impl StatsCollector for MemoryStatsCollector {
    fn start_stats(&self, begin: &StatsBegin) {
        self.begins.lock().push(begin.clone());
    }

    fn end_stats(&self, end: &StatsEnd) {
        self.ends.lock().push(end.clone());
    }
}
