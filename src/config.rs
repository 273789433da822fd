//! Exporter configuration

use std::time::Duration;

/// Default HTTP reply buffer in bytes
pub const DEFAULT_MAX_REPLY_BUFFER_SIZE: usize = 100_000;

/// Exporter configuration options
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Path prefix stripped from incoming request paths
    pub base_media_path: String,

    /// Tags may be sent this far ahead of real time; 0 sends as fast as
    /// the wire takes them
    pub max_write_ahead_ms: i64,

    /// Outbound buffer of one reply in bytes
    pub max_reply_buffer_size: usize,

    /// An authorizer silent for longer than this denies
    pub authorization_timeout: Duration,

    /// Queue length that pauses the producer when no drop threshold is set
    pub flow_control_pause_ms: i64,

    /// Default cap of clients per export (`None` = unlimited)
    pub default_max_clients: Option<u32>,

    /// Send a `Flush` tag to the wire when a source changes
    pub flush_on_source_change: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            base_media_path: "media".to_string(),
            max_write_ahead_ms: 5000,
            max_reply_buffer_size: DEFAULT_MAX_REPLY_BUFFER_SIZE,
            authorization_timeout: Duration::from_secs(10),
            flow_control_pause_ms: 500,
            default_max_clients: None,
            flush_on_source_change: false,
        }
    }
}

impl ExportConfig {
    /// Set the base media path
    pub fn base_media_path(mut self, path: impl Into<String>) -> Self {
        self.base_media_path = path.into().trim_matches('/').to_string();
        self
    }

    /// Set the write-ahead window
    pub fn max_write_ahead_ms(mut self, ms: i64) -> Self {
        self.max_write_ahead_ms = ms.max(0);
        self
    }

    /// Set the reply buffer size
    pub fn max_reply_buffer_size(mut self, size: usize) -> Self {
        self.max_reply_buffer_size = size.max(1);
        self
    }

    /// Set the authorization timeout
    pub fn authorization_timeout(mut self, timeout: Duration) -> Self {
        self.authorization_timeout = timeout;
        self
    }

    /// Set the flow-control pause threshold
    pub fn flow_control_pause_ms(mut self, ms: i64) -> Self {
        self.flow_control_pause_ms = ms;
        self
    }

    /// Cap clients on exports that don't set their own cap
    pub fn default_max_clients(mut self, max: u32) -> Self {
        self.default_max_clients = Some(max);
        self
    }

    /// Flush the wire on source changes
    pub fn flush_on_source_change(mut self) -> Self {
        self.flush_on_source_change = true;
        self
    }

    /// Strip the base media path from a request path
    ///
    /// Returns `None` when the path lies outside the base path.
    pub fn media_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        let path = path.trim_start_matches('/');
        if self.base_media_path.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.base_media_path.as_str())?;
        if rest.is_empty() {
            Some(rest)
        } else {
            rest.strip_prefix('/')
        }
    }
}
