//! Progressive HTTP streaming
//!
//! One GET, one response. Failures before streaming map to a status-only
//! reply; once the body has started, the only way out is ending it.

use bytes::{Bytes, BytesMut};

use super::serializer::{create_serializer, TagSerializer};
use super::OutboundBuffer;
use crate::callback::Closure;
use crate::error::ControlOp;
use crate::request::Request;
use crate::session::ExportProtocol;
use crate::tag::{MediaFormat, Tag};

/// Reply statuses used by the streaming path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    /// 200
    Ok,
    /// 204
    NoContent,
    /// 401
    Unauthorized,
    /// 404
    NotFound,
    /// 406
    NotAcceptable,
    /// 500
    InternalServerError,
}

impl HttpStatus {
    /// Numeric code
    pub fn code(self) -> u16 {
        match self {
            HttpStatus::Ok => 200,
            HttpStatus::NoContent => 204,
            HttpStatus::Unauthorized => 401,
            HttpStatus::NotFound => 404,
            HttpStatus::NotAcceptable => 406,
            HttpStatus::InternalServerError => 500,
        }
    }

    /// Reason phrase
    pub fn reason(self) -> &'static str {
        match self {
            HttpStatus::Ok => "OK",
            HttpStatus::NoContent => "No Content",
            HttpStatus::Unauthorized => "Unauthorized",
            HttpStatus::NotFound => "Not Found",
            HttpStatus::NotAcceptable => "Not Acceptable",
            HttpStatus::InternalServerError => "Internal Server Error",
        }
    }
}

impl std::fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Server side of one HTTP exchange
///
/// Writes account their size in [`HttpConnection::outbound`]; the
/// implementation drains it as the socket accepts data.
pub trait HttpConnection: Send + 'static {
    /// Request URL path
    fn path(&self) -> &str;

    /// `Accept` header of the request
    fn accept(&self) -> Option<&str>;

    /// Outbound byte accounting
    fn outbound(&self) -> &OutboundBuffer;

    /// Complete the exchange with a body-less reply
    fn reply_with_status(&mut self, status: HttpStatus);

    /// Send the reply header and start a streamed body
    fn begin_streaming(&mut self, status: HttpStatus, headers: &[(String, String)]);

    /// Append body bytes
    fn write(&mut self, data: Bytes);

    /// Finish the streamed body
    fn end_streaming(&mut self);

    /// The client went away
    fn is_closed(&self) -> bool;

    /// The exporter is done with the connection
    fn release(&mut self) {}
}

/// [`ExportProtocol`] over an HTTP exchange
pub struct HttpStreamRequest<C: HttpConnection> {
    conn: C,
    serializer: Option<Box<dyn TagSerializer>>,
    headers: Vec<(String, String)>,
    streaming: bool,
    closed: bool,
}

impl<C: HttpConnection> HttpStreamRequest<C> {
    /// Wrap a connection
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            serializer: None,
            headers: Vec::new(),
            streaming: false,
            closed: false,
        }
    }

    /// The connection
    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Whether the response body has started
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Content type chosen for the body
    ///
    /// `Accept` wins unless it is a wildcard, then the export's content
    /// type, then the URL extension.
    fn content_type(&self, req: &Request) -> Option<String> {
        if let Some(accept) = self.conn.accept().filter(|a| !a.contains('*')) {
            return Some(accept.to_string());
        }
        if let Some(ct) = req.serving_info().content_type.as_ref() {
            return Some(ct.clone());
        }
        let path = self.conn.path();
        let name = path.rsplit('/').next().unwrap_or(path);
        name.rsplit_once('.')
            .and_then(|(_, ext)| MediaFormat::from_extension(ext))
            .map(|f| f.content_type().to_string())
    }

    fn close(&mut self, status: HttpStatus) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.conn.is_closed() {
            return;
        }
        if self.streaming {
            tracing::debug!(path = %self.conn.path(), "Ending streamed reply");
            self.conn.end_streaming();
        } else {
            tracing::debug!(path = %self.conn.path(), status = %status, "Replying");
            self.conn.reply_with_status(status);
        }
        self.conn.outbound().close();
    }
}

impl<C: HttpConnection> ExportProtocol for HttpStreamRequest<C> {
    fn protocol_name(&self) -> &str {
        "http"
    }

    fn is_closed(&self) -> bool {
        self.closed || self.conn.is_closed()
    }

    fn on_stream_not_found(&mut self) {
        self.close(HttpStatus::NotFound);
    }

    fn on_too_many_clients(&mut self) {
        self.close(HttpStatus::NotAcceptable);
    }

    fn on_authorization_failed(&mut self) {
        self.close(HttpStatus::Unauthorized);
    }

    fn on_reauthorization_failed(&mut self) {
        self.close(HttpStatus::Unauthorized);
    }

    fn on_add_request_failed(&mut self) {
        self.close(HttpStatus::NotFound);
    }

    fn on_play(&mut self, req: &Request) {
        let Some(content_type) = self.content_type(req) else {
            tracing::error!(path = %self.conn.path(), "Cannot establish content type");
            self.close(HttpStatus::NotAcceptable);
            return;
        };
        let Some(serializer) = MediaFormat::from_content_type(&content_type).and_then(create_serializer)
        else {
            tracing::error!(content_type = %content_type, "No serializer for content type");
            self.close(HttpStatus::NotAcceptable);
            return;
        };
        self.serializer = Some(serializer);
        self.headers = std::iter::once(("Content-Type".to_string(), content_type))
            .chain(req.serving_info().extra_headers.iter().cloned())
            .collect();
    }

    fn on_control_failed(&mut self, op: ControlOp) {
        tracing::debug!(op = %op, "No control channel over HTTP");
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
        if tag.is_eos() {
            self.close(HttpStatus::NoContent);
            return;
        }
        let Some(serializer) = self.serializer.as_mut() else {
            return;
        };

        let mut out = BytesMut::new();
        if !self.streaming {
            // the body starts with the first payload
            if !tag.is_media() {
                return;
            }
            self.streaming = true;
            self.conn.begin_streaming(HttpStatus::Ok, &self.headers);
            serializer.initialize(&mut out);
        }
        if !serializer.serialize(tag, timestamp_ms, &mut out) {
            tracing::error!(tag = %tag, "Failed to serialize tag, closing");
            self.close(HttpStatus::InternalServerError);
            return;
        }
        if !out.is_empty() {
            self.conn.write(out.freeze());
        }
    }

    fn on_transport_closed(&mut self) {
        self.closed = true;
        self.conn.outbound().close();
    }

    fn on_released(&mut self) {
        self.conn.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::memory::{HttpEvent, MemoryHttpConnection};
    use crate::request::{RequestInfo, RequestServingInfo};
    use crate::selector::Selector;
    use std::sync::Arc;

    fn request(content_type: Option<&str>) -> Request {
        let mut req = Request::new(RequestInfo::default());
        *req.serving_info_mut() = RequestServingInfo {
            content_type: content_type.map(str::to_string),
            extra_headers: vec![("Cache-Control".to_string(), "no-cache".to_string())],
            ..Default::default()
        };
        req
    }

    #[test]
    fn test_status_before_streaming() {
        let selector = Selector::spawn("net").unwrap();
        let (conn, events) = MemoryHttpConnection::new(Arc::clone(&selector), "/media/a.flv", 1000);
        let mut http = HttpStreamRequest::new(conn);

        http.on_authorization_failed();
        assert!(http.is_closed());
        http.on_stream_not_found();
        assert_eq!(events.statuses(), vec![401]);
        selector.stop_and_join();
    }

    #[test]
    fn test_streams_then_ends() {
        let selector = Selector::spawn("net").unwrap();
        let (conn, events) = MemoryHttpConnection::new(Arc::clone(&selector), "/media/a", 100_000);
        let mut http = HttpStreamRequest::new(conn);

        http.on_play(&request(Some("video/x-flv")));
        assert!(http.can_send_tag());
        http.send_tag(&Tag::video(MediaFormat::Flv, 0, Bytes::from_static(&[0x17]), true), 0);
        http.send_tag(&Tag::eos(1, 40, false), 40);
        assert!(http.is_closed());

        let events = events.events();
        match &events[0] {
            HttpEvent::Begin { status, headers } => {
                assert_eq!(*status, 200);
                assert_eq!(headers[0], ("Content-Type".to_string(), "video/x-flv".to_string()));
                assert_eq!(headers[1].0, "Cache-Control");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&events[1], HttpEvent::Data(d) if &d[..3] == b"FLV"));
        assert_eq!(events.last(), Some(&HttpEvent::End));
        selector.stop_and_join();
    }

    #[test]
    fn test_eos_before_streaming_is_no_content() {
        let selector = Selector::spawn("net").unwrap();
        let (conn, events) = MemoryHttpConnection::new(Arc::clone(&selector), "/media/a.mp3", 1000);
        let mut http = HttpStreamRequest::new(conn);

        http.on_play(&request(None));
        http.send_tag(&Tag::eos(1, 0, false), 0);
        assert_eq!(events.statuses(), vec![204]);
        selector.stop_and_join();
    }

    #[test]
    fn test_unknown_content_type() {
        let selector = Selector::spawn("net").unwrap();
        let (conn, events) = MemoryHttpConnection::new(Arc::clone(&selector), "/media/a", 1000);
        let mut http = HttpStreamRequest::new(conn);

        http.on_play(&request(None));
        assert!(http.is_closed());
        assert_eq!(events.statuses(), vec![406]);
        selector.stop_and_join();
    }
}
