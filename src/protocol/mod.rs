//! Wire protocol adapters
//!
//! Each adapter implements [`ExportProtocol`](crate::session::ExportProtocol)
//! on top of a small connection trait, leaving sockets and framing to the
//! server that owns the connection:
//!
//! - [`http::HttpStreamRequest`] over [`http::HttpConnection`]
//! - [`rtmp::PlayStream`] over [`rtmp::RtmpConnection`]
//!
//! Both share [`OutboundBuffer`] for backpressure. [`memory`] has loopback
//! connections for tests and demos.

mod buffer;
pub mod http;
pub mod memory;
pub mod rtmp;
pub mod serializer;

pub use buffer::OutboundBuffer;
