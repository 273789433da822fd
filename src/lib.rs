//! Streaming session core for a broadcasting media server
//!
//! Media flows as [`Tag`]s from named producers ([`element::Element`]) to
//! consumer sessions ([`session::Exporter`]) that write them to a wire
//! protocol. The pieces:
//!
//! - [`request`]: what a consumer asks for and what it is served
//! - [`element`]: the producer contract, controllers, policies and a small
//!   library of elements
//! - [`mapper`]: resolves media names and exports to elements
//! - [`auth`]: asynchronous authorization with reauthorization and limits
//! - [`session`]: the exporter state machine and the hooks a protocol implements
//! - [`protocol`]: HTTP and RTMP adapters over abstract connections
//! - [`selector`]: the single-threaded loops everything runs on
//!
//! Two selectors take part in every session: the media selector runs
//! elements and request bookkeeping, the net selector does wire I/O and owns
//! exporter lifetimes. Tags cross between them through one ordered queue per
//! exporter.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mediacast::element::library::ClipElement;
//! use mediacast::mapper::{ExportSpec, StandardMapper};
//! use mediacast::protocol::http::HttpStreamRequest;
//! use mediacast::protocol::memory::MemoryHttpConnection;
//! use mediacast::session::{ExportContext, Exporter};
//! use mediacast::{MediaFormat, Selector};
//!
//! # fn main() -> mediacast::Result<()> {
//! let media = Selector::spawn("media")?;
//! let net = Selector::spawn("net")?;
//!
//! let mapper = Arc::new(StandardMapper::new());
//! mapper.add_element(ClipElement::new("intro", Arc::clone(&media), MediaFormat::Flv, Vec::new()))?;
//! mapper.add_export(ExportSpec::new("http", "intro.flv", "intro"))?;
//!
//! let ctx = ExportContext::new(mapper, Arc::clone(&media), Arc::clone(&net));
//! let (conn, log) = MemoryHttpConnection::new(Arc::clone(&net), "/media/intro.flv", 100_000);
//! let exporter = Exporter::new(ctx, HttpStreamRequest::new(conn));
//! exporter.start_url("http://localhost/media/intro.flv");
//! # let _ = log;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod callback;
pub mod config;
pub mod element;
pub mod error;
pub mod mapper;
pub mod protocol;
pub mod request;
pub mod selector;
pub mod session;
pub mod stats;
pub mod tag;

pub use callback::{CallbackId, Closure, ProcessingCallback};
pub use config::ExportConfig;
pub use error::{ControlOp, Error, Result};
pub use request::{Capabilities, Request, RequestInfo};
pub use selector::Selector;
pub use tag::{MediaFormat, Tag, TagKind};
