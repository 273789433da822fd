//! Export sessions: the bridge between a request and a wire connection
//!
//! An [`Exporter`] runs one consumer session through
//! `start → authorize → attach → stream → close` on behalf of a protocol
//! adapter. The adapter implements [`ExportProtocol`]; the exporter calls
//! its hooks and never touches the wire itself.
//!
//! Two selectors are involved. Request and element state lives on the
//! media selector; tags cross to the net selector through one ordered
//! queue per exporter, where they are written as the protocol accepts
//! them. The exporter is reference counted across both: its release runs
//! exactly once, on the net selector, after the last holder lets go.

mod context;
mod exporter;
mod queue;
mod state;

pub use context::ExportContext;
pub use exporter::{ExportHandle, Exporter, RefGuard};
pub use queue::TagQueue;
pub use state::SessionState;

use crate::callback::Closure;
use crate::error::ControlOp;
use crate::request::Request;
use crate::tag::Tag;

/// Hooks a wire protocol implements for an [`Exporter`]
///
/// Hooks run with the protocol locked and must not call back into the
/// exporter synchronously. Every terminal hook (`on_stream_not_found`,
/// `on_too_many_clients`, `on_authorization_failed`,
/// `on_reauthorization_failed`, `on_add_request_failed`) is called at most
/// once per session and is never followed by `send_tag`.
pub trait ExportProtocol: Send + 'static {
    /// Protocol name used for export lookup (`"http"`, `"rtmp"`)
    fn protocol_name(&self) -> &str;

    /// The wire side is gone or finished
    fn is_closed(&self) -> bool;

    /// Media could not be resolved
    fn on_stream_not_found(&mut self);

    /// The export is full
    fn on_too_many_clients(&mut self);

    /// The authorizer denied or did not answer
    fn on_authorization_failed(&mut self);

    /// A later reauthorization denied, or the time limit passed
    fn on_reauthorization_failed(&mut self);

    /// The element refused the attachment
    fn on_add_request_failed(&mut self);

    /// Attached; runs before any tag is sent
    fn on_play(&mut self, req: &Request);

    /// A pause or seek could not be performed
    fn on_control_failed(&mut self, op: ControlOp);

    /// A pause or resume went through
    fn on_paused(&mut self, _paused: bool) {}

    /// A seek went through
    fn on_seeked(&mut self, _seek_ms: i64) {}

    /// Whether the wire can take another tag now
    fn can_send_tag(&self) -> bool;

    /// Run `ready` once the wire can take tags again
    ///
    /// `ready` may be dropped without running if the wire closes.
    fn set_notify_ready(&mut self, ready: Closure);

    /// Write one tag
    fn send_tag(&mut self, tag: &Tag, timestamp_ms: i64);

    /// The transport went away underneath the session
    fn on_transport_closed(&mut self) {}

    /// The exporter is done with the protocol
    fn on_released(&mut self) {}
}
