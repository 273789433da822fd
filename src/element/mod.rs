//! Producers and the contracts around them
//!
//! An [`Element`] is a named producer. A consumer attaches to it with
//! [`Element::add_request`], handing over a permanent [`ProcessingCallback`];
//! the element then calls it with tags (timestamps non-decreasing except
//! right after a seek or bootstrap boundary) and ends with exactly one EOS.
//! Every successful `add_request` is paired with exactly one
//! `remove_request`.
//!
//! Elements never call a callback from inside `add_request`: the first
//! delivery is always posted to the media selector.

mod bootstrap;
mod controller;
mod distributor;
pub mod library;
mod policy;

pub use bootstrap::Bootstrapper;
pub use controller::{ElementController, NestedPauseController, NoController, PauseGate};
pub use distributor::TagDistributor;
pub use policy::{Policy, PolicyDrivenElement};

use crate::callback::{Closure, ProcessingCallback};
use crate::request::{Capabilities, Request};
use crate::tag::MediaInfo;

/// One-shot reply to [`Element::describe_media`]
pub type DescribeCallback = Box<dyn FnOnce(Option<MediaInfo>) + Send + 'static>;

/// A named media producer
pub trait Element: Send + Sync {
    /// Element type (`"live"`, `"clip"`, ...)
    fn kind(&self) -> &str;

    /// Unique name inside its mapper
    fn name(&self) -> &str;

    /// Instance id
    fn id(&self) -> String {
        format!("{}:{}", self.kind(), self.name())
    }

    /// Attach `req` to `media`
    ///
    /// On success the request's capabilities are narrowed to what the
    /// element produces, the callback is registered on the request and,
    /// if the element exposes a controller, it becomes the request's
    /// controller. On failure nothing about `req` changes and `callback`
    /// is never invoked.
    fn add_request(&self, media: &str, req: &mut Request, callback: ProcessingCallback) -> bool;

    /// Detach `req`; no further calls on its callback follow
    fn remove_request(&self, req: &mut Request);

    /// Capabilities of `media`, if this element serves it
    fn has_media(&self, media: &str) -> Option<Capabilities>;

    /// Media available under `dir`
    fn list_media(&self, dir: &str) -> Vec<(String, Capabilities)>;

    /// Describe `media`; the answer arrives asynchronously
    ///
    /// Returns false if the media is unknown (the callback is dropped).
    fn describe_media(&self, media: &str, on_info: DescribeCallback) -> bool;

    /// Close the element
    ///
    /// Delivers EOS to every attached request, then runs `on_close` once
    /// all of them have been removed.
    fn close(&self, on_close: Closure);
}

/// Whether `media` names `element` or something underneath it
pub(crate) fn media_belongs_to(element: &str, media: &str) -> bool {
    media == element
        || media
            .strip_prefix(element)
            .map_or(false, |rest| rest.starts_with('/'))
}
