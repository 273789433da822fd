//! Strategies that choose what a switching element serves

use crate::request::{Capabilities, RequestInfo};
use crate::tag::Tag;

use super::Element;

/// An element whose current media is chosen by a [`Policy`]
pub trait PolicyDrivenElement: Element {
    /// Switch to `media`
    ///
    /// Without `force`, switching to the media already playing is a no-op.
    /// Returns false if the media could not be attached.
    fn switch_current_media(&self, media: &str, info: Option<&RequestInfo>, force: bool) -> bool;

    /// Media currently served
    fn current_media(&self) -> String;

    /// Capabilities of `media` as seen by this element's mapper
    fn has_upstream_media(&self, media: &str) -> Option<Capabilities>;
}

/// Decides which media a [`PolicyDrivenElement`] serves
pub trait Policy: Send + Sync {
    /// Policy type
    fn kind(&self) -> &str;

    /// Policy name
    fn name(&self) -> &str;

    /// Pick the first media
    fn initialize(&self, element: &dyn PolicyDrivenElement) -> bool;

    /// Forget any progress
    fn reset(&self);

    /// The current media ended
    ///
    /// Return true after switching the element to new media, false to let
    /// the element end with EOS.
    fn notify_eos(&self, element: &dyn PolicyDrivenElement) -> bool;

    /// Inspect a tag before it reaches listeners; false drops it
    fn notify_tag(&self, _tag: &Tag, _timestamp_ms: i64) -> bool {
        true
    }
}
