//! Name-to-element resolution
//!
//! An [`ElementMapper`] resolves media names (`"<element>/<sub/path>"`) to
//! the [`Element`] serving them and maps protocol paths to media through
//! exports. Mappers chain: names the local table doesn't know are handed
//! to a fallback mapper, first hit wins.

mod store;

pub use store::{ExportSpec, StandardMapper};

use std::sync::Arc;

use crate::auth::Authorizer;
use crate::callback::ProcessingCallback;
use crate::element::{DescribeCallback, Element, Policy};
use crate::request::{Capabilities, Request};

/// Element part of a media name
pub fn element_name_of(media: &str) -> &str {
    let media = media.trim_start_matches('/');
    media.split_once('/').map_or(media, |(element, _)| element)
}

/// Resolves media names to elements
///
/// The provided methods route through [`ElementMapper::find_element`], so
/// a mapper only has to implement lookup to get attach and detach.
pub trait ElementMapper: Send + Sync {
    /// Element registered under `name`
    fn find_element(&self, name: &str) -> Option<Arc<dyn Element>>;

    /// Element a request attached to `name` should detach through
    ///
    /// Also finds elements that are closing and no longer take new requests.
    fn find_attached_element(&self, name: &str) -> Option<Arc<dyn Element>> {
        self.find_element(name)
    }

    /// Policy registered under `name`
    fn find_policy(&self, _name: &str) -> Option<Arc<dyn Policy>> {
        None
    }

    /// Whether an element called `name` exists
    fn has_element(&self, name: &str) -> bool {
        self.find_element(name).is_some()
    }

    /// Capabilities of `media`, if some element serves it
    fn has_media(&self, media: &str) -> Option<Capabilities> {
        self.find_element(element_name_of(media))?.has_media(media)
    }

    /// Media available under `dir`
    fn list_media(&self, dir: &str) -> Vec<(String, Capabilities)>;

    /// Middle parts of element names starting with `prefix` and ending with `suffix`
    fn find_element_matches(&self, prefix: &str, suffix: &str) -> Vec<String>;

    /// Attach `req` to the element serving `media`
    fn add_request(&self, media: &str, req: &mut Request, callback: ProcessingCallback) -> bool {
        let Some(element) = self.find_element(element_name_of(media)) else {
            tracing::warn!(media = %media, "No element for media");
            return false;
        };
        element.add_request(media, req, callback)
    }

    /// Detach `req` from every element it is attached to
    ///
    /// Attachments to elements that no longer exist are dropped from the
    /// request with a warning.
    fn remove_request(&self, req: &mut Request) {
        for name in req.attached_elements() {
            match self.find_attached_element(&name) {
                Some(element) => element.remove_request(req),
                None => {
                    tracing::warn!(element = %name, request = %req.id(), "Detaching from vanished element");
                    req.unregister_callback(&name);
                    req.clear_controller_of(&name);
                }
            }
            if req.is_attached_to(&name) {
                tracing::error!(element = %name, request = %req.id(), "Element left request attached");
                req.unregister_callback(&name);
            }
        }
    }

    /// Describe `media`; false if no element serves it
    fn describe_media(&self, media: &str, on_info: DescribeCallback) -> bool {
        match self.find_element(element_name_of(media)) {
            Some(element) => element.describe_media(media, on_info),
            None => false,
        }
    }

    /// Resolve a protocol path into `req.serving_info`
    fn get_media_details(&self, protocol: &str, path: &str, req: &mut Request) -> bool;

    /// Authorizer registered under `name`
    fn get_authorizer(&self, name: &str) -> Option<Arc<dyn Authorizer>>;

    /// Count a client on an export; returns the new count
    fn add_export_client(&self, protocol: &str, export_path: &str) -> u32;

    /// Uncount a client on an export
    fn remove_export_client(&self, protocol: &str, export_path: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_name_of() {
        assert_eq!(element_name_of("alice/event1/live"), "alice");
        assert_eq!(element_name_of("/alice/event1"), "alice");
        assert_eq!(element_name_of("alice"), "alice");
        assert_eq!(element_name_of(""), "");
    }
}
