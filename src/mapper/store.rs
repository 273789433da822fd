//! Standard mapper: owning registry of elements, policies, exports and
//! authorizers

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{element_name_of, ElementMapper};
use crate::auth::Authorizer;
use crate::callback::Closure;
use crate::element::{Element, Policy};
use crate::error::{Error, Result};
use crate::request::{Capabilities, Request, RequestServingInfo};
use crate::tag::MediaFormat;

/// Maps a protocol path prefix onto a media name
#[derive(Debug, Clone, Default)]
pub struct ExportSpec {
    /// Protocol the export applies to (`"http"`, `"rtmp"`)
    pub protocol: String,
    /// Path prefix, without leading or trailing slashes
    pub path: String,
    /// Media the prefix maps to
    pub media_name: String,
    /// Authorizer to consult, empty for none
    pub authorizer_name: String,
    /// Client cap, `None` for unlimited
    pub max_clients: Option<u32>,
    /// Flavours served through this export
    pub flavour_mask: Option<u32>,
    /// Forced HTTP content type
    pub content_type: Option<String>,
    /// Extra reply headers
    pub extra_headers: Vec<(String, String)>,
    /// Drop droppable media above this much queued (0 disables)
    pub flow_control_total_ms: i64,
    /// Drop droppable video above this much queued (0 disables)
    pub flow_control_video_ms: i64,
}

impl ExportSpec {
    /// Export `path` on `protocol` as `media_name`
    pub fn new(protocol: impl Into<String>, path: impl Into<String>, media_name: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            path: normalize(&path.into()).to_string(),
            media_name: media_name.into(),
            ..Default::default()
        }
    }

    /// Consult authorizer `name`
    pub fn authorizer(mut self, name: impl Into<String>) -> Self {
        self.authorizer_name = name.into();
        self
    }

    /// Cap concurrent clients
    pub fn max_clients(mut self, max: u32) -> Self {
        self.max_clients = Some(max);
        self
    }

    /// Serve only `mask` flavours
    pub fn flavour_mask(mut self, mask: u32) -> Self {
        self.flavour_mask = Some(mask);
        self
    }

    /// Force an HTTP content type
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add a reply header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Set drop thresholds
    pub fn flow_control(mut self, total_ms: i64, video_ms: i64) -> Self {
        self.flow_control_total_ms = total_ms;
        self.flow_control_video_ms = video_ms;
        self
    }

    fn matches(&self, protocol: &str, path: &str) -> bool {
        self.protocol == protocol
            && (self.path.is_empty()
                || path == self.path
                || path
                    .strip_prefix(self.path.as_str())
                    .is_some_and(|rest| rest.starts_with('/')))
    }

    fn serving_info(&self, media_name: String) -> RequestServingInfo {
        RequestServingInfo {
            export_path: self.path.clone(),
            media_name,
            format: self
                .content_type
                .as_deref()
                .and_then(MediaFormat::from_content_type),
            content_type: self.content_type.clone(),
            extra_headers: self.extra_headers.clone(),
            authorizer_name: self.authorizer_name.clone(),
            max_clients: self.max_clients,
            flavour_mask: self.flavour_mask,
            flow_control_total_ms: self.flow_control_total_ms,
            flow_control_video_ms: self.flow_control_video_ms,
            offset: None,
            size: None,
        }
    }
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

/// Registry owning every element by name
///
/// Lookups clone the `Arc` out of the table; no lock is held while an
/// element, policy or fallback mapper is called.
#[derive(Default)]
pub struct StandardMapper {
    elements: RwLock<HashMap<String, Arc<dyn Element>>>,
    policies: RwLock<HashMap<String, Arc<dyn Policy>>>,
    exports: RwLock<Vec<ExportSpec>>,
    authorizers: RwLock<HashMap<String, Arc<dyn Authorizer>>>,
    /// Unregistered elements still detaching their requests
    closing: Arc<Mutex<HashMap<String, Arc<dyn Element>>>>,
    export_clients: Mutex<HashMap<(String, String), u32>>,
    fallback: RwLock<Option<Arc<dyn ElementMapper>>>,
}

impl StandardMapper {
    /// Create an empty mapper
    pub fn new() -> Self {
        Self::default()
    }

    /// Delegate unresolved names to `fallback`
    pub fn set_fallback(&self, fallback: Arc<dyn ElementMapper>) {
        *self.fallback.write() = Some(fallback);
    }

    fn fallback(&self) -> Option<Arc<dyn ElementMapper>> {
        self.fallback.read().clone()
    }

    /// Register an element under its name
    pub fn add_element(&self, element: Arc<dyn Element>) -> Result<()> {
        let mut elements = self.elements.write();
        let name = element.name().to_string();
        if elements.contains_key(&name) {
            return Err(Error::Duplicate(name));
        }
        tracing::info!(element = %name, kind = %element.kind(), "Element registered");
        elements.insert(name, element);
        Ok(())
    }

    /// Unregister an element without closing it
    pub fn remove_element(&self, name: &str) -> Option<Arc<dyn Element>> {
        let removed = self.elements.write().remove(name);
        if removed.is_some() {
            tracing::info!(element = %name, "Element unregistered");
        }
        removed
    }

    /// Unregister and close an element; `on_close` runs once it is done
    ///
    /// Until then the element can no longer be found for new media, but
    /// requests attached to it are still detached through the mapper.
    pub fn close_element(&self, name: &str, on_close: Closure) -> bool {
        let Some(element) = self.remove_element(name) else {
            return false;
        };
        self.closing
            .lock()
            .insert(name.to_string(), Arc::clone(&element));
        let closing = Arc::clone(&self.closing);
        let name = name.to_string();
        element.close(Box::new(move || {
            closing.lock().remove(&name);
            tracing::info!(element = %name, "Element closed");
            on_close();
        }));
        true
    }

    /// Names of the local elements, sorted
    pub fn element_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.elements.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a policy under its name
    pub fn add_policy(&self, policy: Arc<dyn Policy>) -> Result<()> {
        let mut policies = self.policies.write();
        let name = policy.name().to_string();
        if policies.contains_key(&name) {
            return Err(Error::Duplicate(name));
        }
        policies.insert(name, policy);
        Ok(())
    }

    /// Register an export
    pub fn add_export(&self, spec: ExportSpec) -> Result<()> {
        let mut exports = self.exports.write();
        if exports
            .iter()
            .any(|e| e.protocol == spec.protocol && e.path == spec.path)
        {
            return Err(Error::Duplicate(format!("{}:/{}", spec.protocol, spec.path)));
        }
        tracing::info!(
            protocol = %spec.protocol,
            path = %spec.path,
            media = %spec.media_name,
            "Export registered"
        );
        exports.push(spec);
        Ok(())
    }

    /// Remove an export; returns whether it existed
    pub fn remove_export(&self, protocol: &str, path: &str) -> bool {
        let path = normalize(path);
        let mut exports = self.exports.write();
        let before = exports.len();
        exports.retain(|e| !(e.protocol == protocol && e.path == path));
        exports.len() != before
    }

    /// Register an authorizer under its name
    pub fn add_authorizer(&self, authorizer: Arc<dyn Authorizer>) -> Result<()> {
        let mut authorizers = self.authorizers.write();
        let name = authorizer.name().to_string();
        if authorizers.contains_key(&name) {
            return Err(Error::Duplicate(name));
        }
        authorizers.insert(name, authorizer);
        Ok(())
    }

    /// Clients currently counted on an export
    pub fn export_client_count(&self, protocol: &str, export_path: &str) -> u32 {
        self.export_clients
            .lock()
            .get(&(protocol.to_string(), normalize(export_path).to_string()))
            .copied()
            .unwrap_or(0)
    }
}

impl ElementMapper for StandardMapper {
    fn find_element(&self, name: &str) -> Option<Arc<dyn Element>> {
        let local = self.elements.read().get(name).cloned();
        local.or_else(|| self.fallback()?.find_element(name))
    }

    fn find_attached_element(&self, name: &str) -> Option<Arc<dyn Element>> {
        if let Some(element) = self.elements.read().get(name).cloned() {
            return Some(element);
        }
        if let Some(element) = self.closing.lock().get(name).cloned() {
            return Some(element);
        }
        self.fallback()?.find_attached_element(name)
    }

    fn find_policy(&self, name: &str) -> Option<Arc<dyn Policy>> {
        let local = self.policies.read().get(name).cloned();
        local.or_else(|| self.fallback()?.find_policy(name))
    }

    fn list_media(&self, dir: &str) -> Vec<(String, Capabilities)> {
        let elements: Vec<Arc<dyn Element>> = self.elements.read().values().cloned().collect();
        let mut media: Vec<(String, Capabilities)> =
            elements.iter().flat_map(|e| e.list_media(dir)).collect();
        if let Some(fallback) = self.fallback() {
            for (name, caps) in fallback.list_media(dir) {
                if !media.iter().any(|(n, _)| *n == name) {
                    media.push((name, caps));
                }
            }
        }
        media.sort_by(|a, b| a.0.cmp(&b.0));
        media
    }

    fn find_element_matches(&self, prefix: &str, suffix: &str) -> Vec<String> {
        let mut matches: Vec<String> = self
            .elements
            .read()
            .keys()
            .filter(|name| name.len() >= prefix.len() + suffix.len())
            .filter_map(|name| name.strip_prefix(prefix)?.strip_suffix(suffix))
            .map(str::to_string)
            .collect();
        if let Some(fallback) = self.fallback() {
            for middle in fallback.find_element_matches(prefix, suffix) {
                if !matches.contains(&middle) {
                    matches.push(middle);
                }
            }
        }
        matches.sort();
        matches
    }

    fn get_media_details(&self, protocol: &str, path: &str, req: &mut Request) -> bool {
        let path = normalize(path);
        let export = self
            .exports
            .read()
            .iter()
            .filter(|e| e.matches(protocol, path))
            .max_by_key(|e| e.path.len())
            .cloned();

        if let Some(export) = export {
            let rest = normalize(&path[export.path.len()..]);
            let media_name = match (export.media_name.is_empty(), rest.is_empty()) {
                (_, true) => export.media_name.clone(),
                (true, false) => rest.to_string(),
                (false, false) => format!("{}/{}", export.media_name, rest),
            };
            tracing::debug!(
                protocol = %protocol,
                path = %path,
                export = %export.path,
                media = %media_name,
                "Resolved through export"
            );
            *req.serving_info_mut() = export.serving_info(media_name);
            return true;
        }

        if !path.is_empty() && self.elements.read().contains_key(element_name_of(path)) {
            *req.serving_info_mut() = RequestServingInfo {
                export_path: path.to_string(),
                media_name: path.to_string(),
                ..Default::default()
            };
            return true;
        }

        match self.fallback() {
            Some(fallback) => fallback.get_media_details(protocol, path, req),
            None => false,
        }
    }

    fn get_authorizer(&self, name: &str) -> Option<Arc<dyn Authorizer>> {
        let local = self.authorizers.read().get(name).cloned();
        local.or_else(|| self.fallback()?.get_authorizer(name))
    }

    fn add_export_client(&self, protocol: &str, export_path: &str) -> u32 {
        let mut clients = self.export_clients.lock();
        let count = clients
            .entry((protocol.to_string(), normalize(export_path).to_string()))
            .or_insert(0);
        *count += 1;
        *count
    }

    fn remove_export_client(&self, protocol: &str, export_path: &str) {
        let key = (protocol.to_string(), normalize(export_path).to_string());
        let mut clients = self.export_clients.lock();
        match clients.get_mut(&key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                clients.remove(&key);
            }
            None => {
                tracing::warn!(protocol = %protocol, export = %export_path, "Unbalanced export client removal");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthorizer;
    use crate::callback::ProcessingCallback;
    use crate::element::library::LiveElement;
    use crate::request::RequestInfo;
    use crate::selector::Selector;
    use crate::tag::DEFAULT_FLAVOUR_MASK;

    fn live(name: &str, selector: &Arc<Selector>) -> Arc<LiveElement> {
        LiveElement::new(
            name,
            Arc::clone(selector),
            Capabilities::new(Some(MediaFormat::Flv), DEFAULT_FLAVOUR_MASK),
            None,
        )
    }

    #[test]
    fn test_register_elements() {
        let selector = Selector::spawn("media").unwrap();
        let mapper = StandardMapper::new();
        mapper.add_element(live("alice", &selector)).unwrap();
        mapper.add_element(live("bob", &selector)).unwrap();
        assert!(matches!(
            mapper.add_element(live("alice", &selector)),
            Err(Error::Duplicate(_))
        ));

        assert!(mapper.has_element("alice"));
        assert!(mapper.has_media("alice/event1/live").is_some());
        assert!(mapper.has_media("carol/x").is_none());
        assert_eq!(mapper.element_names(), vec!["alice", "bob"]);
        assert_eq!(mapper.list_media("").len(), 2);

        assert!(mapper.remove_element("bob").is_some());
        assert!(!mapper.has_element("bob"));
        selector.stop_and_join();
    }

    #[test]
    fn test_element_matches() {
        let selector = Selector::spawn("media").unwrap();
        let mapper = StandardMapper::new();
        for name in ["cam_1_hd", "cam_2_hd", "cam_3_sd", "mic_1_hd"] {
            mapper.add_element(live(name, &selector)).unwrap();
        }
        assert_eq!(mapper.find_element_matches("cam_", "_hd"), vec!["1", "2"]);
        assert_eq!(mapper.find_element_matches("", "_sd"), vec!["cam_3"]);
        selector.stop_and_join();
    }

    #[test]
    fn test_export_longest_prefix() {
        let selector = Selector::spawn("media").unwrap();
        let mapper = StandardMapper::new();
        mapper.add_element(live("alice", &selector)).unwrap();
        mapper
            .add_export(ExportSpec::new("http", "/live", "alice").max_clients(10))
            .unwrap();
        mapper
            .add_export(
                ExportSpec::new("http", "live/vip", "alice/vip")
                    .authorizer("static")
                    .content_type("video/x-flv"),
            )
            .unwrap();
        assert!(mapper.add_export(ExportSpec::new("http", "live", "x")).is_err());

        let mut req = Request::new(RequestInfo::default());
        assert!(mapper.get_media_details("http", "/live/event1/live", &mut req));
        assert_eq!(req.serving_info().media_name, "alice/event1/live");
        assert_eq!(req.serving_info().export_path, "live");
        assert_eq!(req.serving_info().max_clients, Some(10));

        assert!(mapper.get_media_details("http", "live/vip/stage", &mut req));
        assert_eq!(req.serving_info().media_name, "alice/vip/stage");
        assert_eq!(req.serving_info().authorizer_name, "static");
        assert_eq!(req.serving_info().format, Some(MediaFormat::Flv));

        // prefix must end at a path component
        assert!(!mapper.get_media_details("http", "livestream", &mut req));
        assert!(!mapper.get_media_details("rtmp", "live/event1", &mut req));

        // a bare element name resolves without an export
        assert!(mapper.get_media_details("rtmp", "alice/event1", &mut req));
        assert_eq!(req.serving_info().media_name, "alice/event1");
        assert!(req.serving_info().authorizer_name.is_empty());
        selector.stop_and_join();
    }

    #[test]
    fn test_fallback_chain() {
        let selector = Selector::spawn("media").unwrap();
        let upstream = Arc::new(StandardMapper::new());
        upstream.add_element(live("remote", &selector)).unwrap();
        upstream
            .add_authorizer(Arc::new(StaticAuthorizer::new("shared")))
            .unwrap();

        let mapper = StandardMapper::new();
        mapper.add_element(live("local", &selector)).unwrap();
        mapper.set_fallback(upstream);

        assert!(mapper.find_element("local").is_some());
        assert!(mapper.find_element("remote").is_some());
        assert!(mapper.find_element("nowhere").is_none());
        assert!(mapper.get_authorizer("shared").is_some());

        let mut req = Request::new(RequestInfo::default());
        assert!(mapper.get_media_details("http", "remote/feed", &mut req));
        assert_eq!(req.serving_info().media_name, "remote/feed");
        assert_eq!(mapper.list_media("").len(), 2);
        selector.stop_and_join();
    }

    #[test]
    fn test_export_client_counting() {
        let mapper = StandardMapper::new();
        assert_eq!(mapper.add_export_client("http", "live"), 1);
        assert_eq!(mapper.add_export_client("http", "/live/"), 2);
        assert_eq!(mapper.add_export_client("rtmp", "live"), 1);
        mapper.remove_export_client("http", "live");
        assert_eq!(mapper.export_client_count("http", "live"), 1);
        mapper.remove_export_client("http", "live");
        mapper.remove_export_client("http", "live");
        assert_eq!(mapper.export_client_count("http", "live"), 0);
    }

    #[test]
    fn test_attach_detach_balance() {
        let selector = Selector::spawn("media").unwrap();
        let mapper = StandardMapper::new();
        let element = live("alice", &selector);
        mapper.add_element(element.clone()).unwrap();

        let mut reqs: Vec<Request> = (0..5).map(|_| Request::new(RequestInfo::default())).collect();
        for req in reqs.iter_mut() {
            assert!(mapper.add_request("alice/event1", req, ProcessingCallback::new(|_, _| {})));
            assert_eq!(req.callback_count(), 1);
        }
        assert!(!mapper.add_request("carol", &mut reqs[0], ProcessingCallback::new(|_, _| {})));
        assert_eq!(element.subscriber_count(), 5);

        for req in reqs.iter_mut() {
            mapper.remove_request(req);
            assert_eq!(req.callback_count(), 0);
        }
        assert_eq!(element.subscriber_count(), 0);
        selector.stop_and_join();
    }

    #[test]
    fn test_detach_from_vanished_element() {
        let selector = Selector::spawn("media").unwrap();
        let mapper = StandardMapper::new();
        mapper.add_element(live("alice", &selector)).unwrap();

        let mut req = Request::new(RequestInfo::default());
        assert!(mapper.add_request("alice", &mut req, ProcessingCallback::new(|_, _| {})));
        let element = mapper.remove_element("alice").unwrap();
        mapper.remove_request(&mut req);
        assert_eq!(req.callback_count(), 0);
        element.remove_request(&mut req);
        selector.stop_and_join();
    }

    #[test]
    fn test_close_element_detaches_through_mapper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let selector = Selector::spawn("media").unwrap();
        let mapper = StandardMapper::new();
        let element = live("alice", &selector);
        mapper.add_element(element.clone()).unwrap();

        let mut req = Request::new(RequestInfo::default());
        assert!(mapper.add_request("alice", &mut req, ProcessingCallback::new(|_, _| {})));

        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        assert!(mapper.close_element("alice", Box::new(move || flag.store(true, Ordering::SeqCst))));
        assert!(!mapper.close_element("alice", Box::new(|| {})));
        assert!(!mapper.has_element("alice"));

        let mut late = Request::new(RequestInfo::default());
        assert!(!mapper.add_request("alice", &mut late, ProcessingCallback::new(|_, _| {})));

        selector.run_and_wait(|| ()).unwrap();
        assert!(!closed.load(Ordering::SeqCst));

        mapper.remove_request(&mut req);
        assert_eq!(element.subscriber_count(), 0);
        selector.run_and_wait(|| ()).unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(mapper.find_attached_element("alice").is_none());
        selector.stop_and_join();
    }
}
