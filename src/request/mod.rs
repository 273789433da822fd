//! Consumer-side attachment state
//!
//! A [`Request`] is created when a client asks for media and lives until
//! every element it was attached to has let go of it. It records which
//! element owns which of its processing callbacks (`callbacks` and the
//! inverse `rev_callbacks`, always the same size) and which element, if
//! any, currently controls it.

mod caps;
mod info;

pub use caps::Capabilities;
pub use info::{AuthorizerRequest, RequestInfo, RequestServingInfo};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use url::Url;

use crate::callback::CallbackId;
use crate::element::ElementController;
use crate::error::{Error, Result};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Numeric value
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// One consumer attachment
pub struct Request {
    id: RequestId,
    caps: Capabilities,
    info: RequestInfo,
    serving_info: RequestServingInfo,
    /// callback -> element name
    callbacks: HashMap<CallbackId, String>,
    /// element name -> callback
    rev_callbacks: HashMap<String, CallbackId>,
    controller: Option<(String, Arc<dyn ElementController>)>,
}

impl Request {
    /// Create a request with default capabilities
    pub fn new(info: RequestInfo) -> Self {
        let mut caps = Capabilities::default();
        if let Some(mask) = info.flavour_mask.filter(|m| *m != 0) {
            caps.flavour_mask = mask;
        }
        Self {
            id: RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
            caps,
            info,
            serving_info: RequestServingInfo::default(),
            callbacks: HashMap::new(),
            rev_callbacks: HashMap::new(),
            controller: None,
        }
    }

    /// Request an element creates on its own behalf (upstream attachment)
    pub fn internal(caps: Capabilities) -> Self {
        let mut req = Self::new(RequestInfo {
            is_internal: true,
            ..Default::default()
        });
        req.caps = caps;
        req
    }

    /// Parse a request from its URL
    ///
    /// Relative URLs (`/media/a?wsp=10`) are resolved against a dummy host.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse("http://localhost/")
                .and_then(|base| base.join(url))
                .map_err(|_| Error::InvalidUrl(url.to_string()))?,
            Err(_) => return Err(Error::InvalidUrl(url.to_string())),
        };
        Ok(Self::new(RequestInfo::from_url(&parsed)))
    }

    /// Identity
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Current capabilities
    pub fn caps(&self) -> &Capabilities {
        &self.caps
    }

    /// Narrow the capabilities
    ///
    /// Only ever narrows: the stored value is intersected with `caps`.
    /// Returns false (leaving the request untouched) when they don't
    /// intersect.
    pub fn narrow_caps(&mut self, caps: &Capabilities) -> bool {
        match self.caps.intersect(caps) {
            Some(narrowed) => {
                self.caps = narrowed;
                true
            }
            None => false,
        }
    }

    /// Request parameters
    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    /// Mutable request parameters
    pub fn info_mut(&mut self) -> &mut RequestInfo {
        &mut self.info
    }

    /// Serving details
    pub fn serving_info(&self) -> &RequestServingInfo {
        &self.serving_info
    }

    /// Mutable serving details
    pub fn serving_info_mut(&mut self) -> &mut RequestServingInfo {
        &mut self.serving_info
    }

    /// Record that `element` delivers to this request through `callback`
    ///
    /// Refuses a second attachment of the same element.
    pub fn register_callback(&mut self, element: &str, callback: CallbackId) -> Result<()> {
        if self.rev_callbacks.contains_key(element) {
            return Err(Error::AlreadyAttached(element.to_string()));
        }
        if self.callbacks.contains_key(&callback) {
            return Err(Error::Duplicate(callback.to_string()));
        }
        self.callbacks.insert(callback, element.to_string());
        self.rev_callbacks.insert(element.to_string(), callback);
        debug_assert_eq!(self.callbacks.len(), self.rev_callbacks.len());
        Ok(())
    }

    /// Forget the attachment to `element`
    pub fn unregister_callback(&mut self, element: &str) -> Option<CallbackId> {
        let callback = self.rev_callbacks.remove(element)?;
        self.callbacks.remove(&callback);
        debug_assert_eq!(self.callbacks.len(), self.rev_callbacks.len());
        Some(callback)
    }

    /// Whether `element` is attached to this request
    pub fn is_attached_to(&self, element: &str) -> bool {
        self.rev_callbacks.contains_key(element)
    }

    /// Element owning `callback`
    pub fn element_for(&self, callback: CallbackId) -> Option<&str> {
        self.callbacks.get(&callback).map(String::as_str)
    }

    /// Names of all elements attached to this request
    pub fn attached_elements(&self) -> Vec<String> {
        self.rev_callbacks.keys().cloned().collect()
    }

    /// Number of live attachments
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Current controller, if an element is driving this request
    pub fn controller(&self) -> Option<&Arc<dyn ElementController>> {
        self.controller.as_ref().map(|(_, c)| c)
    }

    /// Name of the element that owns the controller
    pub fn controller_owner(&self) -> Option<&str> {
        self.controller.as_ref().map(|(owner, _)| owner.as_str())
    }

    /// Install the controller of `owner`
    ///
    /// Fails if another controller is installed; it has to be cleared
    /// first.
    pub fn set_controller(
        &mut self,
        owner: &str,
        controller: Arc<dyn ElementController>,
    ) -> Result<()> {
        if let Some((current, _)) = &self.controller {
            return Err(Error::ControllerBusy(current.clone()));
        }
        self.controller = Some((owner.to_string(), controller));
        Ok(())
    }

    /// Drop the controller, whoever owns it
    pub fn clear_controller(&mut self) -> Option<Arc<dyn ElementController>> {
        self.controller.take().map(|(_, c)| c)
    }

    /// Drop the controller if `owner` installed it
    pub fn clear_controller_of(&mut self, owner: &str) -> bool {
        if self.controller_owner() == Some(owner) {
            self.controller = None;
            true
        } else {
            false
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.callbacks.is_empty(),
                "{} dropped while attached to {:?}",
                self.id,
                self.rev_callbacks.keys().collect::<Vec<_>>()
            );
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("caps", &self.caps)
            .field("path", &self.info.path)
            .field("attached", &self.rev_callbacks.keys().collect::<Vec<_>>())
            .field("controller", &self.controller_owner())
            .finish()
    }
}
