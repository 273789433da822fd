//! Keyframe extractor
//!
//! Passes another element's stream through with the video interframes
//! removed. Keyframes closer than `interval_ms` to the last forwarded one
//! are dropped as well, and audio can be dropped entirely. Every request
//! gets its own upstream attachment; `kf/live` reads `live`, a bare `kf`
//! reads the configured default source.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::callback::{Closure, ProcessingCallback};
use crate::element::{
    media_belongs_to, DescribeCallback, Element, ElementController, NestedPauseController,
};
use crate::mapper::ElementMapper;
use crate::request::{Capabilities, Request, RequestId};
use crate::selector::Selector;
use crate::tag::{first_flavour, flavour_ids, Tag, TagKind};

/// Keyframe extractor settings
#[derive(Debug, Clone, Default)]
pub struct KeyframeOptions {
    /// Media read when the request names only the element
    pub source: String,
    /// Minimum spacing of forwarded keyframes (0 = every keyframe)
    pub interval_ms: i64,
    /// Drop audio tags
    pub drop_audio: bool,
}

/// Per-request filtering state, one slot per flavour
#[derive(Debug)]
struct KeyframeFilter {
    interval_ms: i64,
    drop_audio: bool,
    last_keyframe: HashMap<u32, i64>,
}

impl KeyframeFilter {
    fn new(options: &KeyframeOptions) -> Self {
        Self {
            interval_ms: options.interval_ms,
            drop_audio: options.drop_audio,
            last_keyframe: HashMap::new(),
        }
    }

    /// Flavours of `tag` that pass
    fn keep(&mut self, tag: &Tag, ts: i64) -> u32 {
        match tag.kind() {
            TagKind::SeekPerformed | TagKind::SourceStarted(_) => {
                self.last_keyframe.clear();
                return tag.flavour_mask();
            }
            _ => {}
        }
        if tag.is_audio() {
            return if self.drop_audio { 0 } else { tag.flavour_mask() };
        }
        if !tag.is_video() {
            return tag.flavour_mask();
        }
        if !tag.can_resync() {
            return 0;
        }
        let mut kept = 0;
        for id in flavour_ids(tag.flavour_mask()) {
            // a timestamp going back (seek, rebase) restarts the spacing
            let too_close = self
                .last_keyframe
                .get(&id)
                .is_some_and(|last| ts > *last && ts - *last < self.interval_ms);
            if !too_close {
                self.last_keyframe.insert(id, ts);
                kept |= 1 << id;
            }
        }
        kept
    }
}

struct Link {
    filter: KeyframeFilter,
    callback: ProcessingCallback,
    flavour_mask: u32,
    last_ts: i64,
    done: bool,
}

impl Link {
    /// Tags to hand downstream for one upstream tag
    fn process(&mut self, tag: &Tag, ts: i64) -> Vec<Tag> {
        if self.done {
            return Vec::new();
        }
        self.last_ts = self.last_ts.max(ts);
        if tag.is_eos() {
            self.done = true;
            return vec![tag.clone()];
        }
        let kept = self.filter.keep(tag, ts);
        if kept == 0 {
            Vec::new()
        } else if kept == tag.flavour_mask() {
            vec![tag.clone()]
        } else {
            flavour_ids(kept).map(|id| tag.with_flavour(1 << id)).collect()
        }
    }
}

struct Attachment {
    upstream: Request,
    link: Arc<Mutex<Link>>,
}

struct KeyframeState {
    attachments: HashMap<RequestId, Attachment>,
    closing: bool,
    on_close: Option<Closure>,
}

/// Element forwarding only the keyframes of another element's media
pub struct KeyframeElement {
    name: String,
    selector: Arc<Selector>,
    mapper: Weak<dyn ElementMapper>,
    options: KeyframeOptions,
    state: Mutex<KeyframeState>,
}

impl KeyframeElement {
    /// Create an extractor resolving its sources through `mapper`
    pub fn new(
        name: impl Into<String>,
        selector: Arc<Selector>,
        mapper: &Arc<dyn ElementMapper>,
        options: KeyframeOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            selector,
            mapper: Arc::downgrade(mapper),
            options,
            state: Mutex::new(KeyframeState {
                attachments: HashMap::new(),
                closing: false,
                on_close: None,
            }),
        })
    }

    /// Number of attached requests
    pub fn request_count(&self) -> usize {
        self.state.lock().attachments.len()
    }

    /// Media read for `media`, or `None` if it is not ours
    fn source_of(&self, media: &str) -> Option<String> {
        if !media_belongs_to(&self.name, media) {
            return None;
        }
        let rest = media[self.name.len()..].trim_start_matches('/');
        let source = if rest.is_empty() {
            self.options.source.as_str()
        } else {
            rest
        };
        (!source.is_empty()).then(|| source.to_string())
    }

    fn release_upstream(&self, mut upstream: Request) {
        match self.mapper.upgrade() {
            Some(mapper) => mapper.remove_request(&mut upstream),
            None => {
                for element in upstream.attached_elements() {
                    upstream.unregister_callback(&element);
                }
                upstream.clear_controller();
            }
        }
    }
}

impl Element for KeyframeElement {
    fn kind(&self) -> &str {
        "keyframe"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_request(&self, media: &str, req: &mut Request, callback: ProcessingCallback) -> bool {
        let Some(source) = self.source_of(media) else {
            return false;
        };
        if self.state.lock().closing {
            tracing::warn!(element = %self.name, "Refusing request, closing");
            return false;
        }
        if req.is_attached_to(&self.name) {
            tracing::warn!(element = %self.name, request = %req.id(), "Refusing request, already attached");
            return false;
        }
        let Some(mapper) = self.mapper.upgrade() else {
            return false;
        };

        let link = Arc::new(Mutex::new(Link {
            filter: KeyframeFilter::new(&self.options),
            callback: callback.clone(),
            flavour_mask: first_flavour(req.caps().flavour_mask),
            last_ts: 0,
            done: false,
        }));
        let upstream_link = Arc::clone(&link);
        let upstream_callback = ProcessingCallback::new(move |tag: &Tag, ts| {
            let (out, downstream) = {
                let mut link = upstream_link.lock();
                (link.process(tag, ts), link.callback.clone())
            };
            for tag in out {
                downstream.run(&tag, ts);
            }
        });

        let mut upstream = Request::internal(*req.caps());
        upstream.info_mut().limit_ms = req.info().limit_ms;
        if !mapper.add_request(&source, &mut upstream, upstream_callback) {
            tracing::warn!(element = %self.name, media = %source, "Cannot attach to source");
            return false;
        }

        if let Err(e) = req.register_callback(&self.name, callback.id()) {
            tracing::warn!(element = %self.name, error = %e, "Refusing request");
            self.release_upstream(upstream);
            return false;
        }
        if let Some(controller) = upstream.controller().cloned() {
            let nested: Arc<dyn ElementController> = Arc::new(NestedPauseController::new(controller));
            if let Err(e) = req.set_controller(&self.name, nested) {
                tracing::debug!(element = %self.name, error = %e, "Source control not passed on");
            }
        }
        let caps = *upstream.caps();

        let stale = {
            let mut st = self.state.lock();
            if st.closing {
                Some(upstream)
            } else {
                st.attachments.insert(req.id(), Attachment { upstream, link });
                None
            }
        };
        if let Some(upstream) = stale {
            req.unregister_callback(&self.name);
            req.clear_controller_of(&self.name);
            self.release_upstream(upstream);
            return false;
        }
        req.narrow_caps(&caps);
        tracing::debug!(element = %self.name, request = %req.id(), source = %source, "Request added");
        true
    }

    fn remove_request(&self, req: &mut Request) {
        let (attachment, on_close) = {
            let mut st = self.state.lock();
            let attachment = st.attachments.remove(&req.id());
            let on_close = if st.closing && st.attachments.is_empty() {
                st.on_close.take()
            } else {
                None
            };
            (attachment, on_close)
        };
        req.unregister_callback(&self.name);
        req.clear_controller_of(&self.name);
        if let Some(attachment) = attachment {
            attachment.link.lock().done = true;
            self.release_upstream(attachment.upstream);
        }
        tracing::debug!(element = %self.name, request = %req.id(), "Request removed");
        if let Some(on_close) = on_close {
            self.selector.run_in_select_loop(on_close);
        }
    }

    fn has_media(&self, media: &str) -> Option<Capabilities> {
        let source = self.source_of(media)?;
        self.mapper.upgrade()?.has_media(&source)
    }

    fn list_media(&self, dir: &str) -> Vec<(String, Capabilities)> {
        if !(dir.is_empty() || media_belongs_to(dir, &self.name)) {
            return Vec::new();
        }
        self.has_media(&self.name)
            .map(|caps| vec![(self.name.clone(), caps)])
            .unwrap_or_default()
    }

    fn describe_media(&self, media: &str, on_info: DescribeCallback) -> bool {
        let Some(source) = self.source_of(media) else {
            return false;
        };
        match self.mapper.upgrade() {
            Some(mapper) => mapper.describe_media(&source, on_info),
            None => false,
        }
    }

    fn close(&self, on_close: Closure) {
        let (eos, ready) = {
            let mut st = self.state.lock();
            if st.closing {
                tracing::warn!(element = %self.name, "Close already in progress");
                return;
            }
            st.closing = true;
            let eos: Vec<(ProcessingCallback, Tag, i64)> = st
                .attachments
                .values()
                .filter_map(|a| {
                    let mut link = a.link.lock();
                    (!std::mem::replace(&mut link.done, true)).then(|| {
                        let eos = Tag::eos(link.flavour_mask, link.last_ts, true);
                        (link.callback.clone(), eos, link.last_ts)
                    })
                })
                .collect();
            let ready = if st.attachments.is_empty() {
                Some(on_close)
            } else {
                st.on_close = Some(on_close);
                None
            };
            (eos, ready)
        };
        tracing::info!(element = %self.name, requests = eos.len(), "Closing");

        self.selector.run_in_select_loop(move || {
            for (callback, tag, ts) in eos {
                callback.run(&tag, ts);
            }
            if let Some(on_close) = ready {
                on_close();
            }
        });
    }
}
