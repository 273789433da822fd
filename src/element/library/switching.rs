//! Policy-driven switching element
//!
//! Serves whatever media its [`Policy`] picks. The element attaches an
//! internal request to the chosen media through the mapper, wraps each
//! media in `SourceStarted`/`SourceEnded`, rebases timestamps so they keep
//! increasing across switches, and lets the policy veto tags and decide
//! what happens at the end of each media.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::callback::{Closure, ProcessingCallback};
use crate::element::{
    media_belongs_to, DescribeCallback, Element, Policy, PolicyDrivenElement, TagDistributor,
};
use crate::mapper::ElementMapper;
use crate::request::{Capabilities, Request, RequestInfo};
use crate::selector::Selector;
use crate::tag::{first_flavour, Tag, TagKind};

struct SwitchState {
    distributor: TagDistributor,
    current_media: String,
    upstream: Option<Request>,
    /// Added to upstream timestamps
    ts_offset: i64,
    rebase: bool,
    last_ts: i64,
    ended: bool,
    closing: bool,
    on_close: Option<Closure>,
}

type Deliveries = Vec<(ProcessingCallback, Tag, i64)>;

/// Element whose media is chosen by a policy
pub struct SwitchingElement {
    name: String,
    caps: Capabilities,
    selector: Arc<Selector>,
    mapper: Weak<dyn ElementMapper>,
    policy: Mutex<Option<Arc<dyn Policy>>>,
    upstream_callback: ProcessingCallback,
    state: Mutex<SwitchState>,
    me: Weak<SwitchingElement>,
}

impl SwitchingElement {
    /// Create a switching element resolving media through `mapper`
    pub fn new(
        name: impl Into<String>,
        selector: Arc<Selector>,
        mapper: &Arc<dyn ElementMapper>,
        caps: Capabilities,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me: &Weak<SwitchingElement>| {
            let upstream_me = me.clone();
            Self {
                name,
                caps,
                selector,
                mapper: Arc::downgrade(mapper),
                policy: Mutex::new(None),
                upstream_callback: ProcessingCallback::new(move |tag: &Tag, ts| {
                    if let Some(me) = upstream_me.upgrade() {
                        me.process_upstream(tag, ts);
                    }
                }),
                state: Mutex::new(SwitchState {
                    distributor: TagDistributor::new(),
                    current_media: String::new(),
                    upstream: None,
                    ts_offset: 0,
                    rebase: false,
                    last_ts: 0,
                    ended: false,
                    closing: false,
                    on_close: None,
                }),
                me: me.clone(),
            }
        })
    }

    /// Install the policy
    pub fn set_policy(&self, policy: Arc<dyn Policy>) {
        *self.policy.lock() = Some(policy);
    }

    /// Let the policy pick the first media
    pub fn start(&self) -> bool {
        let Some(policy) = self.policy.lock().clone() else {
            tracing::warn!(element = %self.name, "No policy installed");
            return false;
        };
        policy.initialize(self)
    }

    /// Number of attached requests
    pub fn request_count(&self) -> usize {
        self.state.lock().distributor.len()
    }

    fn process_upstream(&self, tag: &Tag, ts: i64) {
        if let TagKind::Eos { forced } = tag.kind() {
            let forced = *forced;
            self.detach_upstream();
            let policy = self.policy.lock().clone();
            let switched = policy.map_or(false, |p| p.notify_eos(self));
            if !switched {
                self.end_all(forced);
            }
            return;
        }

        let policy = self.policy.lock().clone();
        if let Some(policy) = policy {
            if !policy.notify_tag(tag, ts) {
                tracing::trace!(element = %self.name, tag = %tag, "Tag vetoed by policy");
                return;
            }
        }

        let deliveries = {
            let mut st = self.state.lock();
            if st.closing {
                return;
            }
            if st.rebase {
                st.ts_offset = st.last_ts - ts;
                st.rebase = false;
            }
            let out_ts = ts + st.ts_offset;
            st.last_ts = st.last_ts.max(out_ts);

            let mut out = Self::collect_source_started(&mut st);
            for callback in st.distributor.running(tag.flavour_mask()) {
                out.push((callback, tag.clone(), out_ts));
            }
            out
        };
        deliver(deliveries);
    }

    fn collect_source_started(st: &mut SwitchState) -> Deliveries {
        if st.upstream.is_none() || st.current_media.is_empty() {
            return Vec::new();
        }
        let ts = st.last_ts;
        let media = st.current_media.clone();
        st.distributor
            .take_to_bootstrap()
            .into_iter()
            .map(|(callback, mask)| {
                let tag = Tag::source_started(first_flavour(mask), ts, &media, &media);
                (callback, tag, ts)
            })
            .collect()
    }

    fn schedule_source_started(&self) {
        let me = self.me.clone();
        self.selector.run_in_select_loop(move || {
            if let Some(me) = me.upgrade() {
                let deliveries = Self::collect_source_started(&mut me.state.lock());
                deliver(deliveries);
            }
        });
    }

    /// Drop the upstream attachment and tell listeners the source ended
    fn detach_upstream(&self) {
        let (upstream, ended) = {
            let mut st = self.state.lock();
            let Some(upstream) = st.upstream.take() else {
                return;
            };
            let ts = st.last_ts;
            let media = st.current_media.clone();
            let ended: Deliveries = st
                .distributor
                .running_all()
                .into_iter()
                .map(|(callback, mask)| {
                    let tag = Tag::source_ended(first_flavour(mask), ts, &media, &media);
                    (callback, tag, ts)
                })
                .collect();
            (upstream, ended)
        };
        self.release_upstream(upstream);
        deliver(ended);
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

    fn end_all(&self, forced: bool) {
        let (eos, ts) = {
            let mut st = self.state.lock();
            st.ended = true;
            (st.distributor.close_all(), st.last_ts)
        };
        tracing::info!(element = %self.name, requests = eos.len(), forced = forced, "Ending all requests");
        for (callback, mask) in eos {
            callback.run(&Tag::eos(first_flavour(mask), ts, forced), ts);
        }
    }
}

fn deliver(deliveries: Deliveries) {
    for (callback, tag, ts) in deliveries {
        callback.run(&tag, ts);
    }
}

impl PolicyDrivenElement for SwitchingElement {
    fn switch_current_media(&self, media: &str, info: Option<&RequestInfo>, force: bool) -> bool {
        {
            let st = self.state.lock();
            if st.closing {
                return false;
            }
            if !force && st.current_media == media && st.upstream.is_some() {
                return true;
            }
        }
        self.detach_upstream();

        let Some(mapper) = self.mapper.upgrade() else {
            return false;
        };
        let mut upstream = Request::internal(self.caps);
        if let Some(info) = info {
            upstream.info_mut().limit_ms = info.limit_ms;
            upstream.info_mut().seek_pos_ms = info.seek_pos_ms;
        }
        if !mapper.add_request(media, &mut upstream, self.upstream_callback.clone()) {
            tracing::warn!(element = %self.name, media = %media, "Cannot attach to media");
            return false;
        }

        let stale = {
            let mut st = self.state.lock();
            if st.closing {
                Some(upstream)
            } else {
                st.upstream = Some(upstream);
                st.current_media = media.to_string();
                st.rebase = true;
                st.ended = false;
                st.distributor.reset();
                None
            }
        };
        if let Some(upstream) = stale {
            self.release_upstream(upstream);
            return false;
        }
        tracing::info!(element = %self.name, media = %media, "Switched media");
        self.schedule_source_started();
        true
    }

    fn current_media(&self) -> String {
        self.state.lock().current_media.clone()
    }

    fn has_upstream_media(&self, media: &str) -> Option<Capabilities> {
        self.mapper.upgrade()?.has_media(media)
    }
}

impl Element for SwitchingElement {
    fn kind(&self) -> &str {
        "switching"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_request(&self, media: &str, req: &mut Request, callback: ProcessingCallback) -> bool {
        if !media_belongs_to(&self.name, media) {
            return false;
        }
        {
            let mut st = self.state.lock();
            if st.closing || st.ended {
                tracing::warn!(element = %self.name, "Refusing request, not serving");
                return false;
            }
            let Some(caps) = req.caps().intersect(&self.caps) else {
                tracing::warn!(
                    element = %self.name,
                    requested = %req.caps(),
                    produced = %self.caps,
                    "Refusing request, capability mismatch"
                );
                return false;
            };
            if let Err(e) = req.register_callback(&self.name, callback.id()) {
                tracing::warn!(element = %self.name, error = %e, "Refusing request");
                return false;
            }
            req.narrow_caps(&caps);
            st.distributor.add(req.id(), callback, caps.flavour_mask);
        }
        tracing::debug!(element = %self.name, request = %req.id(), "Request added");
        self.schedule_source_started();
        true
    }

    fn remove_request(&self, req: &mut Request) {
        let on_close = {
            let mut st = self.state.lock();
            st.distributor.remove(req.id());
            req.unregister_callback(&self.name);
            if st.closing && st.distributor.is_empty() {
                st.on_close.take()
            } else {
                None
            }
        };
        tracing::debug!(element = %self.name, request = %req.id(), "Request removed");
        if let Some(on_close) = on_close {
            self.selector.run_in_select_loop(on_close);
        }
    }

    fn has_media(&self, media: &str) -> Option<Capabilities> {
        media_belongs_to(&self.name, media).then_some(self.caps)
    }

    fn list_media(&self, dir: &str) -> Vec<(String, Capabilities)> {
        if dir.is_empty() || media_belongs_to(dir, &self.name) {
            vec![(self.name.clone(), self.caps)]
        } else {
            Vec::new()
        }
    }

    fn describe_media(&self, media: &str, on_info: DescribeCallback) -> bool {
        if !media_belongs_to(&self.name, media) {
            return false;
        }
        let current = self.current_media();
        match self.mapper.upgrade() {
            Some(mapper) if !current.is_empty() => mapper.describe_media(&current, on_info),
            _ => {
                self.selector.run_in_select_loop(move || on_info(None));
                true
            }
        }
    }

    fn close(&self, on_close: Closure) {
        let (upstream, eos, ts, ready) = {
            let mut st = self.state.lock();
            if st.closing {
                tracing::warn!(element = %self.name, "Close already in progress");
                return;
            }
            st.closing = true;
            let upstream = st.upstream.take();
            let eos = st.distributor.close_all();
            let ready = if st.distributor.is_empty() {
                Some(on_close)
            } else {
                st.on_close = Some(on_close);
                None
            };
            (upstream, eos, st.last_ts, ready)
        };
        tracing::info!(element = %self.name, requests = eos.len(), "Closing");
        if let Some(upstream) = upstream {
            self.release_upstream(upstream);
        }

        self.selector.run_in_select_loop(move || {
            for (callback, mask) in eos {
                callback.run(&Tag::eos(first_flavour(mask), ts, true), ts);
            }
            if let Some(on_close) = ready {
                on_close();
            }
        });
    }
}
