//! Live publishing element
//!
//! One publisher pushes tags, every attached request receives them. Late
//! joiners get a catch-up sequence first. A disconnecting publisher leaves
//! its audience attached, waiting for it to come back; [`LiveElement::end_source`]
//! ends the stream for everybody.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::callback::{Closure, ProcessingCallback};
use crate::element::{media_belongs_to, Bootstrapper, DescribeCallback, Element, TagDistributor};
use crate::error::{Error, Result};
use crate::request::{Capabilities, Request};
use crate::selector::Selector;
use crate::tag::{first_flavour, MediaInfo, Tag};

struct LiveState {
    distributor: TagDistributor,
    bootstrap: Bootstrapper,
    publisher_id: Option<u64>,
    last_ts: i64,
    ended: bool,
    closing: bool,
    on_close: Option<Closure>,
}

/// Publish/fan-out element
pub struct LiveElement {
    name: String,
    caps: Capabilities,
    max_clients: Option<u32>,
    selector: Arc<Selector>,
    state: Mutex<LiveState>,
    me: Weak<LiveElement>,
}

impl LiveElement {
    /// Create a live element producing `caps`
    ///
    /// `max_clients` caps the number of attached requests.
    pub fn new(
        name: impl Into<String>,
        selector: Arc<Selector>,
        caps: Capabilities,
        max_clients: Option<u32>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            name,
            caps,
            max_clients,
            selector,
            state: Mutex::new(LiveState {
                distributor: TagDistributor::new(),
                bootstrap: Bootstrapper::new(),
                publisher_id: None,
                last_ts: 0,
                ended: false,
                closing: false,
                on_close: None,
            }),
            me: me.clone(),
        })
    }

    /// Claim the element for a publisher
    ///
    /// Fails if another publisher is active or the element is closing.
    pub fn start_publishing(&self, publisher_id: u64) -> Result<()> {
        let mut st = self.state.lock();
        if st.closing {
            return Err(Error::Closed);
        }
        if let Some(current) = st.publisher_id {
            if current != publisher_id {
                return Err(Error::Duplicate(format!("{} publisher", self.name)));
            }
        }
        st.publisher_id = Some(publisher_id);
        st.ended = false;
        tracing::info!(
            element = %self.name,
            publisher_id = publisher_id,
            subscribers = st.distributor.len(),
            "Publisher registered"
        );
        Ok(())
    }

    /// Release the element; the audience stays attached
    pub fn stop_publishing(&self, publisher_id: u64) {
        let mut st = self.state.lock();
        if st.publisher_id != Some(publisher_id) {
            tracing::warn!(
                element = %self.name,
                expected = ?st.publisher_id,
                actual = publisher_id,
                "Publisher unregister mismatch"
            );
            return;
        }
        st.publisher_id = None;
        tracing::info!(
            element = %self.name,
            publisher_id = publisher_id,
            subscribers = st.distributor.len(),
            "Publisher disconnected"
        );
    }

    /// Whether a publisher is active
    pub fn has_publisher(&self) -> bool {
        self.state.lock().publisher_id.is_some()
    }

    /// Number of attached requests
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().distributor.len()
    }

    /// Push one tag to every attached request
    ///
    /// Runs on the media selector; calls from other threads are posted
    /// there in order.
    pub fn publish(&self, tag: Tag) {
        if !self.selector.is_in_select_thread() {
            let me = self.me.clone();
            self.selector.run_in_select_loop(move || {
                if let Some(me) = me.upgrade() {
                    me.publish(tag);
                }
            });
            return;
        }

        let (boot, targets) = {
            let mut st = self.state.lock();
            if st.closing || st.ended {
                tracing::trace!(element = %self.name, "Dropping tag, not accepting media");
                return;
            }
            let boot = Self::collect_bootstrap(&mut st);
            st.bootstrap.push(&tag);
            st.last_ts = st.last_ts.max(tag.timestamp_ms());
            (boot, st.distributor.running(tag.flavour_mask()))
        };

        Self::deliver_bootstrap(boot);
        let ts = tag.timestamp_ms();
        for callback in targets {
            callback.run(&tag, ts);
        }
    }

    /// End the current stream: every attached request gets a normal EOS
    pub fn end_source(&self) {
        self.finish_source(None);
    }

    /// The publisher's stream broke (bad payload, failed split)
    ///
    /// Every attached request gets a forced EOS; the element stays
    /// registered and a new publisher may take over.
    pub fn fail_source(&self, reason: impl Into<String>) {
        self.finish_source(Some(Error::Producer(reason.into())));
    }

    fn finish_source(&self, error: Option<Error>) {
        if !self.selector.is_in_select_thread() {
            let me = self.me.clone();
            self.selector.run_in_select_loop(move || {
                if let Some(me) = me.upgrade() {
                    me.finish_source(error);
                }
            });
            return;
        }

        let (eos, ts) = {
            let mut st = self.state.lock();
            st.ended = true;
            st.publisher_id = None;
            st.bootstrap.clear();
            (st.distributor.close_all(), st.last_ts)
        };
        let forced = error.is_some();
        match error {
            Some(e) => tracing::error!(element = %self.name, requests = eos.len(), error = %e, "Source failed"),
            None => tracing::info!(element = %self.name, requests = eos.len(), "Source ended"),
        }
        for (callback, flavour_mask) in eos {
            callback.run(&Tag::eos(first_flavour(flavour_mask), ts, forced), ts);
        }
    }

    fn collect_bootstrap(st: &mut LiveState) -> Vec<(ProcessingCallback, Vec<(Tag, i64)>)> {
        let pending = st.distributor.take_to_bootstrap();
        pending
            .into_iter()
            .map(|(callback, mask)| {
                let catchup = st.bootstrap.catchup(mask);
                (callback, catchup)
            })
            .collect()
    }

    fn deliver_bootstrap(jobs: Vec<(ProcessingCallback, Vec<(Tag, i64)>)>) {
        for (callback, catchup) in jobs {
            for (tag, ts) in catchup {
                callback.run(&tag, ts);
            }
        }
    }

    fn schedule_bootstrap(&self) {
        let me = self.me.clone();
        self.selector.run_in_select_loop(move || {
            if let Some(me) = me.upgrade() {
                let jobs = Self::collect_bootstrap(&mut me.state.lock());
                Self::deliver_bootstrap(jobs);
            }
        });
    }
}

impl Element for LiveElement {
    fn kind(&self) -> &str {
        "live"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_request(&self, media: &str, req: &mut Request, callback: ProcessingCallback) -> bool {
        if !media_belongs_to(&self.name, media) {
            return false;
        }
        let mut st = self.state.lock();
        if st.closing || st.ended {
            tracing::warn!(element = %self.name, media = %media, "Refusing request, stream not active");
            return false;
        }
        if let Some(max) = self.max_clients {
            if st.distributor.len() >= max as usize {
                tracing::warn!(element = %self.name, max_clients = max, "Refusing request, too many clients");
                return false;
            }
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
        tracing::info!(
            element = %self.name,
            request = %req.id(),
            subscribers = st.distributor.len(),
            "Request added"
        );
        drop(st);

        self.schedule_bootstrap();
        true
    }

    fn remove_request(&self, req: &mut Request) {
        let on_close = {
            let mut st = self.state.lock();
            if !st.distributor.remove(req.id()) {
                tracing::debug!(element = %self.name, request = %req.id(), "Request not attached");
            }
            req.unregister_callback(&self.name);
            tracing::debug!(
                element = %self.name,
                request = %req.id(),
                subscribers = st.distributor.len(),
                "Request removed"
            );
            if st.closing && st.distributor.is_empty() {
                st.on_close.take()
            } else {
                None
            }
        };
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
        self.selector.run_in_select_loop(move || on_info(Some(MediaInfo::default())));
        true
    }

    fn close(&self, on_close: Closure) {
        let (eos, ts, ready) = {
            let mut st = self.state.lock();
            if st.closing {
                tracing::warn!(element = %self.name, "Close already in progress");
                return;
            }
            st.closing = true;
            let eos = st.distributor.close_all();
            if st.distributor.is_empty() {
                (eos, st.last_ts, Some(on_close))
            } else {
                st.on_close = Some(on_close);
                (eos, st.last_ts, None)
            }
        };
        tracing::info!(element = %self.name, requests = eos.len(), "Closing");

        self.selector.run_in_select_loop(move || {
            for (callback, flavour_mask) in eos {
                callback.run(&Tag::eos(first_flavour(flavour_mask), ts, true), ts);
            }
            if let Some(on_close) = ready {
                on_close();
            }
        });
    }
}
