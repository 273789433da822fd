//! Exporter: one consumer session against an [`ExportProtocol`]

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::{ExportContext, ExportProtocol, SessionState, TagQueue};
use crate::auth::{AsyncAuthorize, AuthorizerRequest};
use crate::callback::ProcessingCallback;
use crate::element::ElementController;
use crate::error::{ControlOp, Error};
use crate::request::{Capabilities, Request, RequestInfo};
use crate::selector::Selector;
use crate::stats::{ExportMetrics, StatsBegin, StatsEnd, StreamBegin, StreamEnd};
use crate::tag::{SourceChange, Tag, TagKind};

/// Media-selector side of the session
struct MediaSide<P: ExportProtocol> {
    state: SessionState,
    request: Option<Request>,
    media_name: String,
    export_path: String,
    export_client_registered: bool,
    request_registered: bool,
    stream_begun: bool,
    /// `SourceStarted` tags not yet matched by a `SourceEnded`
    sources: Vec<SourceChange>,
    dropping_interframes: bool,
    eos_seen: bool,
    user_paused: bool,
    seek_ms: i64,
    /// Keeps the exporter alive while a request is being served
    play_guard: Option<RefGuard<P>>,
}

/// State read and written from both selectors
struct Shared {
    queue: TagQueue,
    /// No more sends
    closed: bool,
    /// A drain is posted or waiting for the wire
    drain_scheduled: bool,
    /// The controller was paused because the queue grew too long
    flow_paused: bool,
    flow_control_total_ms: i64,
    flow_control_video_ms: i64,
    /// Source currently served
    media_name: String,
    /// `(media ts, wall ms)` pacing reference
    pace: Option<(i64, i64)>,
    metrics: ExportMetrics,
}

/// One export session
///
/// Built through [`Exporter::new`], which hands the caller an
/// [`ExportHandle`] owning the first reference.
pub struct Exporter<P: ExportProtocol> {
    ctx: ExportContext,
    protocol_name: String,
    protocol: Mutex<P>,
    media: Mutex<MediaSide<P>>,
    shared: Mutex<Shared>,
    auth: AsyncAuthorize,
    callback: ProcessingCallback,
    refs: AtomicUsize,
    released: AtomicBool,
    transport_closed: AtomicBool,
    me: Weak<Exporter<P>>,
}

impl<P: ExportProtocol> Exporter<P> {
    /// Create an exporter serving through `protocol`
    pub fn new(ctx: ExportContext, protocol: P) -> ExportHandle<P> {
        let protocol_name = protocol.protocol_name().to_string();
        let auth = AsyncAuthorize::new(
            Arc::clone(&ctx.media_selector),
            ctx.config.authorization_timeout,
        );
        let exporter = Arc::new_cyclic(|me: &Weak<Exporter<P>>| {
            let weak = me.clone();
            Self {
                protocol_name,
                protocol: Mutex::new(protocol),
                media: Mutex::new(MediaSide {
                    state: SessionState::Created,
                    request: None,
                    media_name: String::new(),
                    export_path: String::new(),
                    export_client_registered: false,
                    request_registered: false,
                    stream_begun: false,
                    sources: Vec::new(),
                    dropping_interframes: false,
                    eos_seen: false,
                    user_paused: false,
                    seek_ms: 0,
                    play_guard: None,
                }),
                shared: Mutex::new(Shared {
                    queue: TagQueue::new(),
                    closed: false,
                    drain_scheduled: false,
                    flow_paused: false,
                    flow_control_total_ms: 0,
                    flow_control_video_ms: 0,
                    media_name: String::new(),
                    pace: None,
                    metrics: ExportMetrics::new(),
                }),
                auth,
                callback: ProcessingCallback::new(move |tag: &Tag, ts| {
                    if let Some(me) = weak.upgrade() {
                        me.process_tag(tag, ts);
                    }
                }),
                refs: AtomicUsize::new(1),
                released: AtomicBool::new(false),
                transport_closed: AtomicBool::new(false),
                me: me.clone(),
                ctx,
            }
        });
        ExportHandle { exporter }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.media.lock().state
    }

    /// Whether sends have stopped for good
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Source currently served
    pub fn media_name(&self) -> String {
        self.shared.lock().media_name.clone()
    }

    /// Snapshot of the session counters
    pub fn metrics(&self) -> ExportMetrics {
        self.shared.lock().metrics.clone()
    }

    /// Run `f` with the protocol locked
    ///
    /// Must not be called from inside a protocol hook.
    pub fn with_protocol<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.protocol.lock())
    }

    // ---- reference counting ----

    /// Number of live references
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Whether the release has been scheduled
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Take a reference; fails once the count has reached zero
    pub fn inc_ref(&self) -> bool {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference; the last one schedules the release on the net selector
    pub fn dec_ref(&self) {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.schedule_release(),
            Ok(_) => {}
            Err(_) => tracing::error!(protocol = %self.protocol_name, "Unbalanced exporter dec_ref"),
        }
    }

    /// Reference held for as long as the guard lives
    pub fn hold(&self) -> Option<RefGuard<P>> {
        if !self.inc_ref() {
            return None;
        }
        match self.me.upgrade() {
            Some(exporter) => Some(RefGuard { exporter }),
            None => {
                self.dec_ref();
                None
            }
        }
    }

    fn schedule_release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tracing::debug!(protocol = %self.protocol_name, "Scheduling exporter release");
        self.ctx.net_selector.run_in_select_loop(move || me.release());
    }

    fn release(&self) {
        let state = self.state();
        if !matches!(state, SessionState::Created | SessionState::Closed) {
            tracing::warn!(protocol = %self.protocol_name, state = %state, "Exporter released while active");
        }
        tracing::debug!(protocol = %self.protocol_name, "Exporter released");
        self.protocol.lock().on_released();
    }

    fn post<F>(&self, selector: &Selector, what: &'static str, f: F)
    where
        F: FnOnce(&Arc<Self>) + Send + 'static,
    {
        let Some(guard) = self.hold() else {
            tracing::debug!(what = what, "Exporter released, dropping work");
            return;
        };
        if !selector.run_in_select_loop(move || f(guard.exporter())) {
            tracing::debug!(what = what, selector = %selector.name(), "Selector stopped, dropping work");
        }
    }

    fn on_media<F>(&self, what: &'static str, f: F)
    where
        F: FnOnce(&Arc<Self>) + Send + 'static,
    {
        self.post(&self.ctx.media_selector, what, f)
    }

    fn on_net<F>(&self, what: &'static str, f: F)
    where
        F: FnOnce(&Arc<Self>) + Send + 'static,
    {
        self.post(&self.ctx.net_selector, what, f)
    }

    // ---- session control (any thread) ----

    /// Start serving the request described by `info`
    ///
    /// `info.path` is the full request path; `info.seek_pos_ms` the
    /// initial position.
    pub fn start_request(&self, info: RequestInfo) {
        self.on_media("start_request", move |me| me.do_start(Request::new(info)));
    }

    /// Start serving the request at `url`
    pub fn start_url(&self, url: &str) {
        match Request::from_url(url) {
            Ok(req) => self.on_media("start_request", move |me| me.do_start(req)),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Bad request");
                self.on_media("start_request", move |me| me.terminate(e));
            }
        }
    }

    /// Pause or resume the element
    pub fn pause(&self, pause: bool) {
        self.on_media("pause", move |me| me.do_pause(pause));
    }

    /// Seek the element
    pub fn seek(&self, seek_ms: i64) {
        self.on_media("seek", move |me| me.do_seek(seek_ms));
    }

    /// End the session: detach from the element and release resources
    ///
    /// Runs on the media selector; calling it again is a no-op.
    pub fn handle_eos(&self, reason: &str) {
        let reason = reason.to_string();
        self.on_media("handle_eos", move |me| me.close_request(&reason));
    }

    /// The transport went away
    ///
    /// Must not be called from inside a protocol hook.
    pub fn transport_closed(&self, reason: &str) {
        if self.transport_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(protocol = %self.protocol_name, reason = %reason, "Transport closed");
        self.protocol.lock().on_transport_closed();
        self.stop_sending();
        self.handle_eos(reason);
    }

    // ---- media selector ----

    fn do_start(&self, mut req: Request) {
        if self.state() != SessionState::Created {
            tracing::warn!(request = %req.id(), state = %self.state(), "Request already started");
            return;
        }
        let path = req.info().path.clone();
        self.begin_stream_stats(&req);

        let Some(media_path) = self.ctx.config.media_path(&path).map(str::to_string) else {
            self.terminate(Error::StreamNotFound(path));
            return;
        };
        if !self
            .ctx
            .mapper
            .get_media_details(&self.protocol_name, &media_path, &mut req)
        {
            self.terminate(Error::StreamNotFound(media_path));
            return;
        }
        if let Some(mask) = req.serving_info().flavour_mask {
            if !req.narrow_caps(&Capabilities::new(None, mask)) {
                self.terminate(Error::CapabilityMismatch(media_path));
                return;
            }
        }

        let serving = req.serving_info().clone();
        let auth_req = AuthorizerRequest {
            net_address: req
                .info()
                .remote_address
                .map(|a| a.ip().to_string())
                .unwrap_or_default(),
            resource: serving.media_name.clone(),
            action: "play".to_string(),
            ..req.info().auth_req.clone()
        };
        tracing::info!(
            protocol = %self.protocol_name,
            request = %req.id(),
            path = %path,
            media = %serving.media_name,
            session_id = %req.info().session_id,
            "Request started"
        );

        {
            let mut m = self.media.lock();
            m.media_name = serving.media_name.clone();
            m.export_path = serving.export_path.clone();
            m.seek_ms = req.info().seek_pos_ms;
            m.request = Some(req);
            m.play_guard = self.hold();
            m.state.advance(SessionState::Authorizing);
        }
        {
            let mut sh = self.shared.lock();
            sh.flow_control_total_ms = serving.flow_control_total_ms;
            sh.flow_control_video_ms = serving.flow_control_video_ms;
            sh.media_name = serving.media_name.clone();
        }

        if serving.authorizer_name.is_empty() {
            self.authorize_completed(true);
            return;
        }
        let Some(authorizer) = self.ctx.mapper.get_authorizer(&serving.authorizer_name) else {
            tracing::warn!(authorizer = %serving.authorizer_name, "Unknown authorizer");
            self.authorize_completed(false);
            return;
        };

        let guard = self.hold();
        let weak = self.me.clone();
        self.auth.start(
            authorizer,
            auth_req,
            Box::new(move |allowed| {
                if let Some(guard) = guard {
                    guard.exporter().authorize_completed(allowed);
                }
            }),
            Box::new(move || {
                if let Some(me) = weak.upgrade() {
                    me.reauthorization_failed();
                }
            }),
        );
    }

    fn authorize_completed(&self, allowed: bool) {
        let (media_name, export_path, max_clients, seek_ms) = {
            let m = self.media.lock();
            if m.state != SessionState::Authorizing {
                tracing::debug!(state = %m.state, "Discarding authorization result");
                return;
            }
            let max_clients = m
                .request
                .as_ref()
                .and_then(|r| r.serving_info().max_clients)
                .or(self.ctx.config.default_max_clients);
            (m.media_name.clone(), m.export_path.clone(), max_clients, m.seek_ms)
        };
        if !allowed {
            self.terminate(Error::Unauthorized(media_name));
            return;
        }

        let clients = self
            .ctx
            .mapper
            .add_export_client(&self.protocol_name, &export_path);
        self.media.lock().export_client_registered = true;
        if let Some(limit) = max_clients {
            if clients > limit {
                self.terminate(Error::TooManyClients {
                    export_path,
                    limit: limit as i32,
                });
                return;
            }
        }

        let Some(mut req) = self.media.lock().request.take() else {
            return;
        };
        let attached = self
            .ctx
            .mapper
            .add_request(&media_name, &mut req, self.callback.clone());
        let controller = req.controller().cloned();
        if !attached {
            self.media.lock().request = Some(req);
            self.terminate(Error::AddRequestFailed(media_name));
            return;
        }

        let closed = {
            let mut p = self.protocol.lock();
            p.on_play(&req);
            p.is_closed()
        };
        {
            let mut m = self.media.lock();
            m.request = Some(req);
            m.request_registered = true;
            m.state.advance(SessionState::Playing);
        }
        if closed {
            tracing::warn!(media = %media_name, "Protocol closed on play");
            self.stop_sending();
            self.close_request("PLAY FAILED");
            return;
        }
        tracing::info!(protocol = %self.protocol_name, media = %media_name, "Playing");

        if seek_ms > 0 {
            match controller {
                Some(c) if c.can_seek() && c.seek(seek_ms) => {
                    self.media.lock().state.advance(SessionState::Seeking);
                }
                _ => tracing::debug!(media = %media_name, seek_ms = seek_ms, "Initial seek not supported"),
            }
        }
    }

    fn reauthorization_failed(&self) {
        if !self.state().is_attached() {
            return;
        }
        tracing::info!(media = %self.media.lock().media_name, "Reauthorization failed");
        self.stop_sending();
        self.protocol.lock().on_reauthorization_failed();
        self.close_request("REAUTHORIZATION FAILED");
    }

    /// Terminal failure: one protocol notification, then close
    fn terminate(&self, err: Error) {
        if self.state().is_closing() {
            return;
        }
        tracing::info!(protocol = %self.protocol_name, error = %err, "Session failed");
        self.stop_sending();
        {
            let mut p = self.protocol.lock();
            match &err {
                Error::StreamNotFound(_) | Error::CapabilityMismatch(_) | Error::InvalidUrl(_) => {
                    p.on_stream_not_found()
                }
                Error::Unauthorized(_) => p.on_authorization_failed(),
                Error::TooManyClients { .. } => p.on_too_many_clients(),
                _ => p.on_add_request_failed(),
            }
        }
        self.close_request(err.stats_result());
    }

    fn close_request(&self, result: &str) {
        let (req, registered, client, begun, export_path, play_guard) = {
            let mut m = self.media.lock();
            if m.state.is_closing() {
                return;
            }
            m.state.advance(SessionState::Terminating);
            (
                m.request.take(),
                std::mem::take(&mut m.request_registered),
                std::mem::take(&mut m.export_client_registered),
                std::mem::take(&mut m.stream_begun),
                m.export_path.clone(),
                m.play_guard.take(),
            )
        };
        self.auth.stop();
        let metrics = {
            let mut sh = self.shared.lock();
            sh.closed = true;
            let dropped = sh.queue.clear();
            sh.metrics.tags_dropped += dropped as u64;
            sh.flow_paused = false;
            sh.metrics.clone()
        };

        let stream_id = req.as_ref().map_or(0, |r| r.id().value());
        if let Some(mut req) = req {
            req.clear_controller();
            if registered {
                self.ctx.mapper.remove_request(&mut req);
            }
        }
        if client {
            self.ctx
                .mapper
                .remove_export_client(&self.protocol_name, &export_path);
        }
        if begun {
            self.ctx.stats.end_stats(&StatsEnd::Stream(StreamEnd {
                stream_id,
                result: result.to_string(),
                duration: metrics.duration(),
                tags_sent: metrics.tags_sent,
                tags_dropped: metrics.tags_dropped,
                bytes_sent: metrics.bytes_sent,
            }));
        }
        self.media.lock().state.advance(SessionState::Closed);
        tracing::info!(
            protocol = %self.protocol_name,
            result = %result,
            tags_sent = metrics.tags_sent,
            "Session closed"
        );

        if let Some(guard) = play_guard {
            self.ctx.net_selector.run_in_select_loop(move || drop(guard));
        }
    }

    fn begin_stream_stats(&self, req: &Request) {
        let info = req.info();
        self.ctx.stats.start_stats(&StatsBegin::Stream(StreamBegin {
            stream_id: req.id().value(),
            protocol: self.protocol_name.clone(),
            media: info.path.clone(),
            session_id: info.session_id.clone(),
            client_id: info.client_id.clone(),
            affiliate_id: info.affiliate_id.clone(),
            remote_address: info.remote_address,
            user_agent: info.user_agent.clone(),
        }));
        self.media.lock().stream_begun = true;
    }

    fn controller(&self) -> Option<Arc<dyn ElementController>> {
        self.media
            .lock()
            .request
            .as_ref()
            .and_then(|r| r.controller().cloned())
    }

    fn do_pause(&self, pause: bool) {
        let (attached, already) = {
            let m = self.media.lock();
            (m.state.is_attached(), m.user_paused == pause)
        };
        if attached && already {
            return;
        }
        let done = attached
            && match self.controller() {
                Some(c) if c.can_pause() => c.pause(pause),
                _ => false,
            };
        if !done {
            tracing::debug!(pause = pause, error = %Error::Unsupported(ControlOp::Pause), "Pause refused");
            self.protocol.lock().on_control_failed(ControlOp::Pause);
            return;
        }
        {
            let mut m = self.media.lock();
            m.user_paused = pause;
            m.state.advance(if pause {
                SessionState::Paused
            } else {
                SessionState::Playing
            });
        }
        if !pause {
            self.shared.lock().pace = None;
        }
        self.protocol.lock().on_paused(pause);
    }

    fn do_seek(&self, seek_ms: i64) {
        let done = self.state().is_attached()
            && match self.controller() {
                Some(c) if c.can_seek() => c.seek(seek_ms),
                _ => false,
            };
        if !done {
            tracing::debug!(seek_ms = seek_ms, error = %Error::Unsupported(ControlOp::Seek), "Seek refused");
            self.protocol.lock().on_control_failed(ControlOp::Seek);
            return;
        }
        self.media.lock().state.advance(SessionState::Seeking);
        {
            let mut sh = self.shared.lock();
            if !sh.queue.ends_with_eos() {
                let dropped = sh.queue.clear();
                sh.metrics.tags_dropped += dropped as u64;
            }
            sh.pace = None;
        }
        self.protocol.lock().on_seeked(seek_ms);
    }

    fn resume_flow(&self) {
        if let Some(c) = self.controller() {
            tracing::debug!("Flow control resume");
            c.pause(false);
        }
    }

    /// Intake of one tag from the element
    fn process_tag(&self, tag: &Tag, timestamp_ms: i64) {
        let mut out: Vec<(Tag, i64)> = Vec::with_capacity(2);
        let mut flow_pause = None;
        let kick = {
            let mut m = self.media.lock();
            if m.eos_seen || m.state.is_closing() {
                return;
            }
            match tag.kind() {
                TagKind::Eos { .. } => m.eos_seen = true,
                TagKind::SourceStarted(source) => {
                    tracing::debug!(source = %source.source_element_name, "Source started");
                    m.sources.push(source.clone());
                    m.dropping_interframes = true;
                    self.shared.lock().media_name = source.source_element_name.to_string();
                    if self.ctx.config.flush_on_source_change {
                        out.push((Tag::flush(tag.flavour_mask()), timestamp_ms));
                    }
                }
                TagKind::SourceEnded(source) => match m.sources.pop() {
                    Some(top) if top.source_element_name == source.source_element_name => {}
                    Some(top) => tracing::warn!(
                        expected = %top.source_element_name,
                        got = %source.source_element_name,
                        "Mismatched source end"
                    ),
                    None => tracing::warn!(source = %source.source_element_name, "Unbalanced source end"),
                },
                TagKind::SeekPerformed => {
                    m.dropping_interframes = true;
                    if m.state == SessionState::Seeking {
                        m.state.advance(SessionState::Playing);
                    }
                    self.shared.lock().pace = None;
                }
                TagKind::BootstrapBegin | TagKind::BootstrapEnd | TagKind::CuePoint(_) => return,
                TagKind::Flush => {}
                TagKind::MediaInfo(info) => {
                    let controller = m.request.as_ref().and_then(|r| r.controller());
                    let mut info = (**info).clone();
                    info.seekable &= controller.is_some_and(|c| c.can_seek());
                    info.pausable &= controller.is_some_and(|c| c.can_pause());
                    if controller.is_some_and(|c| c.disabled_duration()) {
                        info.duration_ms = None;
                    }
                    out.push((Tag::media_info(tag.flavour_mask(), info), timestamp_ms));
                }
                TagKind::Media { .. } | TagKind::Composed(_) => {
                    if tag.is_video() && tag.is_droppable() && m.dropping_interframes {
                        if tag.can_resync() {
                            m.dropping_interframes = false;
                        } else {
                            self.shared.lock().metrics.record_dropped();
                            tracing::trace!(tag = %tag, "Dropping interframe");
                            return;
                        }
                    }
                }
            }
            if out.is_empty() || !matches!(tag.kind(), TagKind::MediaInfo(_)) {
                out.push((tag.clone(), timestamp_ms));
            }

            let controller = m.request.as_ref().and_then(|r| r.controller().cloned());
            let mut sh = self.shared.lock();
            if sh.closed {
                return;
            }
            let len_ms = sh.queue.len_ms();
            if tag.is_media() && tag.is_droppable() {
                let over_total = sh.flow_control_total_ms > 0 && len_ms > sh.flow_control_total_ms;
                let over_video =
                    tag.is_video() && sh.flow_control_video_ms > 0 && len_ms > sh.flow_control_video_ms;
                if over_total || over_video {
                    sh.metrics.record_dropped();
                    if tag.is_video() {
                        m.dropping_interframes = true;
                    }
                    tracing::trace!(tag = %tag, queued_ms = len_ms, "Flow control drop");
                    return;
                }
            }
            if sh.flow_control_total_ms == 0
                && !sh.flow_paused
                && len_ms > self.ctx.config.flow_control_pause_ms
            {
                if let Some(c) = controller.filter(|c| c.can_pause()) {
                    sh.flow_paused = true;
                    flow_pause = Some(c);
                }
            }
            for (t, ts) in out {
                sh.queue.push(t, ts);
            }
            !std::mem::replace(&mut sh.drain_scheduled, true)
        };

        if let Some(c) = flow_pause {
            tracing::debug!("Flow control pause");
            c.pause(true);
        }
        if kick {
            self.on_net("drain", |me| me.process_localized_tags());
        }
    }

    // ---- net selector ----

    /// Write queued tags while the wire accepts them
    fn process_localized_tags(&self) {
        loop {
            let mut p = self.protocol.lock();
            let mut sh = self.shared.lock();
            if sh.closed {
                sh.queue.clear();
                sh.drain_scheduled = false;
                return;
            }
            if p.is_closed() {
                sh.closed = true;
                let dropped = sh.queue.clear();
                sh.drain_scheduled = false;
                drop(sh);
                drop(p);
                let err = Error::Transport(format!("connection gone with {} tags queued", dropped));
                tracing::info!(protocol = %self.protocol_name, error = %err, "Ending session");
                self.handle_eos(err.stats_result());
                return;
            }
            let Some((front_is_media, front_ts)) = sh.queue.front().map(|(t, ts)| (t.is_media(), *ts))
            else {
                sh.drain_scheduled = false;
                let resume = std::mem::take(&mut sh.flow_paused);
                drop(sh);
                drop(p);
                if resume {
                    self.on_media("resume_flow", |me| me.resume_flow());
                }
                return;
            };

            if !p.can_send_tag() {
                drop(sh);
                match self.hold() {
                    Some(guard) => p.set_notify_ready(Box::new(move || {
                        guard
                            .exporter()
                            .on_net("drain", |me| me.process_localized_tags());
                    })),
                    None => self.shared.lock().drain_scheduled = false,
                }
                return;
            }
            if front_is_media {
                if let Some(delay) = self.write_ahead_delay(&mut sh, front_ts) {
                    drop(sh);
                    drop(p);
                    self.drain_after(delay);
                    return;
                }
            }

            let Some((tag, ts)) = sh.queue.pop() else {
                continue;
            };
            sh.metrics.record_sent(&tag, ts);
            drop(sh);
            p.send_tag(&tag, ts);
            let closed = p.is_closed();
            drop(p);

            if tag.is_eos() {
                self.stop_sending();
                self.handle_eos("EOS");
                return;
            }
            if closed {
                self.stop_sending();
                self.handle_eos("TRANSPORT CLOSED");
                return;
            }
        }
    }

    /// How long to hold `ts` back so the wire stays within the write-ahead window
    fn write_ahead_delay(&self, sh: &mut Shared, ts: i64) -> Option<Duration> {
        let max_ahead = self.ctx.config.max_write_ahead_ms;
        if max_ahead <= 0 {
            return None;
        }
        let now = self.ctx.net_selector.now_ms();
        let (base_ts, base_now) = *sh.pace.get_or_insert((ts, now));
        let ahead = (ts - base_ts) - (now - base_now);
        (ahead > max_ahead).then(|| Duration::from_millis((ahead - max_ahead) as u64))
    }

    fn drain_after(&self, delay: Duration) {
        let Some(guard) = self.hold() else {
            return;
        };
        self.ctx.net_selector.run_after(delay, move || {
            guard.exporter().process_localized_tags();
        });
    }

    fn stop_sending(&self) {
        let mut sh = self.shared.lock();
        sh.closed = true;
        let dropped = sh.queue.clear();
        sh.metrics.tags_dropped += dropped as u64;
    }
}

/// A counted reference to an exporter; dropping it releases the count
pub struct RefGuard<P: ExportProtocol> {
    exporter: Arc<Exporter<P>>,
}

impl<P: ExportProtocol> RefGuard<P> {
    /// The exporter held
    pub fn exporter(&self) -> &Arc<Exporter<P>> {
        &self.exporter
    }
}

impl<P: ExportProtocol> Drop for RefGuard<P> {
    fn drop(&mut self) {
        self.exporter.dec_ref();
    }
}

/// Owner handle of an exporter, held by the connection
///
/// Dropping it closes the transport side of the session and gives up the
/// owner reference.
pub struct ExportHandle<P: ExportProtocol> {
    exporter: Arc<Exporter<P>>,
}

impl<P: ExportProtocol> ExportHandle<P> {
    /// The exporter
    pub fn exporter(&self) -> &Arc<Exporter<P>> {
        &self.exporter
    }
}

impl<P: ExportProtocol> Deref for ExportHandle<P> {
    type Target = Exporter<P>;

    fn deref(&self) -> &Self::Target {
        &self.exporter
    }
}

impl<P: ExportProtocol> Drop for ExportHandle<P> {
    fn drop(&mut self) {
        self.exporter.transport_closed("END");
        self.exporter.dec_ref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Closure;
    use crate::mapper::StandardMapper;

    struct NullProtocol {
        released: Arc<AtomicUsize>,
    }

    impl ExportProtocol for NullProtocol {
        fn protocol_name(&self) -> &str {
            "null"
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn on_stream_not_found(&mut self) {}

        fn on_too_many_clients(&mut self) {}

        fn on_authorization_failed(&mut self) {}

        fn on_reauthorization_failed(&mut self) {}

        fn on_add_request_failed(&mut self) {}

        fn on_play(&mut self, _req: &Request) {}

        fn on_control_failed(&mut self, _op: ControlOp) {}

        fn can_send_tag(&self) -> bool {
            true
        }

        fn set_notify_ready(&mut self, _ready: Closure) {}

        fn send_tag(&mut self, _tag: &Tag, _timestamp_ms: i64) {}

        fn on_released(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exporter() -> (ExportHandle<NullProtocol>, Arc<AtomicUsize>, Arc<Selector>, Arc<Selector>) {
        let media = Selector::spawn("media").unwrap();
        let net = Selector::spawn("net").unwrap();
        let released = Arc::new(AtomicUsize::new(0));
        let ctx = ExportContext::new(
            Arc::new(StandardMapper::new()),
            Arc::clone(&media),
            Arc::clone(&net),
        );
        let handle = Exporter::new(
            ctx,
            NullProtocol {
                released: Arc::clone(&released),
            },
        );
        (handle, released, media, net)
    }

    /// Flush both loops until the release has run
    fn settle(released: &AtomicUsize, media: &Selector, net: &Selector) {
        for _ in 0..100 {
            media.run_and_wait(|| ()).unwrap();
            net.run_and_wait(|| ()).unwrap();
            if released.load(Ordering::SeqCst) > 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_no_revival_after_zero() {
        let (handle, released, media, net) = exporter();
        let exporter = Arc::clone(handle.exporter());
        assert_eq!(exporter.ref_count(), 1);

        let guard = exporter.hold().unwrap();
        assert_eq!(exporter.ref_count(), 2);
        drop(guard);
        drop(handle);
        settle(&released, &media, &net);

        assert_eq!(exporter.ref_count(), 0);
        assert!(exporter.is_released());
        assert!(!exporter.inc_ref());
        assert!(exporter.hold().is_none());

        // unbalanced decrements are logged, not wrapped
        exporter.dec_ref();
        assert_eq!(exporter.ref_count(), 0);

        net.run_and_wait(|| ()).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        media.stop_and_join();
        net.stop_and_join();
    }

    #[test]
    fn test_single_release_under_contention() {
        let (handle, released, media, net) = exporter();
        let exporter = Arc::clone(handle.exporter());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let exporter = Arc::clone(&exporter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(guard) = exporter.hold() {
                            drop(guard);
                        }
                    }
                })
            })
            .collect();
        drop(handle);
        for t in threads {
            t.join().unwrap();
        }
        settle(&released, &media, &net);
        net.run_and_wait(|| ()).unwrap();

        assert_eq!(exporter.ref_count(), 0);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        media.stop_and_join();
        net.stop_and_join();
    }
}
