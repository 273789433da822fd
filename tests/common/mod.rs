//! Shared fixtures for session tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use mediacast::callback::{Closure, ProcessingCallback};
use mediacast::element::{DescribeCallback, Element};
use mediacast::mapper::StandardMapper;
use mediacast::session::{ExportContext, ExportProtocol};
use mediacast::stats::MemoryStatsCollector;
use mediacast::{Capabilities, ControlOp, ExportConfig, MediaFormat, Request, Selector, Tag};

/// Two selectors, a mapper and a stats sink
pub struct Harness {
    pub media: Arc<Selector>,
    pub net: Arc<Selector>,
    pub mapper: Arc<StandardMapper>,
    pub stats: Arc<MemoryStatsCollector>,
}

impl Harness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            media: Selector::spawn("media").unwrap(),
            net: Selector::spawn("net").unwrap(),
            mapper: Arc::new(StandardMapper::new()),
            stats: Arc::new(MemoryStatsCollector::new()),
        }
    }

    pub fn context(&self, config: ExportConfig) -> ExportContext {
        ExportContext::new(
            self.mapper.clone(),
            Arc::clone(&self.media),
            Arc::clone(&self.net),
        )
        .with_stats(self.stats.clone())
        .with_config(config)
    }

    /// Flush both selectors a few times over
    pub fn settle(&self) {
        for _ in 0..5 {
            self.media.run_and_wait(|| ()).unwrap();
            self.net.run_and_wait(|| ()).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Poll `done` for up to five seconds
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            self.settle();
            if done() {
                return true;
            }
        }
        false
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.media.stop_and_join();
        self.net.stop_and_join();
    }
}

/// FLV video tags, a keyframe every `gop` tags
pub fn flv_video(count: i64, step: i64, gop: i64) -> Vec<Tag> {
    (0..count)
        .map(|i| {
            Tag::video(
                MediaFormat::Flv,
                i * step,
                Bytes::from_static(&[0x17, 0x01, 0x00]),
                i % gop == 0,
            )
        })
        .collect()
}

/// Element wrapper counting the contract calls
pub struct CountingElement {
    inner: Arc<dyn Element>,
    pub attempts: AtomicUsize,
    pub adds: AtomicUsize,
    pub removes: AtomicUsize,
}

impl CountingElement {
    pub fn wrap(inner: Arc<dyn Element>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            attempts: AtomicUsize::new(0),
            adds: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
}

impl Element for CountingElement {
    fn kind(&self) -> &str {
        self.inner.kind()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn add_request(&self, media: &str, req: &mut Request, callback: ProcessingCallback) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let ok = self.inner.add_request(media, req, callback);
        if ok {
            self.adds.fetch_add(1, Ordering::SeqCst);
        }
        ok
    }

    fn remove_request(&self, req: &mut Request) {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove_request(req)
    }

    fn has_media(&self, media: &str) -> Option<Capabilities> {
        self.inner.has_media(media)
    }

    fn list_media(&self, dir: &str) -> Vec<(String, Capabilities)> {
        self.inner.list_media(dir)
    }

    fn describe_media(&self, media: &str, on_info: DescribeCallback) -> bool {
        self.inner.describe_media(media, on_info)
    }

    fn close(&self, on_close: Closure) {
        self.inner.close(on_close)
    }
}

/// What a [`RecordingProtocol`] saw
#[derive(Debug, Clone)]
pub enum Seen {
    Hook(&'static str),
    Tag(Tag, i64),
}

/// Shared view of a [`RecordingProtocol`]
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
    blocked: Arc<AtomicBool>,
    ready: Arc<Mutex<Option<Closure>>>,
    closed: Arc<AtomicBool>,
    releases: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn hooks(&self) -> Vec<&'static str> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Hook(h) => Some(h),
                _ => None,
            })
            .collect()
    }

    pub fn tags(&self) -> Vec<(Tag, i64)> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Tag(t, ts) => Some((t, ts)),
                _ => None,
            })
            .collect()
    }

    pub fn media_timestamps(&self) -> Vec<i64> {
        self.tags()
            .into_iter()
            .filter(|(t, _)| t.is_media())
            .map(|(_, ts)| ts)
            .collect()
    }

    pub fn eos_count(&self) -> usize {
        self.tags().iter().filter(|(t, _)| t.is_eos()).count()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Refuse further tags until [`Recorder::unblock`]
    pub fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    /// Accept tags again and run the parked ready callback
    pub fn unblock(&self) {
        self.blocked.store(false, Ordering::SeqCst);
        if let Some(ready) = self.ready.lock().take() {
            ready();
        }
    }

    pub fn has_ready(&self) -> bool {
        self.ready.lock().is_some()
    }
}

/// Protocol recording every hook and tag
pub struct RecordingProtocol {
    rec: Recorder,
}

impl RecordingProtocol {
    pub fn new() -> (Self, Recorder) {
        let rec = Recorder::default();
        (Self { rec: rec.clone() }, rec)
    }

    fn hook(&self, name: &'static str) {
        self.rec.seen.lock().push(Seen::Hook(name));
    }

    fn terminal(&self, name: &'static str) {
        self.hook(name);
        self.rec.closed.store(true, Ordering::SeqCst);
    }
}

impl ExportProtocol for RecordingProtocol {
    fn protocol_name(&self) -> &str {
        "test"
    }

    fn is_closed(&self) -> bool {
        self.rec.closed.load(Ordering::SeqCst)
    }

    fn on_stream_not_found(&mut self) {
        self.terminal("stream_not_found");
    }

    fn on_too_many_clients(&mut self) {
        self.terminal("too_many_clients");
    }

    fn on_authorization_failed(&mut self) {
        self.terminal("authorization_failed");
    }

    fn on_reauthorization_failed(&mut self) {
        self.terminal("reauthorization_failed");
    }

    fn on_add_request_failed(&mut self) {
        self.terminal("add_request_failed");
    }

    fn on_play(&mut self, _req: &Request) {
        self.hook("play");
    }

    fn on_control_failed(&mut self, op: ControlOp) {
        self.hook(match op {
            ControlOp::Pause => "pause_failed",
            ControlOp::Seek => "seek_failed",
        });
    }

    fn on_paused(&mut self, paused: bool) {
        self.hook(if paused { "paused" } else { "resumed" });
    }

    fn on_seeked(&mut self, _seek_ms: i64) {
        self.hook("seeked");
    }

    fn can_send_tag(&self) -> bool {
        !self.rec.blocked.load(Ordering::SeqCst)
    }

    fn set_notify_ready(&mut self, ready: Closure) {
        *self.rec.ready.lock() = Some(ready);
    }

    fn send_tag(&mut self, tag: &Tag, timestamp_ms: i64) {
        self.rec
            .seen
            .lock()
            .push(Seen::Tag(tag.clone(), timestamp_ms));
        if tag.is_eos() {
            self.rec.closed.store(true, Ordering::SeqCst);
        }
    }

    fn on_transport_closed(&mut self) {
        self.hook("transport_closed");
    }

    fn on_released(&mut self) {
        self.rec.releases.fetch_add(1, Ordering::SeqCst);
    }
}
