//! In-memory seekable clip
//!
//! Serves a fixed sequence of tags to each attached request through its own
//! reader. Readers are pumped on the media selector in batches, can be
//! paused (nested) and seeked, and end with a normal EOS once the clip or
//! the request's limit is exhausted.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::callback::{Closure, ProcessingCallback};
use crate::element::{media_belongs_to, DescribeCallback, Element, ElementController, PauseGate};
use crate::request::{Capabilities, Request, RequestId};
use crate::selector::Selector;
use crate::tag::{
    cue_for_time, first_flavour, CuePoint, MediaFormat, MediaInfo, Tag, DEFAULT_FLAVOUR_MASK,
};

/// Clip behaviour switches
#[derive(Debug, Clone)]
pub struct ClipOptions {
    /// Tags delivered per selector turn
    pub batch_size: usize,
    /// Refuse pause requests
    pub disable_pause: bool,
    /// Refuse seek requests
    pub disable_seek: bool,
    /// Hide the duration from consumers
    pub disable_duration: bool,
}

impl Default for ClipOptions {
    fn default() -> Self {
        Self {
            batch_size: 16,
            disable_pause: false,
            disable_seek: false,
            disable_duration: false,
        }
    }
}

struct Clip {
    tags: Vec<Tag>,
    cues: Vec<CuePoint>,
    duration_ms: i64,
    options: ClipOptions,
}

impl Clip {
    fn media_info(&self) -> MediaInfo {
        MediaInfo {
            duration_ms: (!self.options.disable_duration).then_some(self.duration_ms),
            seekable: !self.options.disable_seek,
            pausable: !self.options.disable_pause,
            ..Default::default()
        }
    }
}

struct ReaderState {
    pos: usize,
    pending_seek: Option<i64>,
    skip_before: i64,
    end_ms: Option<i64>,
    last_ts: i64,
    gate: PauseGate,
    started: bool,
    scheduled: bool,
    done: bool,
}

/// Per-request cursor into the clip; also the request's controller
struct ClipReader {
    element: String,
    clip: Arc<Clip>,
    flavour_mask: u32,
    limit_ms: Option<i64>,
    callback: ProcessingCallback,
    selector: Arc<Selector>,
    state: Mutex<ReaderState>,
    me: Weak<ClipReader>,
}

impl ClipReader {
    fn schedule(&self) {
        let me = self.me.clone();
        self.selector.run_in_select_loop(move || {
            if let Some(me) = me.upgrade() {
                me.pump();
            }
        });
    }

    fn pump(&self) {
        let (batch, more) = {
            let mut st = self.state.lock();
            st.scheduled = false;
            if st.done || st.gate.is_paused() {
                return;
            }
            let mut out = Vec::with_capacity(self.clip.options.batch_size + 2);

            if !st.started {
                st.started = true;
                st.end_ms = self.limit_ms;
                out.push((Tag::media_info(self.flavour_mask, self.clip.media_info()), 0));
                if !self.clip.cues.is_empty() {
                    out.push((Tag::cue_points(self.flavour_mask, self.clip.cues.clone()), 0));
                }
            }

            if let Some(seek_ms) = st.pending_seek.take() {
                st.pos = cue_for_time(&self.clip.cues, seek_ms)
                    .map(|i| self.clip.cues[i].position as usize)
                    .unwrap_or(0);
                st.skip_before = seek_ms;
                st.last_ts = seek_ms;
                st.end_ms = self.limit_ms.map(|limit| seek_ms + limit);
                out.push((Tag::seek_performed(self.flavour_mask, seek_ms), seek_ms));
                tracing::debug!(element = %self.element, seek_ms = seek_ms, pos = st.pos, "Seek performed");
            }

            while out.len() < self.clip.options.batch_size && st.pos < self.clip.tags.len() {
                let tag = &self.clip.tags[st.pos];
                if st.end_ms.map_or(false, |end| tag.timestamp_ms() > end) {
                    st.pos = self.clip.tags.len();
                    break;
                }
                st.pos += 1;
                if tag.timestamp_ms() < st.skip_before {
                    continue;
                }
                st.last_ts = tag.timestamp_ms();
                out.push((tag.clone(), st.last_ts));
            }

            if st.pos >= self.clip.tags.len() {
                st.done = true;
                let ts = st.last_ts;
                out.push((Tag::eos(self.flavour_mask, ts, false), ts));
            } else {
                st.scheduled = true;
            }
            (out, !st.done)
        };

        for (tag, ts) in batch {
            self.callback.run(&tag, ts);
        }
        if more {
            self.schedule();
        }
    }

    /// Stop delivering; returns true if an EOS is still owed
    fn finish(&self) -> bool {
        let mut st = self.state.lock();
        !std::mem::replace(&mut st.done, true)
    }
}

impl ElementController for ClipReader {
    fn supports_pause(&self) -> bool {
        true
    }

    fn disabled_pause(&self) -> bool {
        self.clip.options.disable_pause
    }

    fn supports_seek(&self) -> bool {
        true
    }

    fn disabled_seek(&self) -> bool {
        self.clip.options.disable_seek
    }

    fn disabled_duration(&self) -> bool {
        self.clip.options.disable_duration
    }

    fn pause(&self, pause: bool) -> bool {
        if !self.can_pause() {
            return false;
        }
        let resume = {
            let mut st = self.state.lock();
            let resume = st.gate.update(pause) == Some(false) && !st.scheduled && !st.done;
            if resume {
                st.scheduled = true;
            }
            resume
        };
        if resume {
            self.schedule();
        }
        true
    }

    fn seek(&self, seek_ms: i64) -> bool {
        if !self.can_seek() {
            return false;
        }
        let kick = {
            let mut st = self.state.lock();
            if st.done {
                return false;
            }
            st.pending_seek = Some(seek_ms.max(0));
            let kick = !st.scheduled && !st.gate.is_paused();
            if kick {
                st.scheduled = true;
            }
            kick
        };
        if kick {
            self.schedule();
        }
        true
    }
}

struct ClipState {
    readers: HashMap<RequestId, Arc<ClipReader>>,
    closing: bool,
    on_close: Option<Closure>,
}

/// Seekable, pausable in-memory media
pub struct ClipElement {
    name: String,
    caps: Capabilities,
    clip: Arc<Clip>,
    selector: Arc<Selector>,
    state: Mutex<ClipState>,
}

impl ClipElement {
    /// Create a clip from tags sorted by timestamp
    pub fn new(
        name: impl Into<String>,
        selector: Arc<Selector>,
        format: MediaFormat,
        tags: Vec<Tag>,
    ) -> Arc<Self> {
        Self::with_options(name, selector, format, tags, ClipOptions::default())
    }

    /// Create a clip with explicit options
    pub fn with_options(
        name: impl Into<String>,
        selector: Arc<Selector>,
        format: MediaFormat,
        tags: Vec<Tag>,
        options: ClipOptions,
    ) -> Arc<Self> {
        let has_video = tags.iter().any(Tag::is_video);
        let cues = tags
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_media() && t.can_resync() && (t.is_video() || !has_video))
            .map(|(i, t)| CuePoint {
                timestamp_ms: t.timestamp_ms(),
                position: i as i64,
            })
            .collect();
        let duration_ms = tags
            .last()
            .map(|t| t.timestamp_ms() + t.duration_ms())
            .unwrap_or(0);
        let flavour_mask = match tags.iter().fold(0, |mask, t| mask | t.flavour_mask()) {
            0 => DEFAULT_FLAVOUR_MASK,
            mask => mask,
        };

        Arc::new(Self {
            name: name.into(),
            caps: Capabilities::new(Some(format), flavour_mask),
            clip: Arc::new(Clip {
                tags,
                cues,
                duration_ms,
                options,
            }),
            selector,
            state: Mutex::new(ClipState {
                readers: HashMap::new(),
                closing: false,
                on_close: None,
            }),
        })
    }

    /// Cue points of the clip
    pub fn cues(&self) -> &[CuePoint] {
        &self.clip.cues
    }

    /// Number of attached requests
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }
}

impl Element for ClipElement {
    fn kind(&self) -> &str {
        "clip"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_request(&self, media: &str, req: &mut Request, callback: ProcessingCallback) -> bool {
        if !media_belongs_to(&self.name, media) {
            return false;
        }
        let mut st = self.state.lock();
        if st.closing {
            tracing::warn!(element = %self.name, "Refusing request, closing");
            return false;
        }
        if st.readers.contains_key(&req.id()) {
            tracing::warn!(element = %self.name, request = %req.id(), "Request already attached");
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

        let reader = Arc::new_cyclic(|me| ClipReader {
            element: self.name.clone(),
            clip: Arc::clone(&self.clip),
            flavour_mask: first_flavour(caps.flavour_mask),
            limit_ms: req.info().limit_ms,
            callback: callback.clone(),
            selector: Arc::clone(&self.selector),
            state: Mutex::new(ReaderState {
                pos: 0,
                pending_seek: None,
                skip_before: 0,
                end_ms: None,
                last_ts: 0,
                gate: PauseGate::new(),
                started: false,
                scheduled: true,
                done: false,
            }),
            me: me.clone(),
        });

        if let Err(e) = req.register_callback(&self.name, callback.id()) {
            tracing::warn!(element = %self.name, error = %e, "Refusing request");
            return false;
        }
        if let Err(e) = req.set_controller(&self.name, reader.clone()) {
            tracing::warn!(element = %self.name, error = %e, "Refusing request");
            req.unregister_callback(&self.name);
            return false;
        }
        req.narrow_caps(&caps);
        st.readers.insert(req.id(), Arc::clone(&reader));
        drop(st);

        tracing::debug!(element = %self.name, request = %req.id(), media = %media, "Request added");
        reader.schedule();
        true
    }

    fn remove_request(&self, req: &mut Request) {
        let on_close = {
            let mut st = self.state.lock();
            if let Some(reader) = st.readers.remove(&req.id()) {
                reader.finish();
            }
            req.unregister_callback(&self.name);
            req.clear_controller_of(&self.name);
            if st.closing && st.readers.is_empty() {
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
        let info = self.clip.media_info();
        self.selector.run_in_select_loop(move || on_info(Some(info)));
        true
    }

    fn close(&self, on_close: Closure) {
        let (owed, ready) = {
            let mut st = self.state.lock();
            if st.closing {
                tracing::warn!(element = %self.name, "Close already in progress");
                return;
            }
            st.closing = true;
            let owed: Vec<Arc<ClipReader>> = st
                .readers
                .values()
                .filter(|r| r.finish())
                .cloned()
                .collect();
            if st.readers.is_empty() {
                (owed, Some(on_close))
            } else {
                st.on_close = Some(on_close);
                (owed, None)
            }
        };
        tracing::info!(element = %self.name, requests = owed.len(), "Closing");

        self.selector.run_in_select_loop(move || {
            for reader in owed {
                let ts = reader.state.lock().last_ts;
                reader
                    .callback
                    .run(&Tag::eos(reader.flavour_mask, ts, true), ts);
            }
            if let Some(on_close) = ready {
                on_close();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestInfo;
    use crate::tag::TagKind;
    use bytes::Bytes;

    type Seen = Arc<Mutex<Vec<Tag>>>;

    fn clip_tags(count: i64, step: i64, gop: i64) -> Vec<Tag> {
        (0..count)
            .map(|i| {
                Tag::video(
                    MediaFormat::Flv,
                    i * step,
                    Bytes::from_static(&[0u8; 4]),
                    i % gop == 0,
                )
            })
            .collect()
    }

    fn recorder() -> (ProcessingCallback, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        (
            ProcessingCallback::new(move |tag: &Tag, _| s.lock().push(tag.clone())),
            seen,
        )
    }

    fn wait_for_eos(selector: &Selector, seen: &Seen) {
        for _ in 0..200 {
            selector.run_and_wait(|| ()).unwrap();
            if seen.lock().iter().any(Tag::is_eos) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("no EOS");
    }

    #[test]
    fn test_plays_to_eos() {
        let selector = Selector::spawn("media").unwrap();
        let clip = ClipElement::new("clip", Arc::clone(&selector), MediaFormat::Flv, clip_tags(40, 40, 10));
        assert_eq!(clip.cues().len(), 4);

        let (cb, seen) = recorder();
        let mut req = Request::new(RequestInfo::default());
        assert!(clip.add_request("clip", &mut req, cb));
        assert!(req.controller().unwrap().can_seek());
        wait_for_eos(&selector, &seen);

        let seen = seen.lock();
        assert!(matches!(seen[0].kind(), TagKind::MediaInfo(_)));
        assert_eq!(seen.iter().filter(|t| t.is_media()).count(), 40);
        assert_eq!(seen.iter().filter(|t| t.is_eos()).count(), 1);
        assert!(seen.last().unwrap().is_eos());

        clip.remove_request(&mut req);
        assert!(req.controller().is_none());
        selector.stop_and_join();
    }

    #[test]
    fn test_seek_restarts_at_position() {
        let selector = Selector::spawn("media").unwrap();
        let clip = ClipElement::new("clip", Arc::clone(&selector), MediaFormat::Flv, clip_tags(250, 40, 25));

        let (cb, seen) = recorder();
        let clip2 = Arc::clone(&clip);
        let mut req = selector
            .run_and_wait(move || {
                let mut req = Request::new(RequestInfo::default());
                assert!(clip2.add_request("clip", &mut req, cb));
                assert!(req.controller().unwrap().seek(5000));
                req
            })
            .unwrap();
        wait_for_eos(&selector, &seen);

        let seen = seen.lock();
        let seeks: Vec<usize> = seen
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t.kind(), TagKind::SeekPerformed))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(seeks.len(), 1);
        let first_media = seen.iter().position(Tag::is_media).unwrap();
        assert!(seeks[0] < first_media);
        assert!(seen[first_media].timestamp_ms() >= 5000);

        clip.remove_request(&mut req);
        selector.stop_and_join();
    }

    #[test]
    fn test_pause_holds_delivery() {
        let selector = Selector::spawn("media").unwrap();
        let clip = ClipElement::new("clip", Arc::clone(&selector), MediaFormat::Flv, clip_tags(100, 40, 10));

        let (cb, seen) = recorder();
        let clip2 = Arc::clone(&clip);
        let mut req = selector
            .run_and_wait(move || {
                let mut req = Request::new(RequestInfo::default());
                assert!(clip2.add_request("clip", &mut req, cb));
                let ctrl = req.controller().unwrap();
                assert!(ctrl.pause(true));
                assert!(ctrl.pause(true));
                req
            })
            .unwrap();
        selector.run_and_wait(|| ()).unwrap();
        assert!(seen.lock().is_empty());

        let ctrl = Arc::clone(req.controller().unwrap());
        ctrl.pause(false);
        selector.run_and_wait(|| ()).unwrap();
        assert!(seen.lock().is_empty());

        ctrl.pause(false);
        wait_for_eos(&selector, &seen);
        assert_eq!(seen.lock().iter().filter(|t| t.is_media()).count(), 100);

        clip.remove_request(&mut req);
        selector.stop_and_join();
    }

    #[test]
    fn test_limit_and_disabled_controls() {
        let selector = Selector::spawn("media").unwrap();
        let options = ClipOptions {
            disable_seek: true,
            ..Default::default()
        };
        let clip = ClipElement::with_options(
            "clip",
            Arc::clone(&selector),
            MediaFormat::Flv,
            clip_tags(100, 40, 10),
            options,
        );

        let (cb, seen) = recorder();
        let mut req = Request::from_url("/clip?wl=400").unwrap();
        assert!(clip.add_request("clip", &mut req, cb));
        assert!(!req.controller().unwrap().seek(100));
        wait_for_eos(&selector, &seen);

        let seen = seen.lock();
        assert_eq!(seen.iter().filter(|t| t.is_media()).count(), 11);
        match seen[0].kind() {
            TagKind::MediaInfo(info) => assert!(!info.seekable && info.pausable),
            other => panic!("unexpected {:?}", other),
        }
        clip.remove_request(&mut req);
        selector.stop_and_join();
    }

    #[test]
    fn test_close_sends_forced_eos_once() {
        let selector = Selector::spawn("media").unwrap();
        let clip = ClipElement::new("clip", Arc::clone(&selector), MediaFormat::Flv, clip_tags(1000, 40, 10));

        let (cb, seen) = recorder();
        let clip2 = Arc::clone(&clip);
        let mut req = selector
            .run_and_wait(move || {
                let mut req = Request::new(RequestInfo::default());
                assert!(clip2.add_request("clip", &mut req, cb));
                clip2.close(Box::new(|| {}));
                req
            })
            .unwrap();
        wait_for_eos(&selector, &seen);
        selector.run_and_wait(|| ()).unwrap();

        let seen = seen.lock();
        let eos: Vec<&Tag> = seen.iter().filter(|t| t.is_eos()).collect();
        assert_eq!(eos.len(), 1);
        assert!(matches!(eos[0].kind(), TagKind::Eos { forced: true }));
        assert!(seen.last().unwrap().is_eos());

        clip.remove_request(&mut req);
        assert_eq!(clip.reader_count(), 0);
        selector.stop_and_join();
    }
}
