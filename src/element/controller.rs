//! Pause/seek control handed from a producer to a request

use std::sync::Arc;

use parking_lot::Mutex;

/// Control capability an element exposes to the request it serves
///
/// Everything defaults to "not supported".
pub trait ElementController: Send + Sync {
    /// Whether pausing is possible at all
    fn supports_pause(&self) -> bool {
        false
    }

    /// Pausing is possible but turned off for this request
    fn disabled_pause(&self) -> bool {
        false
    }

    /// Whether seeking is possible at all
    fn supports_seek(&self) -> bool {
        false
    }

    /// Seeking is possible but turned off for this request
    fn disabled_seek(&self) -> bool {
        false
    }

    /// Duration must not be advertised to the consumer
    fn disabled_duration(&self) -> bool {
        false
    }

    /// Pause (`true`) or resume (`false`); nested calls are counted
    fn pause(&self, _pause: bool) -> bool {
        false
    }

    /// Seek to `seek_ms`
    fn seek(&self, _seek_ms: i64) -> bool {
        false
    }

    /// Pausing is both supported and enabled
    fn can_pause(&self) -> bool {
        self.supports_pause() && !self.disabled_pause()
    }

    /// Seeking is both supported and enabled
    fn can_seek(&self) -> bool {
        self.supports_seek() && !self.disabled_seek()
    }
}

impl<C: ElementController + ?Sized> ElementController for Arc<C> {
    fn supports_pause(&self) -> bool {
        (**self).supports_pause()
    }

    fn disabled_pause(&self) -> bool {
        (**self).disabled_pause()
    }

    fn supports_seek(&self) -> bool {
        (**self).supports_seek()
    }

    fn disabled_seek(&self) -> bool {
        (**self).disabled_seek()
    }

    fn disabled_duration(&self) -> bool {
        (**self).disabled_duration()
    }

    fn pause(&self, pause: bool) -> bool {
        (**self).pause(pause)
    }

    fn seek(&self, seek_ms: i64) -> bool {
        (**self).seek(seek_ms)
    }
}

/// Controller that supports nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoController;

impl ElementController for NoController {}

/// Nesting counter for pause requests
///
/// `pause(true)` increments, `pause(false)` decrements; only the 0 -> 1 and
/// 1 -> 0 transitions are reported.
#[derive(Debug, Default)]
pub struct PauseGate {
    count: u32,
}

impl PauseGate {
    /// Create an unpaused gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pause/resume call
    ///
    /// Returns `Some(state)` when the effective paused state changed.
    /// Unbalanced resumes are ignored.
    pub fn update(&mut self, pause: bool) -> Option<bool> {
        if pause {
            self.count += 1;
            (self.count == 1).then_some(true)
        } else if self.count == 0 {
            None
        } else {
            self.count -= 1;
            (self.count == 0).then_some(false)
        }
    }

    /// Whether at least one pause is outstanding
    pub fn is_paused(&self) -> bool {
        self.count > 0
    }

    /// Outstanding pause count
    pub fn depth(&self) -> u32 {
        self.count
    }
}

/// Wraps a controller so that nested pauses reach it only on transitions
pub struct NestedPauseController<C> {
    inner: C,
    gate: Mutex<PauseGate>,
}

impl<C: ElementController> NestedPauseController<C> {
    /// Wrap `inner`
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            gate: Mutex::new(PauseGate::new()),
        }
    }

    /// The wrapped controller
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: ElementController> ElementController for NestedPauseController<C> {
    fn supports_pause(&self) -> bool {
        self.inner.supports_pause()
    }

    fn disabled_pause(&self) -> bool {
        self.inner.disabled_pause()
    }

    fn supports_seek(&self) -> bool {
        self.inner.supports_seek()
    }

    fn disabled_seek(&self) -> bool {
        self.inner.disabled_seek()
    }

    fn disabled_duration(&self) -> bool {
        self.inner.disabled_duration()
    }

    fn pause(&self, pause: bool) -> bool {
        if !self.can_pause() {
            return false;
        }
        let transition = self.gate.lock().update(pause);
        match transition {
            Some(state) => self.inner.pause(state),
            None => true,
        }
    }

    fn seek(&self, seek_ms: i64) -> bool {
        self.inner.seek(seek_ms)
    }
}
