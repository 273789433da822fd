//! Outbound byte accounting for a connection
//!
//! The wire side pushes bytes in as it writes them and takes them out as
//! the socket drains. Senders ask [`OutboundBuffer::can_send`] before
//! writing and park a ready callback when the answer is no.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::callback::Closure;
use crate::selector::Selector;

struct BufferState {
    pending: usize,
    ready: Option<(usize, Closure)>,
    closed: bool,
}

/// Pending-bytes counter with a low-water ready callback
///
/// Clones share the same counter. Sending is allowed while fewer than
/// `max_size / 2` bytes are pending; a parked ready callback is posted on
/// the selector once the count falls to `max_size / 4` or less. The
/// callback never runs inline.
#[derive(Clone)]
pub struct OutboundBuffer {
    max_size: usize,
    selector: Arc<Selector>,
    state: Arc<Mutex<BufferState>>,
}

impl OutboundBuffer {
    /// Create a buffer posting ready callbacks on `selector`
    pub fn new(selector: Arc<Selector>, max_size: usize) -> Self {
        Self {
            max_size,
            selector,
            state: Arc::new(Mutex::new(BufferState {
                pending: 0,
                ready: None,
                closed: false,
            })),
        }
    }

    /// Configured maximum
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bytes written but not yet drained
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Whether another write is welcome
    pub fn can_send(&self) -> bool {
        let st = self.state.lock();
        !st.closed && st.pending < self.max_size / 2
    }

    /// Account for `len` bytes written
    pub fn push(&self, len: usize) {
        self.state.lock().pending += len;
    }

    /// Account for `len` bytes drained by the socket
    pub fn consume(&self, len: usize) {
        let ready = {
            let mut st = self.state.lock();
            st.pending = st.pending.saturating_sub(len);
            match st.ready {
                Some((low, _)) if st.pending <= low => st.ready.take(),
                _ => None,
            }
        };
        if let Some((_, ready)) = ready {
            self.post(ready);
        }
    }

    /// Run `ready` once pending bytes fall to a quarter of the maximum
    ///
    /// Replaces a previously parked callback.
    pub fn set_ready_callback(&self, ready: Closure) {
        let low = self.max_size / 4;
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            if st.pending > low {
                st.ready = Some((low, ready));
                return;
            }
            st.ready = None;
        }
        self.post(ready);
    }

    /// Whether a ready callback is parked
    pub fn has_ready_callback(&self) -> bool {
        self.state.lock().ready.is_some()
    }

    /// Stop accepting writes and drop any parked callback
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
        st.ready = None;
    }

    fn post(&self, ready: Closure) {
        tracing::trace!(selector = %self.selector.name(), "Outbound buffer ready");
        if !self.selector.run_in_select_loop(ready) {
            tracing::debug!("Selector stopped, dropping ready callback");
        }
    }
}

impl std::fmt::Debug for OutboundBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("OutboundBuffer")
            .field("max_size", &self.max_size)
            .field("pending", &st.pending)
            .field("closed", &st.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Closure) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        (fired, move || {
            let f = Arc::clone(&f);
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }) as Closure
        })
    }

    #[test]
    fn test_hysteresis_at_half() {
        let selector = Selector::spawn("net").unwrap();
        let buffer = OutboundBuffer::new(Arc::clone(&selector), 100_000);

        buffer.push(49_999);
        assert!(buffer.can_send());
        buffer.push(1);
        assert_eq!(buffer.pending(), 50_000);
        assert!(!buffer.can_send());

        buffer.consume(0);
        assert!(!buffer.can_send());
        buffer.consume(1);
        assert!(buffer.can_send());
        selector.stop_and_join();
    }

    #[test]
    fn test_ready_fires_at_quarter() {
        let selector = Selector::spawn("net").unwrap();
        let buffer = OutboundBuffer::new(Arc::clone(&selector), 100_000);
        let (fired, ready) = counter();

        buffer.push(60_000);
        buffer.set_ready_callback(ready());
        assert!(buffer.has_ready_callback());

        buffer.consume(34_999);
        selector.run_and_wait(|| ()).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        buffer.consume(1);
        assert!(!buffer.has_ready_callback());
        selector.run_and_wait(|| ()).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        buffer.consume(25_000);
        selector.run_and_wait(|| ()).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        selector.stop_and_join();
    }

    #[test]
    fn test_ready_posted_when_already_drained() {
        let selector = Selector::spawn("net").unwrap();
        let buffer = OutboundBuffer::new(Arc::clone(&selector), 100_000);
        let (fired, ready) = counter();

        let inline = selector
            .run_and_wait({
                let buffer = buffer.clone();
                let fired = Arc::clone(&fired);
                move || {
                    buffer.set_ready_callback(ready());
                    fired.load(Ordering::SeqCst)
                }
            })
            .unwrap();
        assert_eq!(inline, 0);
        selector.run_and_wait(|| ()).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        selector.stop_and_join();
    }

    #[test]
    fn test_close_drops_callback() {
        let selector = Selector::spawn("net").unwrap();
        let buffer = OutboundBuffer::new(Arc::clone(&selector), 1000);
        let (fired, ready) = counter();

        buffer.push(900);
        buffer.set_ready_callback(ready());
        buffer.close();
        assert!(!buffer.can_send());
        buffer.consume(900);
        selector.run_and_wait(|| ()).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        selector.stop_and_join();
    }
}
