//! Callback handles
//!
//! Two kinds of callbacks travel through the pipeline:
//! - [`ProcessingCallback`]: permanent, invoked for every tag until the
//!   attachment is removed. It carries an identity so a [`Request`] can key
//!   its callback maps on it.
//! - [`Closure`]: one-shot, consumed when run (close notifications,
//!   cross-loop hand-offs).
//!
//! [`Request`]: crate::request::Request

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::tag::Tag;

/// One-shot callback
pub type Closure = Box<dyn FnOnce() + Send + 'static>;

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a processing callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    fn next() -> Self {
        CallbackId(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// Permanent tag-processing callback: `(tag, timestamp_ms)`
///
/// Cloning shares the same identity and the same underlying closure.
#[derive(Clone)]
pub struct ProcessingCallback {
    id: CallbackId,
    f: Arc<dyn Fn(&Tag, i64) + Send + Sync>,
}

impl ProcessingCallback {
    /// Wrap a closure as a permanent callback with a fresh identity
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Tag, i64) + Send + Sync + 'static,
    {
        Self {
            id: CallbackId::next(),
            f: Arc::new(f),
        }
    }

    /// Identity of this callback
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Invoke the callback
    pub fn run(&self, tag: &Tag, timestamp_ms: i64) {
        (self.f)(tag, timestamp_ms)
    }
}

impl fmt::Debug for ProcessingCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingCallback")
            .field("id", &self.id)
            .finish()
    }
}
