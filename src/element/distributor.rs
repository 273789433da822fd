//! Fan-out of one tag stream to many attached requests
//!
//! The distributor only keeps the bookkeeping. Callers collect the
//! callbacks to run while holding their element lock, release the lock,
//! then invoke them, so a callback may freely call back into the element.

use std::collections::BTreeMap;

use crate::callback::ProcessingCallback;
use crate::request::RequestId;

struct Entry {
    callback: ProcessingCallback,
    flavour_mask: u32,
    /// Waiting for its catch-up sequence
    to_bootstrap: bool,
    /// EOS already delivered
    done: bool,
}

/// Per-request delivery state of a fan-out element
#[derive(Default)]
pub struct TagDistributor {
    entries: BTreeMap<RequestId, Entry>,
}

impl TagDistributor {
    /// Create an empty distributor
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request; it starts out waiting for bootstrap
    ///
    /// Returns false if the request is already present.
    pub fn add(&mut self, id: RequestId, callback: ProcessingCallback, flavour_mask: u32) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(
            id,
            Entry {
                callback,
                flavour_mask,
                to_bootstrap: true,
                done: false,
            },
        );
        true
    }

    /// Remove a request; returns whether it was present
    pub fn remove(&mut self, id: RequestId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Whether the request is present
    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of attached requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is attached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Requests waiting for bootstrap; they are marked running
    pub fn take_to_bootstrap(&mut self) -> Vec<(ProcessingCallback, u32)> {
        self.entries
            .values_mut()
            .filter(|e| e.to_bootstrap && !e.done)
            .map(|e| {
                e.to_bootstrap = false;
                (e.callback.clone(), e.flavour_mask)
            })
            .collect()
    }

    /// Running requests interested in `flavour_mask`
    pub fn running(&self, flavour_mask: u32) -> Vec<ProcessingCallback> {
        self.entries
            .values()
            .filter(|e| !e.to_bootstrap && !e.done && e.flavour_mask & flavour_mask != 0)
            .map(|e| e.callback.clone())
            .collect()
    }

    /// Every running request with its flavour mask
    pub fn running_all(&self) -> Vec<(ProcessingCallback, u32)> {
        self.entries
            .values()
            .filter(|e| !e.to_bootstrap && !e.done)
            .map(|e| (e.callback.clone(), e.flavour_mask))
            .collect()
    }

    /// Move every running request back to waiting for bootstrap
    ///
    /// Used when the upstream source changes.
    pub fn reset(&mut self) {
        for entry in self.entries.values_mut().filter(|e| !e.done) {
            entry.to_bootstrap = true;
        }
    }

    /// Mark one request done; returns its callback if EOS is still owed
    pub fn close(&mut self, id: RequestId) -> Option<(ProcessingCallback, u32)> {
        let entry = self.entries.get_mut(&id)?;
        if entry.done {
            return None;
        }
        entry.done = true;
        Some((entry.callback.clone(), entry.flavour_mask))
    }

    /// Mark every request done; returns those still owed an EOS
    pub fn close_all(&mut self) -> Vec<(ProcessingCallback, u32)> {
        self.entries
            .values_mut()
            .filter(|e| !e.done)
            .map(|e| {
                e.done = true;
                (e.callback.clone(), e.flavour_mask)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Request, RequestInfo};

    fn id() -> RequestId {
        Request::new(RequestInfo::default()).id()
    }

    #[test]
    fn test_bootstrap_then_running() {
        let mut dist = TagDistributor::new();
        let a = id();
        assert!(dist.add(a, ProcessingCallback::new(|_, _| {}), 1));
        assert!(!dist.add(a, ProcessingCallback::new(|_, _| {}), 1));

        assert!(dist.running(1).is_empty());
        assert_eq!(dist.take_to_bootstrap().len(), 1);
        assert!(dist.take_to_bootstrap().is_empty());
        assert_eq!(dist.running(1).len(), 1);
        assert!(dist.running(2).is_empty());
        assert_eq!(dist.running_all()[0].1, 1);

        dist.reset();
        assert!(dist.running(1).is_empty());
        assert_eq!(dist.take_to_bootstrap().len(), 1);
    }

    #[test]
    fn test_single_eos() {
        let mut dist = TagDistributor::new();
        let (a, b) = (id(), id());
        dist.add(a, ProcessingCallback::new(|_, _| {}), 1);
        dist.add(b, ProcessingCallback::new(|_, _| {}), 1);

        assert!(dist.close(a).is_some());
        assert!(dist.close(a).is_none());
        assert_eq!(dist.close_all().len(), 1);
        assert!(dist.close_all().is_empty());
        assert!(dist.running(1).is_empty());
        assert_eq!(dist.len(), 2);

        assert!(dist.remove(a));
        assert!(!dist.remove(a));
    }
}
