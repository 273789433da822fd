//! Per-session authorization driver

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::callback::Closure;
use crate::selector::Selector;

use super::{Authorizer, AuthorizerReply, AuthorizerRequest};

/// Receives the first decision
pub type FirstDecision = Box<dyn FnOnce(bool) + Send + 'static>;

#[derive(Default)]
struct Inner {
    /// Bumped by start/stop; replies from older generations are dropped
    generation: u64,
    attempt: u64,
    awaiting: bool,
    authorizer: Option<Arc<dyn Authorizer>>,
    req: AuthorizerRequest,
    started_at: Option<Instant>,
    on_first: Option<FirstDecision>,
    on_reauth_failed: Option<Closure>,
    timeout_timer: Option<AbortHandle>,
    reauth_timer: Option<AbortHandle>,
    limit_timer: Option<AbortHandle>,
}

impl Inner {
    fn cancel_timers(&mut self) {
        for timer in [
            self.timeout_timer.take(),
            self.reauth_timer.take(),
            self.limit_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
    }

    fn shutdown(&mut self) {
        self.generation += 1;
        self.awaiting = false;
        self.authorizer = None;
        self.on_first = None;
        self.on_reauth_failed = None;
        self.cancel_timers();
    }
}

enum Outcome {
    First(FirstDecision, bool),
    ReauthFailed(Option<Closure>),
    Continue,
}

/// Drives the authorization of one session on the media selector
///
/// The first decision goes to a one-shot callback. After a grant, the
/// authorizer is asked again every `reauthorize_interval_ms`; the first
/// denial, or reaching `time_limit_ms`, fires the reauthorization-failed
/// callback. An authorizer that stays silent for longer than the timeout
/// counts as a denial. [`AsyncAuthorize::stop`] discards everything still
/// in flight.
pub struct AsyncAuthorize {
    selector: Arc<Selector>,
    timeout: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl AsyncAuthorize {
    /// Create a driver posting its work on `selector`
    pub fn new(selector: Arc<Selector>, timeout: Duration) -> Self {
        Self {
            selector,
            timeout,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Start authorizing `req`
    ///
    /// Anything from a previous start is cancelled.
    pub fn start(
        &self,
        authorizer: Arc<dyn Authorizer>,
        req: AuthorizerRequest,
        on_first: FirstDecision,
        on_reauth_failed: Closure,
    ) {
        let generation = {
            let mut st = self.inner.lock();
            st.shutdown();
            st.authorizer = Some(authorizer);
            st.req = req;
            st.started_at = Some(Instant::now());
            st.on_first = Some(on_first);
            st.on_reauth_failed = Some(on_reauth_failed);
            st.generation
        };
        Self::request(&self.selector, &self.inner, self.timeout, generation);
    }

    /// Cancel pending work; late replies are ignored
    pub fn stop(&self) {
        self.inner.lock().shutdown();
    }

    /// Whether a decision or a reauthorization is still pending
    pub fn is_active(&self) -> bool {
        self.inner.lock().authorizer.is_some()
    }

    fn request(selector: &Arc<Selector>, inner: &Arc<Mutex<Inner>>, timeout: Duration, generation: u64) {
        let (authorizer, req, attempt) = {
            let mut st = inner.lock();
            if st.generation != generation {
                return;
            }
            let Some(authorizer) = st.authorizer.clone() else {
                return;
            };
            st.attempt += 1;
            st.awaiting = true;
            st.req.action_performed_ms = st
                .started_at
                .map_or(0, |t| t.elapsed().as_millis() as i64);
            let attempt = st.attempt;

            let (sel, inn) = (Arc::clone(selector), Arc::clone(inner));
            st.timeout_timer = Some(selector.run_after(timeout, move || {
                Self::completed(&sel, &inn, timeout, generation, attempt, None)
            }));
            (authorizer, st.req.clone(), attempt)
        };

        let (sel, inn) = (Arc::clone(selector), Arc::clone(inner));
        authorizer.authorize(
            &req,
            Box::new(move |reply| {
                let target = Arc::clone(&sel);
                target.run_in_select_loop(move || {
                    Self::completed(&sel, &inn, timeout, generation, attempt, Some(reply))
                });
            }),
        );
    }

    fn completed(
        selector: &Arc<Selector>,
        inner: &Arc<Mutex<Inner>>,
        timeout: Duration,
        generation: u64,
        attempt: u64,
        reply: Option<AuthorizerReply>,
    ) {
        let outcome = {
            let mut st = inner.lock();
            if st.generation != generation || st.attempt != attempt || !st.awaiting {
                tracing::trace!(generation = generation, attempt = attempt, "Discarding stale authorization reply");
                return;
            }
            st.awaiting = false;
            if let Some(timer) = st.timeout_timer.take() {
                timer.abort();
            }
            let reply = reply.unwrap_or_else(|| {
                tracing::warn!(resource = %st.req.resource, "Authorization timed out");
                AuthorizerReply::deny()
            });

            if reply.allowed && reply.reauthorize_interval_ms > 0 {
                let (sel, inn) = (Arc::clone(selector), Arc::clone(inner));
                st.reauth_timer = Some(selector.run_after(
                    Duration::from_millis(u64::from(reply.reauthorize_interval_ms)),
                    move || Self::request(&sel, &inn, timeout, generation),
                ));
            }

            match st.on_first.take() {
                Some(first) => {
                    if reply.allowed && reply.time_limit_ms > 0 {
                        let inn = Arc::clone(inner);
                        st.limit_timer = Some(selector.run_after(
                            Duration::from_millis(u64::from(reply.time_limit_ms)),
                            move || Self::expired(&inn, generation),
                        ));
                    }
                    if !reply.allowed {
                        st.shutdown();
                    }
                    Outcome::First(first, reply.allowed)
                }
                None if reply.allowed => Outcome::Continue,
                None => {
                    let failed = st.on_reauth_failed.take();
                    st.shutdown();
                    Outcome::ReauthFailed(failed)
                }
            }
        };

        match outcome {
            Outcome::First(first, allowed) => first(allowed),
            Outcome::ReauthFailed(Some(failed)) => {
                tracing::info!("Reauthorization failed");
                failed();
            }
            Outcome::ReauthFailed(None) | Outcome::Continue => {}
        }
    }

    fn expired(inner: &Arc<Mutex<Inner>>, generation: u64) {
        let failed = {
            let mut st = inner.lock();
            if st.generation != generation {
                return;
            }
            let failed = st.on_reauth_failed.take();
            st.shutdown();
            failed
        };
        if let Some(failed) = failed {
            tracing::info!("Authorization time limit reached");
            failed();
        }
    }
}

impl Drop for AsyncAuthorize {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthCompletion, StaticAuthorizer};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Silent;

    impl Authorizer for Silent {
        fn name(&self) -> &str {
            "silent"
        }
        fn authorize(&self, _req: &AuthorizerRequest, _on_done: AuthCompletion) {}
    }

    /// Grants the first `grants` calls, denies afterwards
    struct Countdown {
        grants: AtomicUsize,
        interval_ms: u32,
    }

    impl Authorizer for Countdown {
        fn name(&self) -> &str {
            "countdown"
        }
        fn authorize(&self, _req: &AuthorizerRequest, on_done: AuthCompletion) {
            let left = self.grants.load(Ordering::SeqCst);
            if left > 0 {
                self.grants.store(left - 1, Ordering::SeqCst);
            }
            on_done(AuthorizerReply {
                allowed: left > 0,
                reauthorize_interval_ms: self.interval_ms,
                time_limit_ms: 0,
            });
        }
    }

    fn recorder() -> (FirstDecision, Arc<Mutex<Option<bool>>>) {
        let decision = Arc::new(Mutex::new(None));
        let d = Arc::clone(&decision);
        (Box::new(move |allowed| *d.lock() = Some(allowed)), decision)
    }

    fn flag() -> (Closure, Arc<AtomicBool>) {
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        (Box::new(move || f.store(true, Ordering::SeqCst)), fired)
    }

    #[test]
    fn test_grant() {
        let selector = Selector::spawn("media").unwrap();
        let auth = AsyncAuthorize::new(Arc::clone(&selector), Duration::from_secs(1));
        let (first, decision) = recorder();
        let (failed, _) = flag();
        let authorizer = Arc::new(StaticAuthorizer::new("s").token("ok"));
        let req = AuthorizerRequest {
            token: "ok".into(),
            ..Default::default()
        };
        auth.start(authorizer, req, first, failed);
        selector.run_and_wait(|| ()).unwrap();
        assert_eq!(*decision.lock(), Some(true));
        selector.stop_and_join();
    }

    #[test]
    fn test_timeout_is_denial() {
        let selector = Selector::spawn("media").unwrap();
        let auth = AsyncAuthorize::new(Arc::clone(&selector), Duration::from_millis(20));
        let (first, decision) = recorder();
        let (failed, _) = flag();
        auth.start(Arc::new(Silent), AuthorizerRequest::default(), first, failed);

        std::thread::sleep(Duration::from_millis(100));
        selector.run_and_wait(|| ()).unwrap();
        assert_eq!(*decision.lock(), Some(false));
        assert!(!auth.is_active());
        selector.stop_and_join();
    }

    #[test]
    fn test_stop_discards_reply() {
        let selector = Selector::spawn("media").unwrap();
        let auth = AsyncAuthorize::new(Arc::clone(&selector), Duration::from_millis(20));
        let (first, decision) = recorder();
        let (failed, _) = flag();
        auth.start(Arc::new(Silent), AuthorizerRequest::default(), first, failed);
        auth.stop();

        std::thread::sleep(Duration::from_millis(80));
        selector.run_and_wait(|| ()).unwrap();
        assert_eq!(*decision.lock(), None);
        selector.stop_and_join();
    }

    #[test]
    fn test_reauthorization_failure() {
        let selector = Selector::spawn("media").unwrap();
        let auth = AsyncAuthorize::new(Arc::clone(&selector), Duration::from_secs(1));
        let (first, decision) = recorder();
        let (failed, fired) = flag();
        let authorizer = Arc::new(Countdown {
            grants: AtomicUsize::new(2),
            interval_ms: 10,
        });
        auth.start(authorizer, AuthorizerRequest::default(), first, failed);

        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*decision.lock(), Some(true));
        assert!(fired.load(Ordering::SeqCst));
        assert!(!auth.is_active());
        selector.stop_and_join();
    }

    #[test]
    fn test_time_limit() {
        let selector = Selector::spawn("media").unwrap();
        let auth = AsyncAuthorize::new(Arc::clone(&selector), Duration::from_secs(1));
        let (first, decision) = recorder();
        let (failed, fired) = flag();
        let authorizer = Arc::new(StaticAuthorizer::new("s").token("ok").time_limit_ms(30));
        let req = AuthorizerRequest {
            token: "ok".into(),
            ..Default::default()
        };
        auth.start(authorizer, req, first, failed);

        std::thread::sleep(Duration::from_millis(120));
        selector.run_and_wait(|| ()).unwrap();
        assert_eq!(*decision.lock(), Some(true));
        assert!(fired.load(Ordering::SeqCst));
        selector.stop_and_join();
    }
}
