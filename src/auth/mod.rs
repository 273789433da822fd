//! Authorization of play requests
//!
//! An [`Authorizer`] answers asynchronously through a one-shot completion;
//! [`AsyncAuthorize`] drives one session's authorization on the media
//! selector (timeout, periodic reauthorization, time limit, cancellation).

mod session;

pub use session::AsyncAuthorize;

use std::collections::{HashMap, HashSet};

pub use crate::request::AuthorizerRequest;

/// Answer of an authorizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthorizerReply {
    /// Access granted
    pub allowed: bool,
    /// Ask again after this long (0 = never)
    pub reauthorize_interval_ms: u32,
    /// Access expires after this long (0 = never)
    pub time_limit_ms: u32,
}

impl AuthorizerReply {
    /// Plain grant
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Default::default()
        }
    }

    /// Plain denial
    pub fn deny() -> Self {
        Self::default()
    }
}

/// One-shot reply channel of an authorizer
pub type AuthCompletion = Box<dyn FnOnce(AuthorizerReply) + Send + 'static>;

/// Decides whether a request may proceed
///
/// Implementations may answer on any thread, at most once per call.
pub trait Authorizer: Send + Sync {
    /// Authorizer name
    fn name(&self) -> &str;

    /// Decide on `req`; `on_done` receives the answer
    fn authorize(&self, req: &AuthorizerRequest, on_done: AuthCompletion);
}

/// Authorizer with a fixed set of users and tokens
///
/// Answers synchronously. Every grant carries the configured
/// reauthorization interval and time limit.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    name: String,
    users: HashMap<String, String>,
    tokens: HashSet<String>,
    reauthorize_interval_ms: u32,
    time_limit_ms: u32,
}

impl StaticAuthorizer {
    /// Create an authorizer that denies everybody
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Accept `user` with `passwd`
    pub fn user(mut self, user: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.users.insert(user.into(), passwd.into());
        self
    }

    /// Accept `token`
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.tokens.insert(token.into());
        self
    }

    /// Reauthorize grants after `ms`
    pub fn reauthorize_interval_ms(mut self, ms: u32) -> Self {
        self.reauthorize_interval_ms = ms;
        self
    }

    /// Expire grants after `ms`
    pub fn time_limit_ms(mut self, ms: u32) -> Self {
        self.time_limit_ms = ms;
        self
    }

    /// Revoke a token; later reauthorizations with it fail
    pub fn revoke_token(&mut self, token: &str) {
        self.tokens.remove(token);
    }

    fn check(&self, req: &AuthorizerRequest) -> bool {
        if !req.token.is_empty() && self.tokens.contains(&req.token) {
            return true;
        }
        !req.user.is_empty() && self.users.get(&req.user) == Some(&req.passwd)
    }
}

impl Authorizer for StaticAuthorizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorize(&self, req: &AuthorizerRequest, on_done: AuthCompletion) {
        let allowed = self.check(req);
        tracing::debug!(
            authorizer = %self.name,
            user = %req.user,
            resource = %req.resource,
            allowed = allowed,
            "Authorization decided"
        );
        on_done(AuthorizerReply {
            allowed,
            reauthorize_interval_ms: if allowed { self.reauthorize_interval_ms } else { 0 },
            time_limit_ms: if allowed { self.time_limit_ms } else { 0 },
        });
    }
}
