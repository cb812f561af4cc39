use std::sync::Arc;

use super::principal::Identity;
use super::session::SessionManager;

/// Per-request state handed to every operation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub identity: Option<Identity>,
    pub token: Option<String>,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn anonymous() -> Self { Self::default() }

    pub fn identity(&self) -> Option<&Identity> { self.identity.as_ref() }
}

/// Resolves the caller from a request token. Never fails: anything that does not
/// map to a live session resolves to no identity.
#[derive(Debug, Clone)]
pub struct AuthContext {
    sessions: Arc<SessionManager>,
}

impl AuthContext {
    pub fn new(sessions: Arc<SessionManager>) -> Self { Self { sessions } }

    pub fn resolve(&self, token: &str) -> Option<Identity> {
        let token = token.trim();
        if token.is_empty() { return None; }
        self.sessions.validate(token)
    }

    /// Build the request context from a raw `Authorization` header value. Accepts
    /// `Bearer <token>` or a bare token.
    pub fn context_for(&self, authorization: Option<&str>) -> RequestContext {
        let token = authorization
            .map(|h| h.trim())
            .map(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")).unwrap_or(h).trim())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string());
        let identity = token.as_deref().and_then(|t| self.resolve(t));
        RequestContext {
            identity,
            token,
            request_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }
}
