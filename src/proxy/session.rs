use async_trait::async_trait;
use http::HeaderMap;

// ─────────────────────────────────────────────────────────────────────────────
// Trait: SessionResolver
// ─────────────────────────────────────────────────────────────────────────────

/// Looks up the caller's session and yields the bearer token to forward.
///
/// Session issuance lives outside the proxy; implementations only translate
/// an inbound request into an already-issued token.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn bearer_token(&self, headers: &HeaderMap) -> Option<String>;
}

/// Never yields a token. Requests reach origin with whatever they carried.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSession;

#[async_trait]
impl SessionResolver for NoSession {
    async fn bearer_token(&self, _headers: &HeaderMap) -> Option<String> {
        None
    }
}

/// Attaches one configured token to every request (`SESSION_BEARER_TOKEN`).
#[derive(Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken").field("token", &"<redacted>").finish()
    }
}

#[async_trait]
impl SessionResolver for StaticToken {
    async fn bearer_token(&self, _headers: &HeaderMap) -> Option<String> {
        Some(self.token.clone())
    }
}
