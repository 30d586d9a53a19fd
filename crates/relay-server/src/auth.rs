//! Session tokens issued at login and resolved on every later request.

use axum::http::{header, HeaderMap};
use dashmap::DashMap;
use relay_core::{Identity, RelayError, SessionToken};
use tracing::debug;

/// In-memory token table. Tokens do not survive a restart; clients log in
/// again.
#[derive(Default)]
pub struct SessionTokens {
    tokens: DashMap<SessionToken, Identity>,
}

impl SessionTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh token bound to `identity`.
    pub fn issue(&self, identity: Identity) -> SessionToken {
        let token = SessionToken::new();
        debug!(author = %identity, "issued session token");
        let _ = self.tokens.insert(token.clone(), identity);
        token
    }

    pub fn resolve(&self, raw: &str) -> Result<Identity, RelayError> {
        self.tokens
            .get(&SessionToken::from_raw(raw))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RelayError::AuthFailure("invalid or expired session token".into()))
    }

    /// Returns whether the token was live.
    pub fn revoke(&self, raw: &str) -> bool {
        self.tokens.remove(&SessionToken::from_raw(raw)).is_some()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
