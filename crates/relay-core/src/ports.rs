//! Seams between the fan-out core and its storage collaborators.

use secrecy::SecretString;

use crate::errors::RelayError;
use crate::messages::{ChatMessage, Identity};

/// Durable, totally ordered log of chat messages.
///
/// Implementations must serialize `append` so that ids and timestamps are
/// assigned in one global order, with `created_at` never moving backwards.
pub trait MessageLog: Send + Sync {
    /// Persist one message. Fails with `StoreUnavailable` when the write
    /// did not reach durable storage.
    fn append(&self, author: &str, body: &str) -> Result<ChatMessage, RelayError>;

    /// Every message, ordered by `created_at` then `id`, read fresh from
    /// durable state.
    fn list_all(&self) -> Result<Vec<ChatMessage>, RelayError>;

    /// Number of persisted messages.
    fn count(&self) -> Result<u64, RelayError>;
}

/// Registration and authentication against stored credentials.
pub trait CredentialGate: Send + Sync {
    /// Create a credential record. Fails with `AlreadyExists` if the
    /// username is taken.
    fn register(&self, username: &str, password: &SecretString) -> Result<(), RelayError>;

    /// Verify a username/password pair. Fails with `AuthFailure` for an
    /// unknown user or a wrong password.
    fn authenticate(&self, username: &str, password: &SecretString)
        -> Result<Identity, RelayError>;
}
