use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RelayError;

/// Authenticated author identity, as vouched for by the credential gate.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self(username.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted chat message.
///
/// `id` and `created_at` are assigned by the message log at append time and
/// are ordered consistently with each other across the whole log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Wire form delivered to clients and returned by the history query.
    pub fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage {
            author: self.author.clone(),
            body: self.body.clone(),
            created_at: self.created_at,
        }
    }
}

/// `{author, body, created_at}` as broadcast to every live connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl From<ChatMessage> for OutboundMessage {
    fn from(message: ChatMessage) -> Self {
        Self {
            author: message.author,
            body: message.body,
            created_at: message.created_at,
        }
    }
}

/// An inbound submission from a connection or a one-off request.
///
/// `username`/`message` are accepted as aliases for the field names older
/// clients send. Any client timestamp is ignored, and `author` is advisory
/// only: the session identity is what gets persisted.
#[derive(Clone, Debug, Deserialize)]
pub struct Submission {
    #[serde(default, alias = "username")]
    pub author: Option<String>,
    #[serde(alias = "message")]
    pub body: String,
}

impl Submission {
    /// Parse and validate one inbound text unit.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let submission: Self = serde_json::from_str(raw)
            .map_err(|e| RelayError::MalformedInput(e.to_string()))?;
        submission.validate()?;
        Ok(submission)
    }

    /// Reject submissions that carry nothing to say.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.body.trim().is_empty() {
            return Err(RelayError::MalformedInput("body must not be empty".into()));
        }
        Ok(())
    }

    /// Whether the client-claimed author disagrees with the session identity.
    pub fn claims_other_author(&self, identity: &Identity) -> bool {
        self.author
            .as_deref()
            .is_some_and(|claimed| claimed != identity.as_str())
    }
}
