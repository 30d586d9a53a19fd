pub mod errors;
pub mod ids;
pub mod messages;
pub mod ports;

pub use errors::RelayError;
pub use ids::{ConnectionId, SessionToken};
pub use messages::{ChatMessage, Identity, OutboundMessage, Submission};
pub use ports::{CredentialGate, MessageLog};
