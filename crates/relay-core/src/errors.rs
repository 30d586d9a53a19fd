/// Error taxonomy for the relay.
///
/// Only `StoreUnavailable` is ever reported back to a publisher as a
/// server-side failure. `DeliveryFailed` stays inside the broadcaster and
/// `MalformedInput` never closes a connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("delivery to {connection} failed: {reason}")]
    DeliveryFailed { connection: String, reason: String },
}

impl RelayError {
    /// Short classification string for logs and error bodies.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthFailure(_) => "auth_failure",
            Self::AlreadyExists(_) => "already_exists",
            Self::MalformedInput(_) => "malformed_input",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::DeliveryFailed { .. } => "delivery_failed",
        }
    }

    /// Upper-case code used in wire error objects.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthFailure(_) => "AUTH_FAILURE",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::MalformedInput(_) => "MALFORMED_INPUT",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::DeliveryFailed { .. } => "DELIVERY_FAILED",
        }
    }

    /// Errors caused by the request itself rather than by the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::AuthFailure(_) | Self::AlreadyExists(_) | Self::MalformedInput(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_classification() {
        assert!(RelayError::AuthFailure("bad password".into()).is_client_error());
        assert!(RelayError::AlreadyExists("alice".into()).is_client_error());
        assert!(RelayError::MalformedInput("eof".into()).is_client_error());
        assert!(!RelayError::StoreUnavailable("disk full".into()).is_client_error());
        assert!(!RelayError::DeliveryFailed {
            connection: "conn_1".into(),
            reason: "closed".into(),
        }
        .is_client_error());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(RelayError::AuthFailure(String::new()).error_kind(), "auth_failure");
        assert_eq!(
            RelayError::StoreUnavailable(String::new()).error_kind(),
            "store_unavailable"
        );
        assert_eq!(RelayError::MalformedInput(String::new()).code(), "MALFORMED_INPUT");
    }

    #[test]
    fn display_includes_detail() {
        let err = RelayError::DeliveryFailed {
            connection: "conn_x".into(),
            reason: "outbox full".into(),
        };
        assert_eq!(err.to_string(), "delivery to conn_x failed: outbox full");
    }
}
