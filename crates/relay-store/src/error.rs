use relay_core::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("password hash error: {0}")]
    Hash(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<argon2::password_hash::Error> for StoreError {
    fn from(e: argon2::password_hash::Error) -> Self {
        StoreError::Hash(e.to_string())
    }
}

/// Anything that goes wrong below the relay is an unavailable store, except a
/// uniqueness conflict, which the caller caused.
impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(what) => RelayError::AlreadyExists(what),
            other => RelayError::StoreUnavailable(other.to_string()),
        }
    }
}
