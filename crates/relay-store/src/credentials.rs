use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use chrono::Utc;
use rusqlite::OptionalExtension;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, instrument};

use relay_core::{CredentialGate, Identity, RelayError};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const MAX_USERNAME_LEN: usize = 64;

/// Credential records in the `users` table, hashed with Argon2id.
pub struct CredentialStore {
    db: Database,
    hasher: Argon2<'static>,
}

impl CredentialStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            hasher: Argon2::default(),
        }
    }

    /// Use explicit Argon2id cost parameters. Stored hashes carry their own
    /// parameters, so existing records still verify after a change.
    pub fn with_params(db: Database, params: Params) -> Self {
        Self {
            db,
            hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Create a credential record.
    #[instrument(skip(self, password), fields(username = %username))]
    pub fn create_user(&self, username: &str, password: &SecretString) -> Result<(), StoreError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .hasher
            .hash_password(password.expose_secret().as_bytes(), &salt)?
            .to_string();

        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(username) DO NOTHING",
                rusqlite::params![username, hash, row_helpers::format_timestamp(&Utc::now())],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("user {username}")));
            }
            Ok(())
        })?;

        info!("user registered");
        Ok(())
    }

    /// Stored password hash for a username, if the user exists.
    pub fn password_hash(&self, username: &str) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT password_hash FROM users WHERE username = ?1",
                [username],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    /// Check a password against the stored hash. `Ok(false)` for an unknown
    /// user or a mismatch.
    #[instrument(skip(self, password), fields(username = %username))]
    pub fn verify(&self, username: &str, password: &SecretString) -> Result<bool, StoreError> {
        let Some(stored) = self.password_hash(username)? else {
            return Ok(false);
        };
        let parsed = PasswordHash::new(&stored).map_err(|e| StoreError::CorruptRow {
            table: "users",
            column: "password_hash",
            detail: e.to_string(),
        })?;
        Ok(self
            .hasher
            .verify_password(password.expose_secret().as_bytes(), &parsed)
            .is_ok())
    }
}

impl CredentialGate for CredentialStore {
    fn register(&self, username: &str, password: &SecretString) -> Result<(), RelayError> {
        validate_username(username)?;
        if password.expose_secret().is_empty() {
            return Err(RelayError::MalformedInput("password must not be empty".into()));
        }
        Ok(self.create_user(username, password)?)
    }

    fn authenticate(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<Identity, RelayError> {
        if self.verify(username, password)? {
            Ok(Identity::new(username))
        } else {
            Err(RelayError::AuthFailure("invalid username or password".into()))
        }
    }
}

fn validate_username(username: &str) -> Result<(), RelayError> {
    if username.trim().is_empty() {
        return Err(RelayError::MalformedInput("username must not be empty".into()));
    }
    if username != username.trim() {
        return Err(RelayError::MalformedInput(
            "username must not start or end with whitespace".into(),
        ));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(RelayError::MalformedInput(format!(
            "username longer than {MAX_USERNAME_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        // Minimum cost keeps the tests fast.
        let params = Params::new(Params::MIN_M_COST, 1, 1, None).unwrap();
        CredentialStore::with_params(Database::in_memory().unwrap(), params)
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn register_then_authenticate() {
        let gate = store();
        gate.register("alice", &secret("hunter2")).unwrap();

        let identity = gate.authenticate("alice", &secret("hunter2")).unwrap();
        assert_eq!(identity, Identity::new("alice"));
    }

    #[test]
    fn duplicate_username_already_exists() {
        let gate = store();
        gate.register("alice", &secret("one")).unwrap();

        let err = gate.register("alice", &secret("two")).unwrap_err();
        assert!(matches!(err, RelayError::AlreadyExists(_)));

        // The original password still works.
        assert!(gate.authenticate("alice", &secret("one")).is_ok());
    }

    #[test]
    fn wrong_password_is_auth_failure() {
        let gate = store();
        gate.register("alice", &secret("right")).unwrap();

        let err = gate.authenticate("alice", &secret("wrong")).unwrap_err();
        assert!(matches!(err, RelayError::AuthFailure(_)));
    }

    #[test]
    fn unknown_user_is_auth_failure() {
        let gate = store();
        let err = gate.authenticate("nobody", &secret("x")).unwrap_err();
        assert!(matches!(err, RelayError::AuthFailure(_)));
    }

    #[test]
    fn password_is_not_stored_in_clear() {
        let gate = store();
        gate.register("alice", &secret("plaintext")).unwrap();

        let stored = gate.password_hash("alice").unwrap().unwrap();
        assert!(stored.starts_with("$argon2id$"), "got: {stored}");
        assert!(!stored.contains("plaintext"));
    }

    #[test]
    fn same_password_gets_distinct_salts() {
        let gate = store();
        gate.register("alice", &secret("same")).unwrap();
        gate.register("bob", &secret("same")).unwrap();
        assert_ne!(
            gate.password_hash("alice").unwrap(),
            gate.password_hash("bob").unwrap()
        );
    }

    #[test]
    fn invalid_registrations_are_malformed() {
        let gate = store();
        for (user, pass) in [("", "pw"), ("  ", "pw"), (" padded", "pw"), ("alice", "")] {
            let err = gate.register(user, &secret(pass)).unwrap_err();
            assert!(matches!(err, RelayError::MalformedInput(_)), "{user:?}/{pass:?}");
        }
        let long = "x".repeat(MAX_USERNAME_LEN + 1);
        assert!(matches!(
            gate.register(&long, &secret("pw")),
            Err(RelayError::MalformedInput(_))
        ));
    }
}
