pub mod credentials;
pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;

pub use credentials::CredentialStore;
pub use database::Database;
pub use error::StoreError;
pub use messages::MessageRepo;
