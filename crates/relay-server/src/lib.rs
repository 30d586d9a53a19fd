//! WebSocket chat relay server: sessions, fan-out, and the HTTP surface.

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod registry;
pub mod server;
pub mod session;

pub use api::ApiError;
pub use auth::SessionTokens;
pub use broadcast::{BroadcastStats, Broadcaster};
pub use config::ServerConfig;
pub use registry::{Connection, ConnectionRegistry};
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{write_outbound, SessionPump, SessionState, WriterConfig};
