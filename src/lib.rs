//! Realtime chat and room presence core for the nightlife app.
//!
//! Connections authenticate once at the handshake, join named rooms, and
//! exchange JSON events. Messages are persisted before they are broadcast;
//! room member counts are periodically reconciled against the live
//! connection table.

pub mod auth;
pub mod config;
pub mod error;
pub mod fanout;
pub mod format;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod utils {
    pub mod jwt;
}

pub use auth::{Authenticator, Identity, Role};
pub use config::Config;
pub use error::{AppErr, ChatError};
pub use session::{ChatCore, LiveStatus};
