//! Relay server implementation

pub mod auth;
pub mod pipeline;
pub mod router;
mod server;

pub use auth::{AuthError, Gatekeeper, auth_middleware};
pub use pipeline::{Relay, RelayResponse};
pub use router::{AppState, create_router};
pub use server::Gateway;
