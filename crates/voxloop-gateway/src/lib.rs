//! WebSocket gateway — serves the Voxloop client protocol over axum.

pub mod connection;
pub mod server;
pub mod state;

pub use server::start_gateway;
pub use state::{GatewayState, SessionRegistry};
