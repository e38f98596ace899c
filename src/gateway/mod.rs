//! Gateway host process surface.

pub mod server;

pub use server::{create_router, GatewayServer, ServerState};
