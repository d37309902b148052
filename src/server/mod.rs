//! HTTP surfaces of the agent.
//!
//! - the MCP JSON-RPC transport (`app_router`), bearer-token protected
//! - the gateway WebSocket endpoint (`gateway_router`)

pub mod routes;
pub mod ws;

pub use routes::{app_router, gateway_router, AppState};
