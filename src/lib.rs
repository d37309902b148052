//! # MCP Agent
//!
//! Exposes host operations ("capabilities") to remote orchestrators.
//!
//! Host modules register [`capabilities::CapabilityProvider`]s with the
//! [`capabilities::CapabilityRegistry`]. Every invocation goes through the
//! [`core::ExecutionEngine`], whose interceptor chain enforces permissions,
//! validates parameters against the declared schema and writes an audit
//! trail. Two transports front the engine:
//!
//! - the gateway protocol ([`gateway`]): a persistent, authenticated
//!   WebSocket channel with heartbeats and request/response correlation
//! - the MCP JSON-RPC transport ([`mcp`], served by [`server`]): capabilities
//!   are listed and called as MCP tools

pub mod audit;
pub mod capabilities;
pub mod config;
pub mod core;
pub mod error;
pub mod gateway;
pub mod mcp;
pub mod policy;
pub mod server;

pub use capabilities::{CapabilityProvider, CapabilityRegistry};
pub use config::AgentConfig;
pub use core::ExecutionEngine;
pub use error::{CapabilityError, ErrorCode};

/// Crate version, reported on `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
