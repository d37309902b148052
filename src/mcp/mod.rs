//! Model Context Protocol (MCP) server side.
//!
//! A stateless-per-request JSON-RPC 2.0 surface over HTTP that exposes the
//! registry's Context and Action capabilities as MCP tools. Session state
//! (protocol negotiation and the initialize handshake) is kept by
//! [`McpSessionManager`], keyed by the transport's session header.

pub mod handler;
pub mod jsonrpc;
pub mod lifecycle;

pub use handler::{McpHandler, PAGE_SIZE, PROTOCOL_VERSION};
pub use jsonrpc::{JsonRpcError, JsonRpcErrorCode, JsonRpcRequest};
pub use lifecycle::{McpSessionManager, SessionInfo, SessionState};
