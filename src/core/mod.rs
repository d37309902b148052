//! Execution pipeline: the per-invocation records, the interceptor chain,
//! schema validation, and the engine that ties them to the registry.

pub mod chain;
pub mod context;
pub mod engine;
pub mod schema;

pub use chain::{ExecutionChain, Interceptor};
pub use context::{CallerInfo, ExecutionContext, ExecutionRequest, ExecutionResponse};
pub use engine::ExecutionEngine;
pub use schema::{SchemaInterceptor, SchemaValidator};
