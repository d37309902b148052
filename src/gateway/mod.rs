//! Gateway protocol: the persistent WebSocket channel external gateways use to
//! authenticate, keep alive, and invoke capabilities.

pub mod auth;
pub mod codec;
pub mod dispatcher;
pub mod heartbeat;
pub mod message;
pub mod session;
pub mod session_manager;

pub use auth::{AuthHandler, AuthResult};
pub use codec::{CodecError, MessageCodec};
pub use dispatcher::GatewayDispatcher;
pub use heartbeat::{DefaultHostStatus, HeartbeatHandler, HostStatusProvider};
pub use message::{Message, Payload};
pub use session::{Connection, GatewaySession, SessionError};
pub use session_manager::{SessionManager, SessionManagerConfig, SessionStats};
