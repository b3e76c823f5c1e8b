//! Stomplink Core Library
//!
//! Framework-independent types for the pedal control plane: the wire
//! protocol shared by relay server and remote proxies, the capability-table
//! contract injected by the host application, the local event bus, and the
//! connection status machine.
//!
//! # Modules
//!
//! - [`protocol`] - wire messages and JSON-RPC 2.0 types
//! - [`capability`] - the injected action/query surface
//! - [`events`] - local event bus (on/once/remove/emit)
//! - [`status`] - connection status and reconnect backoff
//! - [`error`] - error types

pub mod capability;
pub mod error;
pub mod events;
pub mod protocol;
pub mod status;

// Re-export commonly used types
pub use capability::{CapabilityError, CapabilityRegistry, CapabilityTable};
pub use error::{ProxyError, ServerError};
pub use events::{EventBus, EventCallback, ListenerId};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, WireMessage};
pub use status::{Backoff, ConnectionStatus};
