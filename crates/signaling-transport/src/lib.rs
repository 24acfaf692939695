//! Signaling transport layer for the callwire stack
//!
//! This crate owns everything that travels over the relay channel but none of
//! the call semantics: identities and call ids, the JSON wire format, typed
//! event subscriptions, and transports that keep a full-duplex link to the
//! relay alive with bounded reconnection.
//!
//! Two transports are provided:
//!
//! - [`WebSocketTransport`] (feature `ws`, on by default) talks to a relay
//!   over WebSocket.
//! - [`LoopbackTransport`] talks to an in-process [`LoopbackRelay`]; it is
//!   what the client-core scenario tests run against.

pub mod error;
pub mod identity;
pub mod message;
pub mod recovery;
pub mod subscription;
pub mod transport;
pub mod loopback;

// Internal modules
#[cfg(test)]
mod tests;

// Re-export commonly used types and functions
pub use error::{Error, Result};
pub use identity::{CallId, Identity, IdentityId, Role};
pub use message::{IceCandidate, RejectReason, SignalingMessage};
pub use recovery::RetryConfig;
pub use subscription::{Subscribers, Subscription};
pub use transport::{
    CloseReason, ConnectionState, ReconnectingTransport, SignalingTransport, TransportConfig,
    TransportEvent,
};
pub use loopback::{LoopbackRelay, LoopbackTransport};
#[cfg(feature = "ws")]
pub use transport::ws::WebSocketTransport;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        CallId, ConnectionState, Error, Identity, IdentityId, Result, Role, SignalingMessage,
        SignalingTransport, Subscription, TransportEvent,
    };
}
