//! Call session orchestration for two-party audio/video calls
//!
//! This crate turns a logical "call" intent into a live peer connection. It
//! reconciles three independently evolving state machines (relay
//! connectivity, call lifecycle and peer negotiation) into one consistent
//! session per client.
//!
//! # Architecture
//!
//! ```text
//! CallClient (handle) ──commands──▶ engine (single event loop)
//!                                      │
//!          ┌───────────────────────────┼──────────────────────────┐
//!          ▼                           ▼                          ▼
//!   PresenceRegistry           CallSession (pure)        NegotiationEngine
//!          │                                                      │
//!          ▼                                                      ▼
//!   SignalingTransport (callwire-signaling-transport)      PeerLink + LocalMedia
//! ```
//!
//! Every user action, relay message, timer and media result is serialized
//! through one queue, so "user clicked hang up" and "peer sent hangup" can
//! never race. Async continuations carry the generation of the call that
//! started them and are ignored once that call is gone.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use callwire_client_core::{ClientBuilder, ClientEvent};
//! use callwire_client_core::sim::{SimulatedMediaCapture, SimulatedPeerLinkFactory};
//! use callwire_signaling_transport::{Identity, IdentityId, Role};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ClientBuilder::new()
//!     .relay_url("ws://127.0.0.1:9000/signal")
//!     .media_capture(Arc::new(SimulatedMediaCapture::new()))
//!     .peer_links(Arc::new(SimulatedPeerLinkFactory::new()))
//!     .build()
//!     .await?;
//!
//! client.start(Identity::new("pat", "Pat", Role::Initiator)).await?;
//! let mut events = client.subscribe();
//! let call_id = client.place_call(&IdentityId::from("dana")).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::CallEnded { summary } = event {
//!         println!("{} ended: {}", call_id, summary.reason);
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod client;
pub mod directory;
pub mod error;
pub mod events;
pub mod logging;
pub mod media;
pub mod negotiation;
pub mod registration;
pub mod sim;

pub use call::{CallDirection, CallSession, CallState};
pub use client::{CallClient, ClientBuilder, ClientConfig};
pub use directory::{DirectoryEntry, IdentityDirectory, StaticDirectory};
pub use error::{ClientError, ClientResult};
pub use events::{
    CallStatusInfo, CallSummary, ClientEvent, EndReason, EventPriority, IncomingCallInfo,
    SessionSnapshot, format_duration,
};
pub use media::{LocalMedia, MediaCapture, MediaConstraints, MediaError, MediaKind, RemoteMedia};
pub use negotiation::{
    LinkConfig, LinkState, NegotiationEngine, NegotiationError, NegotiationEvent,
    NegotiationRole, NegotiationSignal, NegotiationState, PeerLink, PeerLinkEvent,
    PeerLinkFactory, SessionDescription,
};
#[cfg(feature = "webrtc")]
pub use negotiation::WebRtcPeerLinkFactory;
pub use registration::{PresenceEvent, PresenceRegistry, PresenceSet, RegistrationStatus};

// Transport types callers need alongside the client
pub use callwire_signaling_transport::{
    CallId, Identity, IdentityId, Role, SignalingTransport, Subscription,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
