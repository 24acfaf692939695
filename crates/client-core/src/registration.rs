//! Registration and presence tracking
//!
//! The [`PresenceRegistry`] owns this client's registration with the relay
//! and the relay's view of which remote identities are reachable. It is the
//! single writer of the [`PresenceSet`]; everything else reads snapshots.
//!
//! # Registration lifecycle
//!
//! 1. **Register** - `register(identity)` sends `register` if the link is open,
//!    otherwise it is deferred until the link opens
//! 2. **Confirm** - `registered` from the relay moves the status to `Active`
//!    and seeds the presence set with the relay's snapshot
//! 3. **Reconnect** - when the link drops the presence set is cleared; once it
//!    reopens the registry registers again, once, but only if an identity was
//!    registered before. Sends are keyed to the transport's link epoch, so a
//!    late `Disconnected` for an older link does not undo a `register`
//!    already sent on the newer one
//! 4. **Refusal** - `registration-error` moves the status to `Failed`; no
//!    automatic retry happens until `register` is called again
//!
//! # Presence
//!
//! The presence set changes only in response to relay pushes. An identity in
//! the set has a live relay connection; it may still be busy in another call.
//!
//! ```rust
//! use std::sync::Arc;
//! use callwire_client_core::registration::{PresenceRegistry, RegistrationStatus};
//! use callwire_signaling_transport::{LoopbackRelay, LoopbackTransport, RetryConfig};
//!
//! let relay = LoopbackRelay::new();
//! let transport = Arc::new(LoopbackTransport::new(&relay, RetryConfig::quick()));
//! let registry = PresenceRegistry::new(transport);
//!
//! assert_eq!(registry.status(), RegistrationStatus::Unregistered);
//! assert!(registry.presence().is_empty());
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use callwire_signaling_transport::{
    ConnectionState, Identity, IdentityId, SignalingMessage, SignalingTransport, Subscribers,
    Subscription, TransportEvent,
};

use crate::error::{ClientError, ClientResult};

/// Status of this client's registration with the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationStatus {
    /// No identity registered yet
    Unregistered,
    /// Registration sent or waiting for the link
    Pending,
    /// Confirmed by the relay
    Active,
    /// Refused by the relay
    Failed,
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationStatus::Unregistered => write!(f, "Unregistered"),
            RegistrationStatus::Pending => write!(f, "Pending"),
            RegistrationStatus::Active => write!(f, "Active"),
            RegistrationStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Remote identities currently reachable through the relay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSet {
    online: BTreeSet<IdentityId>,
}

impl PresenceSet {
    pub fn contains(&self, id: &IdentityId) -> bool {
        self.online.contains(id)
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdentityId> {
        self.online.iter()
    }
}

/// Changes published by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    RegistrationConfirmed { identity_id: IdentityId },
    RegistrationFailed { reason: String },
    PresenceChanged { identity_id: IdentityId, online: bool },
    /// The whole set was replaced (snapshot on registration, or cleared when
    /// the link dropped)
    PresenceReset { online: Vec<IdentityId> },
}

#[derive(Debug)]
struct RegistryState {
    identity: Option<Identity>,
    status: RegistrationStatus,
    /// Link epoch the last `register` went out on
    sent_on: Option<u64>,
    presence: PresenceSet,
}

/// Single-writer registration and presence tracker
pub struct PresenceRegistry {
    transport: Arc<dyn SignalingTransport>,
    state: RwLock<RegistryState>,
    events: Subscribers<PresenceEvent>,
}

impl fmt::Debug for PresenceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("PresenceRegistry")
            .field("status", &state.status)
            .field("online", &state.presence.len())
            .finish()
    }
}

impl PresenceRegistry {
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            state: RwLock::new(RegistryState {
                identity: None,
                status: RegistrationStatus::Unregistered,
                sent_on: None,
                presence: PresenceSet::default(),
            }),
            events: Subscribers::new(),
        }
    }

    /// Register `identity` with the relay.
    ///
    /// A no-op while the same identity is registered or its registration is
    /// already in flight. A client registers one identity for its lifetime;
    /// a different identity is refused.
    pub fn register(&self, identity: Identity) -> ClientResult<()> {
        let mut state = self.state.write();
        if let Some(existing) = &state.identity {
            if existing.id != identity.id {
                return Err(ClientError::invalid_state(format!(
                    "already registered as {}",
                    existing.id
                )));
            }
            let in_flight = state.status == RegistrationStatus::Pending && state.sent_on.is_some();
            if state.status == RegistrationStatus::Active || in_flight {
                debug!(identity = %identity.id, status = %state.status, "Register is a no-op");
                return Ok(());
            }
        }

        state.identity = Some(identity);
        state.status = RegistrationStatus::Pending;
        state.sent_on = None;
        if self.transport.connection_state() == ConnectionState::Open {
            self.send_register(&mut state);
        } else {
            debug!("Link not open, registration deferred");
        }
        Ok(())
    }

    /// Apply a transport event; returns the presence events it caused, which
    /// are also published to subscribers
    pub fn handle_transport_event(&self, event: &TransportEvent) -> Vec<PresenceEvent> {
        let mut out = Vec::new();
        {
            let mut state = self.state.write();
            match event {
                TransportEvent::Opened { reconnected, link } => {
                    let retry = state.identity.is_some()
                        && state.status != RegistrationStatus::Failed
                        && state.sent_on.is_none_or(|sent| sent < *link);
                    if retry {
                        info!(reconnected, link, "Link open, registering");
                        state.status = RegistrationStatus::Pending;
                        self.send_register(&mut state);
                    }
                }
                TransportEvent::Disconnected { link, .. } => {
                    // a register already sent on a newer link stands
                    if state.sent_on.is_some_and(|sent| sent <= *link) {
                        state.sent_on = None;
                    }
                    Self::link_lost(&mut state, &mut out);
                }
                TransportEvent::Closed { .. } => {
                    let live = self.transport.connection_state() == ConnectionState::Open
                        && state.sent_on == Some(self.transport.link_epoch());
                    if !live {
                        state.sent_on = None;
                    }
                    Self::link_lost(&mut state, &mut out);
                }
                TransportEvent::ConnectError { .. } => {}
                TransportEvent::Message(message) => self.apply_message(&mut state, message, &mut out),
            }
        }
        for event in &out {
            self.events.publish(event.clone());
        }
        out
    }

    fn link_lost(state: &mut RegistryState, out: &mut Vec<PresenceEvent>) {
        if state.status == RegistrationStatus::Active {
            state.status = RegistrationStatus::Pending;
        }
        if !state.presence.is_empty() {
            state.presence = PresenceSet::default();
            out.push(PresenceEvent::PresenceReset { online: Vec::new() });
        }
    }

    fn apply_message(&self, state: &mut RegistryState, message: &SignalingMessage, out: &mut Vec<PresenceEvent>) {
        let own_id = state.identity.as_ref().map(|i| i.id.clone());
        match message {
            SignalingMessage::Registered { identity_id, online } => {
                if own_id.as_ref() != Some(identity_id) {
                    warn!(identity = %identity_id, "Ignoring confirmation for another identity");
                    return;
                }
                state.status = RegistrationStatus::Active;
                state.presence = PresenceSet {
                    online: online.iter().filter(|id| *id != identity_id).cloned().collect(),
                };
                info!(identity = %identity_id, online = state.presence.len(), "Registration confirmed");
                out.push(PresenceEvent::RegistrationConfirmed {
                    identity_id: identity_id.clone(),
                });
                out.push(PresenceEvent::PresenceReset {
                    online: state.presence.iter().cloned().collect(),
                });
            }
            SignalingMessage::RegistrationError { reason } => {
                if state.identity.is_none() {
                    return;
                }
                warn!(reason = %reason, "Registration rejected");
                state.status = RegistrationStatus::Failed;
                out.push(PresenceEvent::RegistrationFailed { reason: reason.clone() });
            }
            SignalingMessage::PresenceChanged { identity_id, online } => {
                if own_id.as_ref() == Some(identity_id) {
                    return;
                }
                let changed = if *online {
                    state.presence.online.insert(identity_id.clone())
                } else {
                    state.presence.online.remove(identity_id)
                };
                if changed {
                    debug!(identity = %identity_id, online, "Presence changed");
                    out.push(PresenceEvent::PresenceChanged {
                        identity_id: identity_id.clone(),
                        online: *online,
                    });
                }
            }
            _ => {}
        }
    }

    fn send_register(&self, state: &mut RegistryState) {
        let Some(identity) = state.identity.clone() else {
            return;
        };
        let link = self.transport.link_epoch();
        match self.transport.send(SignalingMessage::Register { identity }) {
            Ok(()) => state.sent_on = Some(link),
            Err(e) => warn!("Failed to send register: {}", e),
        }
    }

    pub fn status(&self) -> RegistrationStatus {
        self.state.read().status
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.read().identity.clone()
    }

    /// Snapshot of the presence set
    pub fn presence(&self) -> PresenceSet {
        self.state.read().presence.clone()
    }

    pub fn is_online(&self, id: &IdentityId) -> bool {
        self.state.read().presence.contains(id)
    }

    pub fn subscribe(&self) -> Subscription<PresenceEvent> {
        self.events.subscribe()
    }
}
