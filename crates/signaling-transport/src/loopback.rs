//! In-process relay and transport
//!
//! [`LoopbackRelay`] routes messages between registered identities the way
//! a compliant relay does:
//!
//! - `register` is confirmed with `registered` (plus the identities already
//!   online) and announced to everyone else with `presence-changed`
//! - `invite` is delivered to an online target, or answered with
//!   `call-failed` when the target is offline
//! - `invite-ack`, `offer`, `answer`, `ice-candidate` and `hangup` are
//!   relayed verbatim to the other party of the call
//! - when a connection goes away its identity is announced offline and the
//!   other party of any open call receives `hangup`
//!
//! It also exposes hooks for exercising failure paths: [`LoopbackRelay::sever`]
//! drops a client's link unexpectedly, [`LoopbackRelay::set_reachable`] makes
//! new connection attempts fail, and [`LoopbackRelay::delivered_to`] returns
//! everything the relay delivered to an identity.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::identity::{CallId, IdentityId};
use crate::message::SignalingMessage;
use crate::recovery::RetryConfig;
use crate::transport::{Connector, Link, ReconnectingTransport};

/// Relay transport connected to a [`LoopbackRelay`]
pub type LoopbackTransport = ReconnectingTransport<LoopbackConnector>;

impl LoopbackTransport {
    pub fn new(relay: &LoopbackRelay, retry: RetryConfig) -> Self {
        Self::with_connector(
            LoopbackConnector {
                relay: relay.clone(),
            },
            retry,
        )
    }
}

enum Frame {
    Message(SignalingMessage),
    Reset,
}

struct Connection {
    tx: mpsc::UnboundedSender<Frame>,
    identity: Option<IdentityId>,
}

struct RelayState {
    next_connection: u64,
    connections: HashMap<u64, Connection>,
    calls: HashMap<CallId, (IdentityId, IdentityId)>,
    delivered: Vec<(IdentityId, SignalingMessage)>,
    reachable: bool,
    refuse_registrations: Option<String>,
}

/// In-memory signaling relay shared by any number of loopback transports
#[derive(Clone)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl Default for LoopbackRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackRelay")
            .field("connections", &state.connections.len())
            .field("calls", &state.calls.len())
            .field("reachable", &state.reachable)
            .finish()
    }
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                next_connection: 1,
                connections: HashMap::new(),
                calls: HashMap::new(),
                delivered: Vec::new(),
                reachable: true,
                refuse_registrations: None,
            })),
        }
    }

    /// Identities with a live registered connection, sorted
    pub fn online(&self) -> Vec<IdentityId> {
        let state = self.state.lock();
        let mut online: Vec<IdentityId> = state
            .connections
            .values()
            .filter_map(|c| c.identity.clone())
            .collect();
        online.sort();
        online
    }

    /// Every message the relay delivered to `identity`, in delivery order
    pub fn delivered_to(&self, identity: &IdentityId) -> Vec<SignalingMessage> {
        self.state
            .lock()
            .delivered
            .iter()
            .filter(|(to, _)| to == identity)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Forget the delivery log
    pub fn clear_log(&self) {
        self.state.lock().delivered.clear();
    }

    /// When false, new connection attempts fail; open links are unaffected
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Answer every subsequent `register` with `registration-error{reason}`
    pub fn refuse_registrations(&self, reason: Option<String>) {
        self.state.lock().refuse_registrations = reason;
    }

    /// Drop the link of `identity` as if the network failed.
    ///
    /// Returns false when the identity has no live connection.
    pub fn sever(&self, identity: &IdentityId) -> bool {
        let mut state = self.state.lock();
        let Some(conn_id) = state.connection_of(identity) else {
            return false;
        };
        debug!(identity = %identity, "Severing loopback connection");
        if let Some(conn) = state.connections.get(&conn_id) {
            let _ = conn.tx.send(Frame::Reset);
        }
        state.detach(conn_id);
        true
    }

    fn attach(&self) -> Option<(u64, mpsc::UnboundedReceiver<Frame>)> {
        let mut state = self.state.lock();
        if !state.reachable {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_connection;
        state.next_connection += 1;
        state.connections.insert(id, Connection { tx, identity: None });
        Some((id, rx))
    }

    fn detach(&self, conn_id: u64) {
        self.state.lock().detach(conn_id);
    }

    /// Route one message from connection `conn_id`; false if the connection is gone
    fn route(&self, conn_id: u64, message: SignalingMessage) -> bool {
        let mut state = self.state.lock();
        let Some(sender) = state.connections.get(&conn_id).map(|c| c.identity.clone()) else {
            return false;
        };
        trace!(conn_id, kind = message.kind(), "Relay received message");

        if let SignalingMessage::Register { identity } = &message {
            state.register(conn_id, identity.id.clone());
            return true;
        }

        let Some(sender) = sender else {
            debug!(conn_id, kind = message.kind(), "Ignoring message from unregistered connection");
            return true;
        };

        match message {
            SignalingMessage::Invite { call_id, from, to } => {
                if state.connection_of(&to).is_some() {
                    state.calls.insert(call_id.clone(), (sender, to.clone()));
                    state.deliver(&to, SignalingMessage::Invite { call_id, from, to: to.clone() });
                } else {
                    state.deliver(
                        &sender,
                        SignalingMessage::CallFailed {
                            call_id,
                            reason: "peer offline".to_string(),
                        },
                    );
                }
            }
            SignalingMessage::InviteAck { ref call_id, accepted, .. } => {
                let call_id = call_id.clone();
                if let Some(peer) = state.counterpart(&call_id, &sender) {
                    state.deliver(&peer, message);
                }
                if !accepted {
                    state.calls.remove(&call_id);
                }
            }
            SignalingMessage::Hangup { ref call_id } => {
                let call_id = call_id.clone();
                if let Some(peer) = state.counterpart(&call_id, &sender) {
                    state.deliver(&peer, message);
                }
                state.calls.remove(&call_id);
            }
            SignalingMessage::Offer { ref call_id, .. }
            | SignalingMessage::Answer { ref call_id, .. }
            | SignalingMessage::IceCandidate { ref call_id, .. } => {
                let call_id = call_id.clone();
                match state.counterpart(&call_id, &sender) {
                    Some(peer) => state.deliver(&peer, message),
                    None => debug!(call_id = %call_id, "Relay dropping message for unknown call"),
                }
            }
            other => debug!(kind = other.kind(), "Relay ignoring client message"),
        }
        true
    }
}

impl RelayState {
    fn connection_of(&self, identity: &IdentityId) -> Option<u64> {
        self.connections
            .iter()
            .find(|(_, c)| c.identity.as_ref() == Some(identity))
            .map(|(id, _)| *id)
    }

    fn counterpart(&self, call_id: &CallId, sender: &IdentityId) -> Option<IdentityId> {
        let (a, b) = self.calls.get(call_id)?;
        if a == sender {
            Some(b.clone())
        } else if b == sender {
            Some(a.clone())
        } else {
            None
        }
    }

    fn deliver(&mut self, to: &IdentityId, message: SignalingMessage) {
        let Some(conn_id) = self.connection_of(to) else {
            return;
        };
        if let Some(conn) = self.connections.get(&conn_id) {
            if conn.tx.send(Frame::Message(message.clone())).is_ok() {
                self.delivered.push((to.clone(), message));
            }
        }
    }

    fn broadcast_presence(&mut self, identity: &IdentityId, online: bool) {
        let others: Vec<IdentityId> = self
            .connections
            .values()
            .filter_map(|c| c.identity.clone())
            .filter(|id| id != identity)
            .collect();
        for other in others {
            self.deliver(
                &other,
                SignalingMessage::PresenceChanged {
                    identity_id: identity.clone(),
                    online,
                },
            );
        }
    }

    fn register(&mut self, conn_id: u64, identity: IdentityId) {
        if let Some(reason) = self.refuse_registrations.clone() {
            if let Some(conn) = self.connections.get(&conn_id) {
                let _ = conn.tx.send(Frame::Message(SignalingMessage::RegistrationError { reason }));
            }
            return;
        }

        // a newer connection takes the identity over
        if let Some(previous) = self.connection_of(&identity) {
            if previous != conn_id {
                if let Some(conn) = self.connections.get_mut(&previous) {
                    conn.identity = None;
                }
            }
        }

        let already_online = self
            .connections
            .get(&conn_id)
            .and_then(|c| c.identity.as_ref())
            == Some(&identity);
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.identity = Some(identity.clone());
        }

        let mut online: Vec<IdentityId> = self
            .connections
            .values()
            .filter_map(|c| c.identity.clone())
            .filter(|id| *id != identity)
            .collect();
        online.sort();

        self.deliver(
            &identity,
            SignalingMessage::Registered {
                identity_id: identity.clone(),
                online,
            },
        );
        if !already_online {
            self.broadcast_presence(&identity, true);
        }
    }

    fn detach(&mut self, conn_id: u64) {
        let Some(conn) = self.connections.remove(&conn_id) else {
            return;
        };
        let Some(identity) = conn.identity else {
            return;
        };

        let orphaned: Vec<(CallId, IdentityId)> = self
            .calls
            .iter()
            .filter_map(|(call_id, (a, b))| {
                if *a == identity {
                    Some((call_id.clone(), b.clone()))
                } else if *b == identity {
                    Some((call_id.clone(), a.clone()))
                } else {
                    None
                }
            })
            .collect();
        for (call_id, peer) in orphaned {
            self.calls.remove(&call_id);
            self.deliver(&peer, SignalingMessage::Hangup { call_id });
        }

        self.broadcast_presence(&identity, false);
    }
}

/// Opens links to a [`LoopbackRelay`]
pub struct LoopbackConnector {
    relay: LoopbackRelay,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self) -> std::result::Result<Box<dyn Link>, String> {
        match self.relay.attach() {
            Some((conn_id, rx)) => Ok(Box::new(LoopbackLink {
                relay: self.relay.clone(),
                conn_id,
                rx,
            })),
            None => Err("relay unreachable".to_string()),
        }
    }

    fn endpoint(&self) -> String {
        "loopback".to_string()
    }
}

struct LoopbackLink {
    relay: LoopbackRelay,
    conn_id: u64,
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl Link for LoopbackLink {
    async fn recv(&mut self) -> std::result::Result<Option<SignalingMessage>, String> {
        match self.rx.recv().await {
            Some(Frame::Message(message)) => Ok(Some(message)),
            Some(Frame::Reset) => Err("connection reset".to_string()),
            None => Ok(None),
        }
    }

    async fn send(&mut self, message: SignalingMessage) -> std::result::Result<(), String> {
        if self.relay.route(self.conn_id, message) {
            Ok(())
        } else {
            Err("connection reset".to_string())
        }
    }

    async fn close(&mut self) {
        self.relay.detach(self.conn_id);
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.relay.detach(self.conn_id);
    }
}
