//! Shared harness for client-core integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use callwire_client_core::sim::{SimulatedMediaCapture, SimulatedPeerLinkFactory};
use callwire_client_core::{
    CallClient, CallState, CallSummary, ClientBuilder, ClientConfig, ClientEvent,
};
use callwire_signaling_transport::{
    ConnectionState, Error, Identity, IdentityId, LoopbackRelay, LoopbackTransport, Result,
    RetryConfig, Role, SignalingMessage, SignalingTransport, Subscribers, Subscription,
    TransportEvent,
};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait up to `within` for the first event matching `pred`, skipping others
pub async fn wait_for_within<F>(
    events: &mut Subscription<ClientEvent>,
    within: Duration,
    mut pred: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("client event stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

pub async fn wait_for<F>(events: &mut Subscription<ClientEvent>, pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    wait_for_within(events, EVENT_TIMEOUT, pred).await
}

pub async fn wait_for_state(events: &mut Subscription<ClientEvent>, state: CallState) {
    wait_for(events, |e| {
        matches!(e, ClientEvent::CallStateChanged { info } if info.new_state == state)
    })
    .await;
}

pub async fn wait_for_end_within(events: &mut Subscription<ClientEvent>, within: Duration) -> CallSummary {
    match wait_for_within(events, within, |e| matches!(e, ClientEvent::CallEnded { .. })).await {
        ClientEvent::CallEnded { summary } => summary,
        other => unreachable!("filtered event {:?}", other),
    }
}

pub async fn wait_for_end(events: &mut Subscription<ClientEvent>) -> CallSummary {
    wait_for_end_within(events, EVENT_TIMEOUT).await
}

/// Events already delivered, without waiting
pub fn drain(events: &mut Subscription<ClientEvent>) -> Vec<ClientEvent> {
    std::iter::from_fn(|| events.try_recv()).collect()
}

/// A started client on the loopback relay with its simulated backends
pub struct Party {
    pub id: IdentityId,
    pub client: Arc<CallClient>,
    pub events: Subscription<ClientEvent>,
    pub media: SimulatedMediaCapture,
    pub links: SimulatedPeerLinkFactory,
}

impl Party {
    pub async fn join(relay: &LoopbackRelay, id: &str, role: Role) -> Self {
        Self::join_with(relay, id, role, ClientConfig::default()).await
    }

    pub async fn join_with(relay: &LoopbackRelay, id: &str, role: Role, config: ClientConfig) -> Self {
        let media = SimulatedMediaCapture::new();
        let links = SimulatedPeerLinkFactory::new();
        let client = ClientBuilder::new()
            .transport(Arc::new(LoopbackTransport::new(relay, RetryConfig::quick())))
            .media_capture(Arc::new(media.clone()))
            .peer_links(Arc::new(links.clone()))
            .config(config)
            .build()
            .await
            .unwrap();
        let events = client.subscribe();
        client
            .start(Identity::new(id, id.to_uppercase(), role))
            .await
            .unwrap();
        Self {
            id: IdentityId::from(id),
            client,
            events,
            media,
            links,
        }
    }

    /// Wait until the relay reports `peer` online
    pub async fn wait_online(&mut self, peer: &str) {
        let peer = IdentityId::from(peer);
        if self.client.presence().contains(&peer) {
            return;
        }
        wait_for(&mut self.events, |e| {
            matches!(e, ClientEvent::PresenceChanged { identity_id, online: true } if *identity_id == peer)
        })
        .await;
    }
}

/// A registered loopback connection driven by hand
pub struct RawPeer {
    pub transport: LoopbackTransport,
    pub events: Subscription<TransportEvent>,
}

impl RawPeer {
    pub async fn join(relay: &LoopbackRelay, id: &str, role: Role) -> Self {
        let transport = LoopbackTransport::new(relay, RetryConfig::quick());
        let mut events = transport.subscribe();
        transport.connect().await.unwrap();
        transport
            .send(SignalingMessage::Register {
                identity: Identity::new(id, id.to_uppercase(), role),
            })
            .unwrap();
        let mut peer = Self { transport, events };
        peer.next_message(|m| matches!(m, SignalingMessage::Registered { .. })).await;
        peer
    }

    pub async fn next_message<F>(&mut self, mut pred: F) -> SignalingMessage
    where
        F: FnMut(&SignalingMessage) -> bool,
    {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Some(TransportEvent::Message(m)) if pred(&m) => return m,
                    Some(_) => continue,
                    None => panic!("transport event stream ended"),
                }
            }
        })
        .await
        .expect("timed out waiting for relay message")
    }
}

/// In-memory transport whose inbound traffic is scripted by the test
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    state: Mutex<Option<ConnectionState>>,
    events: Subscribers<TransportEvent>,
    outbound: Subscribers<SignalingMessage>,
    sent: Mutex<Vec<SignalingMessage>>,
    epoch: Mutex<u64>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to messages the client sends
    pub fn outbound(&self) -> Subscription<SignalingMessage> {
        self.outbound.subscribe()
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    /// Deliver `message` as if it came from the relay
    pub fn inject(&self, message: SignalingMessage) {
        self.events.publish(TransportEvent::Message(message));
    }

    /// Drop the link unexpectedly
    pub fn drop_link(&self, reason: &str) {
        *self.state.lock() = Some(ConnectionState::Connecting);
        self.events.publish(TransportEvent::Disconnected {
            reason: reason.to_string(),
            link: *self.epoch.lock(),
        });
    }

    pub fn reopen(&self) {
        *self.state.lock() = Some(ConnectionState::Open);
        let link = self.next_link();
        self.events.publish(TransportEvent::Opened { reconnected: true, link });
    }

    fn next_link(&self) -> u64 {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        *epoch
    }
}

#[async_trait]
impl SignalingTransport for ScriptedTransport {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != Some(ConnectionState::Open) {
            *state = Some(ConnectionState::Open);
            let link = self.next_link();
            self.events.publish(TransportEvent::Opened { reconnected: false, link });
        }
        Ok(())
    }

    fn send(&self, message: SignalingMessage) -> Result<()> {
        if *self.state.lock() != Some(ConnectionState::Open) {
            return Err(Error::NotConnected);
        }
        self.sent.lock().push(message.clone());
        self.outbound.publish(message);
        Ok(())
    }

    fn subscribe(&self) -> Subscription<TransportEvent> {
        self.events.subscribe()
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap_or(ConnectionState::Closed)
    }

    fn link_epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    async fn disconnect(&self) {
        *self.state.lock() = Some(ConnectionState::Closed);
    }
}

pub async fn next_sent<F>(outbound: &mut Subscription<SignalingMessage>, mut pred: F) -> SignalingMessage
where
    F: FnMut(&SignalingMessage) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match outbound.recv().await {
                Some(m) if pred(&m) => return m,
                Some(_) => continue,
                None => panic!("outbound stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for outbound message")
}

/// A client on a [`ScriptedTransport`], registered as `id` with `online` peers
pub struct Scripted {
    pub transport: Arc<ScriptedTransport>,
    pub outbound: Subscription<SignalingMessage>,
    pub client: Arc<CallClient>,
    pub events: Subscription<ClientEvent>,
    pub media: SimulatedMediaCapture,
    pub links: SimulatedPeerLinkFactory,
}

impl Scripted {
    pub async fn build(config: ClientConfig) -> Self {
        let transport = ScriptedTransport::new();
        let outbound = transport.outbound();
        let media = SimulatedMediaCapture::new();
        let links = SimulatedPeerLinkFactory::new();
        let client = ClientBuilder::new()
            .transport(transport.clone())
            .media_capture(Arc::new(media.clone()))
            .peer_links(Arc::new(links.clone()))
            .config(config)
            .build()
            .await
            .unwrap();
        let events = client.subscribe();
        Self {
            transport,
            outbound,
            client,
            events,
            media,
            links,
        }
    }

    pub async fn started(id: &str, online: &[&str]) -> Self {
        Self::started_with(id, online, ClientConfig::default()).await
    }

    pub async fn started_with(id: &str, online: &[&str], config: ClientConfig) -> Self {
        let mut scripted = Self::build(config).await;
        let client = Arc::clone(&scripted.client);
        let identity = Identity::new(id, id.to_uppercase(), Role::Initiator);
        let starting = tokio::spawn(async move { client.start(identity).await });

        next_sent(&mut scripted.outbound, |m| matches!(m, SignalingMessage::Register { .. })).await;
        scripted.transport.inject(SignalingMessage::Registered {
            identity_id: IdentityId::from(id),
            online: online.iter().map(|p| IdentityId::from(*p)).collect(),
        });
        starting.await.unwrap().unwrap();
        scripted
    }
}
