//! Call client
//!
//! [`CallClient`] is the handle applications hold. Each method enqueues a
//! command for the client's engine and waits for its reply, so user actions
//! are serialized with relay traffic and timers. State flows back through
//! [`ClientEvent`] subscriptions and the [`SessionSnapshot`] watch channel.
//!
//! Build one with [`ClientBuilder`]:
//!
//! ```rust
//! use std::sync::Arc;
//! use callwire_client_core::ClientBuilder;
//! use callwire_client_core::sim::{SimulatedMediaCapture, SimulatedPeerLinkFactory};
//! use callwire_signaling_transport::{LoopbackRelay, LoopbackTransport, RetryConfig};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let relay = LoopbackRelay::new();
//! let client = ClientBuilder::new()
//!     .transport(Arc::new(LoopbackTransport::new(&relay, RetryConfig::quick())))
//!     .media_capture(Arc::new(SimulatedMediaCapture::new()))
//!     .peer_links(Arc::new(SimulatedPeerLinkFactory::new()))
//!     .build()
//!     .await
//!     .unwrap();
//!
//! assert!(client.session().is_none());
//! # })
//! ```

pub mod builder;
pub mod config;
mod engine;

pub use builder::ClientBuilder;
pub use config::ClientConfig;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use callwire_signaling_transport::{
    CallId, ConnectionState, Identity, IdentityId, SignalingTransport, Subscribers, Subscription,
};

use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, SessionSnapshot};
use crate::media::MediaKind;
use crate::registration::{PresenceRegistry, PresenceSet, RegistrationStatus};
use engine::{Command, EngineInput};

/// Handle to a running call client
pub struct CallClient {
    config: ClientConfig,
    transport: Arc<dyn SignalingTransport>,
    registry: Arc<PresenceRegistry>,
    commands: mpsc::UnboundedSender<EngineInput>,
    events: Subscribers<ClientEvent>,
    session: watch::Receiver<Option<SessionSnapshot>>,
    engine: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for CallClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallClient")
            .field("transport", &self.transport)
            .field("registration", &self.registry.status())
            .field("session", &self.session.borrow().as_ref().map(|s| s.state))
            .finish()
    }
}

impl CallClient {
    /// Connect to the relay, register `identity` and wait for confirmation.
    ///
    /// Fails with the transport error once reconnection is exhausted, with
    /// [`ClientError::Registration`] if the relay refuses the identity, or with
    /// [`ClientError::RegistrationTimeout`] if it never answers.
    pub async fn start(&self, identity: Identity) -> ClientResult<()> {
        info!(identity = %identity.id, role = %identity.role, "Starting call client");
        self.transport.connect().await?;
        self.request(|reply| Command::Start { identity, reply }).await
    }

    /// Invite `target` to a call; returns the new call's id.
    ///
    /// The target must be online and no other call may be in progress.
    pub async fn place_call(&self, target: &IdentityId) -> ClientResult<CallId> {
        let target = target.clone();
        self.request(|reply| Command::PlaceCall { target, reply }).await
    }

    /// Accept the ringing incoming call
    pub async fn accept(&self, call_id: &CallId) -> ClientResult<()> {
        let call_id = call_id.clone();
        self.request(|reply| Command::Accept { call_id, reply }).await
    }

    /// Decline the ringing incoming call
    pub async fn reject(&self, call_id: &CallId) -> ClientResult<()> {
        let call_id = call_id.clone();
        self.request(|reply| Command::Reject { call_id, reply }).await
    }

    /// End or cancel the current call
    pub async fn hang_up(&self) -> ClientResult<()> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    /// Mute or unmute the microphone, or turn the camera off and on
    pub async fn set_media_enabled(&self, kind: MediaKind, enabled: bool) -> ClientResult<()> {
        self.request(|reply| Command::SetMediaEnabled { kind, enabled, reply })
            .await
    }

    pub fn subscribe(&self) -> Subscription<ClientEvent> {
        self.events.subscribe()
    }

    /// The current call, or `None` when idle
    pub fn session(&self) -> Option<SessionSnapshot> {
        self.session.borrow().clone()
    }

    /// Read-only stream of the current call's state
    pub fn watch_session(&self) -> watch::Receiver<Option<SessionSnapshot>> {
        self.session.clone()
    }

    pub fn presence(&self) -> PresenceSet {
        self.registry.presence()
    }

    pub fn registration_state(&self) -> RegistrationStatus {
        self.registry.status()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.registry.identity()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.connection_state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Hang up any call, stop the engine and close the relay link
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(EngineInput::Command(Command::Shutdown { reply }))
            .is_ok()
        {
            let _ = done.await;
        }
        self.transport.disconnect().await;

        let engine = self.engine.lock().take();
        if let Some(engine) = engine {
            if let Err(e) = engine.await {
                warn!("Client engine ended abnormally: {}", e);
            }
        }
        info!("Call client stopped");
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<ClientResult<T>>) -> Command,
    ) -> ClientResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(EngineInput::Command(command(reply)))
            .map_err(|_| ClientError::EngineStopped)?;
        response.await.map_err(|_| ClientError::EngineStopped)?
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.lock().take() {
            engine.abort();
        }
    }
}
