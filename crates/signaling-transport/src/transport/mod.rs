//! Relay transports
//!
//! A [`SignalingTransport`] is a full-duplex, reconnecting message channel to
//! the relay. It owns no call semantics: it delivers [`TransportEvent`]s in
//! arrival order and reports its own connectivity.
//!
//! Delivery is at-most-once. A message sent while the link is down is
//! dropped with [`Error::NotConnected`], never queued, and nothing is
//! replayed across a reconnect. The transport does not remember who
//! registered on it, so re-registration after [`TransportEvent::Opened`] with
//! `reconnected: true` is the caller's job.
//!
//! Every open link carries a number, [`SignalingTransport::link_epoch`], that
//! grows by one per link. `Opened` and `Disconnected` name the link they are
//! about, so a consumer that acted on a newer link can tell a late event for
//! an older one apart.
//!
//! [`ReconnectingTransport`] implements the trait on top of any
//! [`Connector`]; the WebSocket and loopback transports are both
//! instantiations of it.

#[cfg(feature = "ws")]
pub mod ws;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::message::SignalingMessage;
use crate::recovery::RetryConfig;
use crate::subscription::{Subscribers, Subscription};

/// Connectivity of the relay link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Opening the link, or waiting to retry after a failure
    Connecting,
    /// The link is up and `send` will hand messages to it
    Open,
    /// Not connected and not trying to be
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why the transport stopped for good
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect()` was called
    Requested,
    /// Every reconnection attempt failed
    RetriesExhausted { attempts: u32 },
}

/// Events delivered to transport subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Link number `link` is open. `reconnected` is true when an earlier link
    /// on this transport had been open and dropped.
    Opened { reconnected: bool, link: u64 },

    /// A message arrived from the relay
    Message(SignalingMessage),

    /// An attempt to open the link failed; no link was established
    ConnectError { attempt: u32, reason: String },

    /// Link number `link` dropped unexpectedly; reconnection follows
    Disconnected { reason: String, link: u64 },

    /// The transport stopped and will not reconnect on its own
    Closed { reason: CloseReason },
}

/// Configuration for a relay connection
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay endpoint, e.g. `ws://127.0.0.1:9000/signal`
    pub url: String,
    /// Bound on a single connection attempt
    pub connect_timeout: Duration,
    /// Policy for reconnecting after a failure or drop
    pub reconnect: RetryConfig,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            reconnect: RetryConfig::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// A reconnecting, full-duplex channel to the relay
#[async_trait]
pub trait SignalingTransport: Send + Sync + fmt::Debug {
    /// Open the link, retrying per the reconnect policy.
    ///
    /// Resolves once the link is open, or with [`Error::ConnectFailed`] after
    /// every attempt failed. Returns immediately if already open.
    async fn connect(&self) -> Result<()>;

    /// Hand a message to the open link; fails with `NotConnected` otherwise
    fn send(&self, message: SignalingMessage) -> Result<()>;

    /// Subscribe to transport events; dropping the subscription unsubscribes
    fn subscribe(&self) -> Subscription<TransportEvent>;

    fn connection_state(&self) -> ConnectionState;

    /// Number of the most recently opened link; 0 before the first one
    fn link_epoch(&self) -> u64;

    /// Close the link and stop reconnecting
    async fn disconnect(&self);
}

/// Opens links to one relay endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Try once to open a link
    async fn open(&self) -> std::result::Result<Box<dyn Link>, String>;

    /// Endpoint description for logs
    fn endpoint(&self) -> String;
}

/// One established link
#[async_trait]
pub trait Link: Send {
    /// Next message. `Ok(None)` when the remote end closed the link.
    async fn recv(&mut self) -> std::result::Result<Option<SignalingMessage>, String>;

    async fn send(&mut self, message: SignalingMessage) -> std::result::Result<(), String>;

    /// Close the link gracefully
    async fn close(&mut self);
}

/// Generic reconnecting transport over a [`Connector`]
pub struct ReconnectingTransport<C: Connector> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    connector: C,
    retry: RetryConfig,
    events: Subscribers<TransportEvent>,
    state: watch::Sender<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<SignalingMessage>>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    last_failure: Mutex<Option<(u32, String)>>,
    epoch: AtomicU64,
}

enum PumpExit {
    Shutdown,
    Dropped(String),
}

impl<C: Connector> ReconnectingTransport<C> {
    pub fn with_connector(connector: C, retry: RetryConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                connector,
                retry,
                events: Subscribers::new(),
                state,
                outgoing: Mutex::new(None),
                shutdown,
                supervisor: Mutex::new(None),
                last_failure: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Start the supervisor task unless one is already running.
    ///
    /// A supervisor publishes `Closed` as its very last act, so a closed state
    /// means no live supervisor will touch the shared state again.
    fn ensure_supervisor(&self) {
        let mut supervisor = self.inner.supervisor.lock();
        if *self.inner.state.borrow() != ConnectionState::Closed {
            return;
        }

        self.inner.shutdown.send_replace(false);
        self.inner.last_failure.lock().take();
        self.inner.state.send_replace(ConnectionState::Connecting);

        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.inner.shutdown.subscribe();
        *supervisor = Some(tokio::spawn(supervise(inner, shutdown_rx)));
    }
}

impl<C: Connector> fmt::Debug for ReconnectingTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingTransport")
            .field("endpoint", &self.inner.connector.endpoint())
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

#[async_trait]
impl<C: Connector> SignalingTransport for ReconnectingTransport<C> {
    async fn connect(&self) -> Result<()> {
        if *self.inner.state.borrow() == ConnectionState::Open {
            return Ok(());
        }

        self.ensure_supervisor();
        let mut state_rx = self.inner.state.subscribe();

        let settled = state_rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map(|state| *state)
            .unwrap_or(ConnectionState::Closed);

        match settled {
            ConnectionState::Open => Ok(()),
            _ => {
                let (attempts, reason) = self
                    .inner
                    .last_failure
                    .lock()
                    .clone()
                    .unwrap_or((0, "transport closed".to_string()));
                Err(Error::ConnectFailed { attempts, reason })
            }
        }
    }

    fn send(&self, message: SignalingMessage) -> Result<()> {
        let outgoing = self.inner.outgoing.lock();
        let Some(tx) = outgoing.as_ref() else {
            debug!(kind = message.kind(), "Dropping outbound message, transport not connected");
            return Err(Error::NotConnected);
        };
        trace!(kind = message.kind(), "Queueing outbound message");
        tx.send(message).map_err(|_| Error::NotConnected)
    }

    fn subscribe(&self) -> Subscription<TransportEvent> {
        self.inner.events.subscribe()
    }

    fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    fn link_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Acquire)
    }

    async fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Transport supervisor ended abnormally: {}", e);
            }
        }
    }
}

impl<C: Connector> Drop for ReconnectingTransport<C> {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}

impl<C> Inner<C> {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

async fn supervise<C: Connector>(inner: Arc<Inner<C>>, mut shutdown: watch::Receiver<bool>) {
    let endpoint = inner.connector.endpoint();
    let mut failures = 0u32;
    let mut ever_opened = false;

    loop {
        if *shutdown.borrow() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);

        let opened = tokio::select! {
            result = inner.connector.open() => result,
            _ = shutdown.changed() => break,
        };

        match opened {
            Ok(link) => {
                failures = 0;
                let (tx, rx) = mpsc::unbounded_channel();
                let link_no = inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                *inner.outgoing.lock() = Some(tx);
                inner.set_state(ConnectionState::Open);
                info!(endpoint = %endpoint, link = link_no, reconnected = ever_opened, "Relay link open");
                inner.events.publish(TransportEvent::Opened {
                    reconnected: ever_opened,
                    link: link_no,
                });
                ever_opened = true;

                let exit = pump(&inner, link, rx, &mut shutdown).await;
                inner.outgoing.lock().take();

                match exit {
                    PumpExit::Shutdown => break,
                    PumpExit::Dropped(reason) => {
                        warn!(endpoint = %endpoint, reason = %reason, "Relay link dropped");
                        inner.set_state(ConnectionState::Connecting);
                        inner.events.publish(TransportEvent::Disconnected { reason, link: link_no });

                        let delay = inner.retry.delay_for_attempt(1);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            }
            Err(reason) => {
                failures += 1;
                warn!(
                    endpoint = %endpoint,
                    attempt = failures,
                    max_attempts = inner.retry.max_attempts,
                    reason = %reason,
                    "Relay connection attempt failed"
                );
                *inner.last_failure.lock() = Some((failures, reason.clone()));
                inner.events.publish(TransportEvent::ConnectError {
                    attempt: failures,
                    reason,
                });

                if failures >= inner.retry.max_attempts {
                    warn!(endpoint = %endpoint, attempts = failures, "Giving up on relay connection");
                    inner.events.publish(TransportEvent::Closed {
                        reason: CloseReason::RetriesExhausted { attempts: failures },
                    });
                    inner.set_state(ConnectionState::Closed);
                    return;
                }

                let delay = inner.retry.delay_for_attempt(failures);
                debug!(endpoint = %endpoint, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    info!(endpoint = %endpoint, "Relay transport closed");
    inner.events.publish(TransportEvent::Closed {
        reason: CloseReason::Requested,
    });
    inner.set_state(ConnectionState::Closed);
}

/// Move messages between one open link and the subscribers until it ends
async fn pump<C>(
    inner: &Inner<C>,
    mut link: Box<dyn Link>,
    mut outgoing: mpsc::UnboundedReceiver<SignalingMessage>,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpExit {
    loop {
        tokio::select! {
            incoming = link.recv() => match incoming {
                Ok(Some(message)) => {
                    trace!(kind = message.kind(), "Received message from relay");
                    inner.events.publish(TransportEvent::Message(message));
                }
                Ok(None) => return PumpExit::Dropped("closed by relay".to_string()),
                Err(reason) => return PumpExit::Dropped(reason),
            },
            Some(message) = outgoing.recv() => {
                if let Err(reason) = link.send(message).await {
                    return PumpExit::Dropped(reason);
                }
            }
            _ = shutdown.changed() => {
                link.close().await;
                return PumpExit::Shutdown;
            }
        }
    }
}
