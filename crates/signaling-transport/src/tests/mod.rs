//! Transport behaviour against the loopback relay

mod reconnect_test;
mod relay_test;

use std::time::Duration;

use crate::identity::{Identity, IdentityId, Role};
use crate::message::SignalingMessage;
use crate::subscription::Subscription;
use crate::transport::{SignalingTransport, TransportEvent};

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for the first event matching `pred`, skipping others
async fn wait_for_event<F>(sub: &mut Subscription<TransportEvent>, mut pred: F) -> TransportEvent
where
    F: FnMut(&TransportEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match sub.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("transport event stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for transport event")
}

/// Wait for the next relay message matching `pred`
async fn wait_for_message<F>(sub: &mut Subscription<TransportEvent>, mut pred: F) -> SignalingMessage
where
    F: FnMut(&SignalingMessage) -> bool,
{
    match wait_for_event(sub, |e| matches!(e, TransportEvent::Message(m) if pred(m))).await {
        TransportEvent::Message(message) => message,
        other => unreachable!("filtered event {:?}", other),
    }
}

/// Register `id` on an open transport and wait for the confirmation
async fn register(
    transport: &dyn SignalingTransport,
    sub: &mut Subscription<TransportEvent>,
    id: &str,
    role: Role,
) -> Vec<IdentityId> {
    transport
        .send(SignalingMessage::Register {
            identity: Identity::new(id, id.to_uppercase(), role),
        })
        .unwrap();
    match wait_for_message(sub, |m| matches!(m, SignalingMessage::Registered { .. })).await {
        SignalingMessage::Registered { online, .. } => online,
        other => unreachable!("filtered message {:?}", other),
    }
}
