use super::*;
use crate::error::Error;
use crate::loopback::{LoopbackRelay, LoopbackTransport};
use crate::recovery::RetryConfig;
use crate::transport::{CloseReason, ConnectionState};

#[tokio::test]
async fn send_before_connect_is_dropped() {
    let relay = LoopbackRelay::new();
    let transport = LoopbackTransport::new(&relay, RetryConfig::quick());

    let result = transport.send(SignalingMessage::Hangup {
        call_id: "c1".into(),
    });
    assert!(matches!(result, Err(Error::NotConnected)));
    assert_eq!(transport.connection_state(), ConnectionState::Closed);
}

#[tokio::test]
async fn connect_opens_and_reports_opened() {
    let relay = LoopbackRelay::new();
    let transport = LoopbackTransport::new(&relay, RetryConfig::quick());
    let mut events = transport.subscribe();

    transport.connect().await.unwrap();
    assert_eq!(transport.connection_state(), ConnectionState::Open);

    let event = wait_for_event(&mut events, |_| true).await;
    assert_eq!(event, TransportEvent::Opened { reconnected: false, link: 1 });
    assert_eq!(transport.link_epoch(), 1);

    // already open: returns at once
    transport.connect().await.unwrap();
}

#[tokio::test]
async fn unreachable_relay_exhausts_retries() {
    let relay = LoopbackRelay::new();
    relay.set_reachable(false);
    let transport = LoopbackTransport::new(&relay, RetryConfig::quick());
    let mut events = transport.subscribe();

    let err = transport.connect().await.unwrap_err();
    match err {
        Error::ConnectFailed { attempts, reason } => {
            assert_eq!(attempts, 5);
            assert_eq!(reason, "relay unreachable");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(transport.connection_state(), ConnectionState::Closed);

    let mut connect_errors = 0;
    loop {
        match events.try_recv() {
            Some(TransportEvent::ConnectError { attempt, .. }) => {
                connect_errors += 1;
                assert_eq!(attempt, connect_errors);
            }
            Some(TransportEvent::Closed { reason }) => {
                assert_eq!(reason, CloseReason::RetriesExhausted { attempts: 5 });
                break;
            }
            Some(other) => panic!("unexpected event {:?}", other),
            None => panic!("missing Closed event"),
        }
    }
    assert_eq!(connect_errors, 5);

    // a later connect starts a fresh cycle
    relay.set_reachable(true);
    transport.connect().await.unwrap();
    assert_eq!(transport.connection_state(), ConnectionState::Open);
}

#[tokio::test]
async fn severed_link_reconnects_without_identity() {
    let relay = LoopbackRelay::new();
    let transport = LoopbackTransport::new(&relay, RetryConfig::quick());
    let mut events = transport.subscribe();
    transport.connect().await.unwrap();
    register(&transport, &mut events, "p", Role::Initiator).await;

    assert!(relay.sever(&IdentityId::from("p")));

    let dropped = wait_for_event(&mut events, |e| matches!(e, TransportEvent::Disconnected { .. })).await;
    assert_eq!(
        dropped,
        TransportEvent::Disconnected {
            reason: "connection reset".to_string(),
            link: 1,
        }
    );
    let reopened = wait_for_event(&mut events, |e| matches!(e, TransportEvent::Opened { .. })).await;
    assert_eq!(reopened, TransportEvent::Opened { reconnected: true, link: 2 });
    assert_eq!(transport.link_epoch(), 2);

    // the relay does not know the identity until it registers again
    assert!(relay.online().is_empty());
}

#[tokio::test]
async fn explicit_disconnect_does_not_reconnect() {
    let relay = LoopbackRelay::new();
    let transport = LoopbackTransport::new(&relay, RetryConfig::quick());
    let mut events = transport.subscribe();
    transport.connect().await.unwrap();
    register(&transport, &mut events, "d", Role::Responder).await;

    transport.disconnect().await;
    assert_eq!(transport.connection_state(), ConnectionState::Closed);

    let closed = wait_for_event(&mut events, |e| matches!(e, TransportEvent::Closed { .. })).await;
    assert_eq!(
        closed,
        TransportEvent::Closed {
            reason: CloseReason::Requested
        }
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.connection_state(), ConnectionState::Closed);
    assert!(relay.online().is_empty());
    assert!(matches!(
        transport.send(SignalingMessage::Hangup { call_id: "c1".into() }),
        Err(Error::NotConnected)
    ));
}
