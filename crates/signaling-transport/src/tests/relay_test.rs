use super::*;
use crate::identity::CallId;
use crate::loopback::{LoopbackRelay, LoopbackTransport};
use crate::message::RejectReason;
use crate::recovery::RetryConfig;

async fn online_client(
    relay: &LoopbackRelay,
    id: &str,
    role: Role,
) -> (LoopbackTransport, Subscription<TransportEvent>, Vec<IdentityId>) {
    let transport = LoopbackTransport::new(relay, RetryConfig::quick());
    let mut events = transport.subscribe();
    transport.connect().await.unwrap();
    let online = register(&transport, &mut events, id, role).await;
    (transport, events, online)
}

#[tokio::test]
async fn registration_snapshot_and_presence_broadcast() {
    let relay = LoopbackRelay::new();
    let (_p, mut p_events, p_online) = online_client(&relay, "p", Role::Initiator).await;
    assert!(p_online.is_empty());

    let (_d, _d_events, d_online) = online_client(&relay, "d", Role::Responder).await;
    assert_eq!(d_online, vec![IdentityId::from("p")]);

    let change = wait_for_message(&mut p_events, |m| matches!(m, SignalingMessage::PresenceChanged { .. })).await;
    assert_eq!(
        change,
        SignalingMessage::PresenceChanged {
            identity_id: IdentityId::from("d"),
            online: true
        }
    );
}

#[tokio::test]
async fn refused_registration_reports_reason() {
    let relay = LoopbackRelay::new();
    relay.refuse_registrations(Some("unknown identity".to_string()));
    let transport = LoopbackTransport::new(&relay, RetryConfig::quick());
    let mut events = transport.subscribe();
    transport.connect().await.unwrap();

    transport
        .send(SignalingMessage::Register {
            identity: Identity::new("p", "P", Role::Initiator),
        })
        .unwrap();
    let reply = wait_for_message(&mut events, |_| true).await;
    assert_eq!(
        reply,
        SignalingMessage::RegistrationError {
            reason: "unknown identity".to_string()
        }
    );
    assert!(relay.online().is_empty());
}

#[tokio::test]
async fn invite_to_offline_identity_fails() {
    let relay = LoopbackRelay::new();
    let (p, mut p_events, _) = online_client(&relay, "p", Role::Initiator).await;

    let call_id = CallId::from("p_x_1");
    p.send(SignalingMessage::Invite {
        call_id: call_id.clone(),
        from: Identity::new("p", "P", Role::Initiator),
        to: IdentityId::from("x"),
    })
    .unwrap();

    let reply = wait_for_message(&mut p_events, |m| m.call_id() == Some(&call_id)).await;
    assert_eq!(
        reply,
        SignalingMessage::CallFailed {
            call_id,
            reason: "peer offline".to_string()
        }
    );
}

#[tokio::test]
async fn call_messages_are_relayed_between_parties() {
    let relay = LoopbackRelay::new();
    let (p, mut p_events, _) = online_client(&relay, "p", Role::Initiator).await;
    let (d, mut d_events, _) = online_client(&relay, "d", Role::Responder).await;
    let call_id = CallId::from("p_d_1");

    p.send(SignalingMessage::Invite {
        call_id: call_id.clone(),
        from: Identity::new("p", "P", Role::Initiator),
        to: IdentityId::from("d"),
    })
    .unwrap();
    let invite = wait_for_message(&mut d_events, |m| matches!(m, SignalingMessage::Invite { .. })).await;
    assert_eq!(invite.call_id(), Some(&call_id));

    d.send(SignalingMessage::InviteAck {
        call_id: call_id.clone(),
        accepted: true,
        reason: None,
    })
    .unwrap();
    wait_for_message(&mut p_events, |m| matches!(m, SignalingMessage::InviteAck { accepted: true, .. })).await;

    p.send(SignalingMessage::Offer {
        call_id: call_id.clone(),
        sdp: "v=0 offer".to_string(),
    })
    .unwrap();
    let offer = wait_for_message(&mut d_events, |m| matches!(m, SignalingMessage::Offer { .. })).await;
    assert_eq!(
        offer,
        SignalingMessage::Offer {
            call_id: call_id.clone(),
            sdp: "v=0 offer".to_string()
        }
    );

    d.send(SignalingMessage::Hangup { call_id: call_id.clone() }).unwrap();
    wait_for_message(&mut p_events, |m| matches!(m, SignalingMessage::Hangup { .. })).await;

    // the call is gone; later call traffic is not relayed
    p.send(SignalingMessage::Answer {
        call_id: call_id.clone(),
        sdp: "late".to_string(),
    })
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !relay
            .delivered_to(&IdentityId::from("d"))
            .iter()
            .any(|m| matches!(m, SignalingMessage::Answer { .. }))
    );
}

#[tokio::test]
async fn rejected_invite_closes_the_call() {
    let relay = LoopbackRelay::new();
    let (p, mut p_events, _) = online_client(&relay, "p", Role::Initiator).await;
    let (d, mut d_events, _) = online_client(&relay, "d", Role::Responder).await;
    let call_id = CallId::from("p_d_2");

    p.send(SignalingMessage::Invite {
        call_id: call_id.clone(),
        from: Identity::new("p", "P", Role::Initiator),
        to: IdentityId::from("d"),
    })
    .unwrap();
    wait_for_message(&mut d_events, |m| matches!(m, SignalingMessage::Invite { .. })).await;

    d.send(SignalingMessage::InviteAck {
        call_id: call_id.clone(),
        accepted: false,
        reason: Some(RejectReason::Busy),
    })
    .unwrap();
    let ack = wait_for_message(&mut p_events, |m| matches!(m, SignalingMessage::InviteAck { .. })).await;
    assert_eq!(
        ack,
        SignalingMessage::InviteAck {
            call_id,
            accepted: false,
            reason: Some(RejectReason::Busy)
        }
    );
}

#[tokio::test]
async fn dropped_party_is_hung_up_and_announced_offline() {
    let relay = LoopbackRelay::new();
    let (p, _p_events, _) = online_client(&relay, "p", Role::Initiator).await;
    let (_d, mut d_events, _) = online_client(&relay, "d", Role::Responder).await;
    let call_id = CallId::from("p_d_3");

    p.send(SignalingMessage::Invite {
        call_id: call_id.clone(),
        from: Identity::new("p", "P", Role::Initiator),
        to: IdentityId::from("d"),
    })
    .unwrap();
    wait_for_message(&mut d_events, |m| matches!(m, SignalingMessage::Invite { .. })).await;

    assert!(relay.sever(&IdentityId::from("p")));

    let hangup = wait_for_message(&mut d_events, |m| matches!(m, SignalingMessage::Hangup { .. })).await;
    assert_eq!(hangup, SignalingMessage::Hangup { call_id });
    let offline = wait_for_message(&mut d_events, |m| matches!(m, SignalingMessage::PresenceChanged { .. })).await;
    assert_eq!(
        offline,
        SignalingMessage::PresenceChanged {
            identity_id: IdentityId::from("p"),
            online: false
        }
    );
    assert_eq!(relay.online(), vec![IdentityId::from("d")]);
}
