//! Negotiation engine against simulated peer links

use callwire_client_core::sim::{LinkBehavior, SimulatedMediaCapture, SimulatedPeerLinkFactory};
use callwire_client_core::{
    CallId, LinkConfig, MediaCapture, MediaConstraints, MediaKind, NegotiationEngine,
    NegotiationError, NegotiationEvent, NegotiationRole, NegotiationSignal, NegotiationState,
    PeerLinkEvent, PeerLinkFactory, Subscription,
};
use callwire_signaling_transport::IceCandidate;

struct Side {
    engine: NegotiationEngine,
    link_events: Subscription<PeerLinkEvent>,
}

impl Side {
    async fn new(factory: &SimulatedPeerLinkFactory) -> Self {
        let link = factory.create(&LinkConfig { ice_servers: vec![] }).await.unwrap();
        let engine = NegotiationEngine::new(CallId::from("p_d_1"), link);
        let link_events = engine.link_events();
        Self { engine, link_events }
    }

    async fn with_media(factory: &SimulatedPeerLinkFactory, capture: &SimulatedMediaCapture) -> Self {
        let mut side = Self::new(factory).await;
        let media = capture.acquire(MediaConstraints::default()).await.unwrap();
        side.engine.attach_local_media(media).unwrap();
        side
    }

    /// Feed every pending link event through the engine
    fn pump(&mut self) -> Vec<NegotiationEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.link_events.try_recv() {
            out.extend(self.engine.handle_link_event(event));
        }
        out
    }
}

fn signals(events: &[NegotiationEvent]) -> Vec<NegotiationSignal> {
    events
        .iter()
        .filter_map(|e| match e {
            NegotiationEvent::LocalSignal(signal) => Some(signal.clone()),
            _ => None,
        })
        .collect()
}

fn offer_of(events: &[NegotiationEvent]) -> NegotiationSignal {
    signals(events)
        .into_iter()
        .find(|s| matches!(s, NegotiationSignal::Offer(_)))
        .expect("no offer produced")
}

#[tokio::test]
async fn offer_answer_and_candidates_connect_both_sides() {
    let factory = SimulatedPeerLinkFactory::new();
    let mut offerer = Side::with_media(&factory, &SimulatedMediaCapture::new()).await;
    let mut answerer = Side::with_media(&factory, &SimulatedMediaCapture::new()).await;

    let offer = offer_of(&offerer.engine.begin(NegotiationRole::Offerer).await.unwrap());
    answerer.engine.begin(NegotiationRole::Answerer).await.unwrap();

    let answer_events = answerer.engine.submit_remote_signal(offer).await.unwrap();
    let answer = signals(&answer_events).remove(0);
    assert!(matches!(answer, NegotiationSignal::Answer(_)));
    offerer.engine.submit_remote_signal(answer).await.unwrap();

    let offerer_candidates = signals(&offerer.pump());
    let answerer_candidates = signals(&answerer.pump());
    assert_eq!(offerer_candidates.len(), 2);
    assert_eq!(answerer_candidates.len(), 2);

    for candidate in offerer_candidates {
        answerer.engine.submit_remote_signal(candidate).await.unwrap();
    }
    for candidate in answerer_candidates {
        offerer.engine.submit_remote_signal(candidate).await.unwrap();
    }

    for side in [&mut offerer, &mut answerer] {
        let events = side.pump();
        assert!(events.contains(&NegotiationEvent::StateChanged(NegotiationState::Connected)));
        assert!(events
            .iter()
            .any(|e| matches!(e, NegotiationEvent::RemoteMediaAvailable(_))));
        assert_eq!(side.engine.connection_state(), NegotiationState::Connected);
    }
}

#[tokio::test]
async fn early_candidates_wait_for_the_remote_description() {
    let factory = SimulatedPeerLinkFactory::new();
    let mut offerer = Side::with_media(&factory, &SimulatedMediaCapture::new()).await;
    let mut answerer = Side::with_media(&factory, &SimulatedMediaCapture::new()).await;
    let offer = offer_of(&offerer.engine.begin(NegotiationRole::Offerer).await.unwrap());
    answerer.engine.begin(NegotiationRole::Answerer).await.unwrap();

    let early = [IceCandidate::new("candidate:a"), IceCandidate::new("candidate:b")];
    for candidate in &early {
        answerer
            .engine
            .submit_remote_signal(NegotiationSignal::Candidate(candidate.clone()))
            .await
            .unwrap();
    }
    let answerer_link = factory.links()[1].clone();
    assert_eq!(answerer.engine.buffered_candidates(), 2);
    assert!(answerer_link.applied_candidates().is_empty());

    answerer.engine.submit_remote_signal(offer).await.unwrap();
    assert_eq!(answerer.engine.buffered_candidates(), 0);

    let late = IceCandidate::new("candidate:c");
    answerer
        .engine
        .submit_remote_signal(NegotiationSignal::Candidate(late.clone()))
        .await
        .unwrap();
    assert_eq!(
        answerer_link.applied_candidates(),
        vec![early[0].clone(), early[1].clone(), late]
    );
}

#[tokio::test]
async fn out_of_place_signals_are_refused() {
    let factory = SimulatedPeerLinkFactory::new();
    let mut idle = Side::new(&factory).await;
    assert_eq!(
        idle.engine
            .submit_remote_signal(NegotiationSignal::Offer("v=0".into()))
            .await
            .unwrap_err(),
        NegotiationError::NotStarted
    );

    let mut offerer = Side::with_media(&factory, &SimulatedMediaCapture::new()).await;
    offerer.engine.begin(NegotiationRole::Offerer).await.unwrap();
    let err = offerer
        .engine
        .submit_remote_signal(NegotiationSignal::Offer("v=0".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, NegotiationError::UnexpectedSignal { signal: "offer", .. }));

    let err = offerer.engine.begin(NegotiationRole::Offerer).await.unwrap_err();
    assert!(matches!(err, NegotiationError::UnexpectedSignal { .. }));
}

#[tokio::test]
async fn failing_link_reports_failure() {
    let factory = SimulatedPeerLinkFactory::with_behavior(LinkBehavior::Fail);
    let mut offerer = Side::with_media(&factory, &SimulatedMediaCapture::new()).await;
    let mut answerer = Side::with_media(&factory, &SimulatedMediaCapture::new()).await;

    let offer = offer_of(&offerer.engine.begin(NegotiationRole::Offerer).await.unwrap());
    answerer.engine.begin(NegotiationRole::Answerer).await.unwrap();
    answerer.engine.submit_remote_signal(offer).await.unwrap();
    for candidate in signals(&offerer.pump()) {
        answerer.engine.submit_remote_signal(candidate).await.unwrap();
    }

    let events = answerer.pump();
    assert!(events.contains(&NegotiationEvent::StateChanged(NegotiationState::Failed)));
    assert_eq!(answerer.engine.connection_state(), NegotiationState::Failed);
}

#[tokio::test]
async fn media_toggles_need_attached_media() {
    let factory = SimulatedPeerLinkFactory::new();
    let mut bare = Side::new(&factory).await;
    assert!(!bare.engine.set_media_enabled(MediaKind::Audio, false));

    let capture = SimulatedMediaCapture::new();
    let mut side = Side::with_media(&factory, &capture).await;
    assert!(side.engine.set_media_enabled(MediaKind::Video, false));
    let media = side.engine.local_media().unwrap();
    assert!(!media.is_enabled(MediaKind::Video));
    assert!(media.is_enabled(MediaKind::Audio));

    side.engine.close();
    assert!(side.engine.is_closed());
    assert!(!capture.in_use());
    assert_eq!(factory.links()[1].local_media_ids().len(), 1);
}
