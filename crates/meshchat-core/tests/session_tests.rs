//! Link session state machine tests
//!
//! Sessions run over the loopback mesh with tokio's paused clock, so the
//! 10s resolution timeout elapses instantly and deterministically.

use meshchat_core::{
    ChatError, LinkQuality, LinkSession, LoopbackMesh, LoopbackNetwork, MeshFacade, MessageVia,
    SessionConfig, SessionEvent, SessionHandle, SessionState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

// ============================================================================
// Helpers
// ============================================================================

fn start(mesh: &LoopbackMesh) -> (SessionHandle, broadcast::Receiver<SessionEvent>) {
    LinkSession::spawn(Arc::new(mesh.clone()), SessionConfig::default())
}

async fn wait_for_state(handle: &SessionHandle, state: SessionState) -> bool {
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if handle.state().await.ok() == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Next message event, skipping state changes
async fn next_message(events: &mut broadcast::Receiver<SessionEvent>) -> (String, MessageVia) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Message { text, via, .. }) => return (text, via),
            Ok(_) => continue,
            Err(e) => panic!("event stream ended: {e}"),
        }
    }
}

/// Two announced nodes with A actively linked to B
async fn linked_pair() -> (
    LoopbackNetwork,
    LoopbackMesh,
    LoopbackMesh,
    SessionHandle,
    SessionHandle,
    broadcast::Receiver<SessionEvent>,
) {
    let network = LoopbackNetwork::new();
    let a = network.node("alice");
    let b = network.node("bob");
    let (a_session, _) = start(&a);
    let (b_session, b_events) = start(&b);

    b.announce().await.unwrap();
    a_session.connect(&b.own_address().to_hex()).await.unwrap();
    assert!(wait_for_state(&a_session, SessionState::Active).await);
    assert!(wait_for_state(&b_session, SessionState::Active).await);

    (network, a, b, a_session, b_session, b_events)
}

// ============================================================================
// Connect
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_invalid_address_stays_idle() {
    let network = LoopbackNetwork::new();
    let (session, _) = start(&network.node("alice"));

    let err = session.connect("not-hex!").await.unwrap_err();
    assert!(matches!(err, ChatError::InvalidAddress { .. }));
    assert_eq!(session.state().await.unwrap(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_connect_unresolvable_peer_times_out() {
    let network = LoopbackNetwork::new();
    let (session, mut events) = start(&network.node("alice"));
    let ghost = "0123456789abcdef0123456789abcdef";

    let started = Instant::now();
    let err = session.connect(ghost).await.unwrap_err();

    assert!(matches!(err, ChatError::PeerUnreachable { .. }));
    assert!(started.elapsed() >= Duration::from_secs(10));
    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.peer, None);

    let mut states = Vec::new();
    while let Ok(SessionEvent::StateChanged { state, .. }) = events.try_recv() {
        states.push(state);
    }
    assert_eq!(states, vec![SessionState::Resolving, SessionState::Idle]);
}

#[tokio::test(start_paused = true)]
async fn test_connect_resolves_after_late_announce() {
    let network = LoopbackNetwork::new();
    let a = network.node("alice");
    let b = network.node("bob");
    let (session, _) = start(&a);

    let announcer = b.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        announcer.announce().await.unwrap();
    });

    let state = session.connect(&b.own_address().to_hex()).await.unwrap();
    assert_eq!(state, SessionState::Connecting);
    assert!(wait_for_state(&session, SessionState::Active).await);
    assert_eq!(
        session.snapshot().await.unwrap().peer,
        Some(b.own_address())
    );
}

#[tokio::test(start_paused = true)]
async fn test_newer_connect_supersedes_pending() {
    let network = LoopbackNetwork::new();
    let a = network.node("alice");
    let b = network.node("bob");
    b.announce().await.unwrap();
    let (session, _) = start(&a);

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.connect("0123456789abcdef0123456789abcdef").await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    session.connect(&b.own_address().to_hex()).await.unwrap();
    let first = first.await.unwrap();
    assert!(matches!(first, Err(ChatError::ConnectSuperseded { .. })));
    assert!(wait_for_state(&session, SessionState::Active).await);
}

// ============================================================================
// Send
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_without_link_rejected() {
    let network = LoopbackNetwork::new();
    let (session, _) = start(&network.node("alice"));

    let err = session.send("hello").await.unwrap_err();
    assert!(matches!(err, ChatError::LinkNotActive { .. }));
    assert!(network.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scenario_a_sends_hi_to_b() {
    let (network, _a, _b, a_session, _b_session, mut b_events) = linked_pair().await;
    let link = a_session.snapshot().await.unwrap().link.unwrap();

    a_session.send("hi").await.unwrap();

    let sent = network.sent_on(link);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data.as_ref(), b"hi");

    let (text, via) = next_message(&mut b_events).await;
    assert_eq!(text, "hi");
    assert_eq!(via, MessageVia::Link);
}

#[tokio::test(start_paused = true)]
async fn test_send_utf8_intact() {
    let (network, _a, _b, a_session, _b_session, mut b_events) = linked_pair().await;

    a_session.send("héllo wörld ✓").await.unwrap();

    let (text, _) = next_message(&mut b_events).await;
    assert_eq!(text, "héllo wörld ✓");
    assert_eq!(network.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_closes_link() {
    let (network, a, _b, a_session, _b_session, _) = linked_pair().await;

    network.set_fail_sends(&a.own_address(), true);
    let err = a_session.send("hello").await.unwrap_err();
    assert!(matches!(err, ChatError::LinkSendFailure(_)));

    let snapshot = a_session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Closed);
    assert_eq!(snapshot.link, None);
    assert!(snapshot.peer.is_some(), "peer retained for retry");

    // No transparent retry
    network.set_fail_sends(&a.own_address(), false);
    assert!(matches!(
        a_session.send("again").await,
        Err(ChatError::LinkNotActive { .. })
    ));
    assert!(network.sent().is_empty());
}

// ============================================================================
// Mesh events
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_remote_close_moves_to_closed() {
    let (network, _a, b, a_session, _b_session, _) = linked_pair().await;
    let link = a_session.snapshot().await.unwrap().link.unwrap();

    network.close_link(link);
    assert!(wait_for_state(&a_session, SessionState::Closed).await);

    // Reconnect from Closed
    a_session.connect(&b.own_address().to_hex()).await.unwrap();
    assert!(wait_for_state(&a_session, SessionState::Active).await);
    assert_ne!(a_session.snapshot().await.unwrap().link, Some(link));
}

#[tokio::test(start_paused = true)]
async fn test_late_close_of_superseded_link_ignored() {
    let (network, _a, b, a_session, _b_session, _) = linked_pair().await;
    let old = a_session.snapshot().await.unwrap().link.unwrap();

    a_session.connect(&b.own_address().to_hex()).await.unwrap();
    assert!(wait_for_state(&a_session, SessionState::Active).await);
    let current = a_session.snapshot().await.unwrap().link.unwrap();
    assert_ne!(old, current);

    network.close_link(old);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = a_session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Active);
    assert_eq!(snapshot.link, Some(current));
}

#[tokio::test(start_paused = true)]
async fn test_late_establishment_of_replaced_link_ignored() {
    let network = LoopbackNetwork::new();
    let a = network.node("alice");
    let b = network.node("bob");
    b.announce().await.unwrap();
    network.set_hold_links(&a.own_address(), true);
    let (session, _) = start(&a);

    let state = session.connect(&b.own_address().to_hex()).await.unwrap();
    assert_eq!(state, SessionState::Connecting);
    let first_link = session.snapshot().await.unwrap().link.unwrap();

    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.connect("0123456789abcdef0123456789abcdef").await })
    };
    assert!(wait_for_state(&session, SessionState::Resolving).await);

    // The first link completes only after the user moved on
    assert!(network.establish_link(first_link));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Resolving);
    assert_eq!(snapshot.link, None);

    let second = second.await.unwrap();
    assert!(matches!(second, Err(ChatError::PeerUnreachable { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_incoming_link_does_not_replace_active() {
    let (network, a, _b, a_session, _b_session, _) = linked_pair().await;
    let current = a_session.snapshot().await.unwrap().link.unwrap();

    let c = network.node("carol");
    a.announce().await.unwrap();
    let identity = c.recall_identity(&a.own_address()).await.unwrap();
    c.open_link(&identity).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = a_session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Active);
    assert_eq!(snapshot.link, Some(current));
}

#[tokio::test(start_paused = true)]
async fn test_incoming_link_adopted_when_idle() {
    let network = LoopbackNetwork::new();
    let a = network.node("alice");
    let c = network.node("carol");
    let (a_session, _) = start(&a);

    a.announce().await.unwrap();
    let identity = c.recall_identity(&a.own_address()).await.unwrap();
    let link = c.open_link(&identity).await.unwrap();

    assert!(wait_for_state(&a_session, SessionState::Active).await);
    let snapshot = a_session.snapshot().await.unwrap();
    assert_eq!(snapshot.link, Some(link));
    assert_eq!(snapshot.peer, Some(c.own_address()));
}

#[tokio::test(start_paused = true)]
async fn test_bare_packet_delivered() {
    let network = LoopbackNetwork::new();
    let a = network.node("alice");
    let b = network.node("bob");
    let (_b_session, mut b_events) = start(&b);

    a.send_packet(&b.own_address(), b"ping").unwrap();

    let (text, via) = next_message(&mut b_events).await;
    assert_eq!(text, "ping");
    assert_eq!(via, MessageVia::Packet);
}

#[tokio::test(start_paused = true)]
async fn test_link_stats() {
    let (network, _a, _b, a_session, _b_session, _) = linked_pair().await;
    let link = a_session.snapshot().await.unwrap().link.unwrap();

    assert_eq!(a_session.link_stats().await.unwrap(), None);

    let quality = LinkQuality {
        rssi: Some(-97.0),
        snr: Some(4.25),
    };
    network.set_link_quality(link, quality);
    assert_eq!(a_session.link_stats().await.unwrap(), Some(quality));
}

#[tokio::test(start_paused = true)]
async fn test_link_stats_without_link() {
    let network = LoopbackNetwork::new();
    let (session, _) = start(&network.node("alice"));
    assert!(matches!(
        session.link_stats().await,
        Err(ChatError::LinkNotActive { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_resolution() {
    let network = LoopbackNetwork::new();
    let (session, _) = start(&network.node("alice"));

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.connect("0123456789abcdef0123456789abcdef").await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    session.shutdown().await;
    session.shutdown().await;
    assert!(matches!(
        pending.await.unwrap(),
        Err(ChatError::SessionClosed)
    ));
}
