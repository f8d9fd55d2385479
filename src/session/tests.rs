use super::*;
use crate::config::{KeepaliveConfig, SessionConfig, SignalingConfig};
use crate::events::{CamcastEvent, EventBus};
use crate::media::{MediaEngine, MediaEventKind, MockMediaEngine};
use crate::monitor::ConnectionMonitor;
use crate::signaling::{
    MemoryRelay, MessageKind, SessionSubscription, SignalingMessage, SignalingTransport,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Everything a session worker needs, wired over the in-process relay
/// and a scripted engine
struct Rig {
    ctx: SessionContext,
    engine: Arc<MockMediaEngine>,
    transport: Arc<SignalingTransport>,
    events: EventBus,
    _cancel: CancellationToken,
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        viewer_capacity: 4,
        negotiation_timeout_ms: 150,
        degrade_timeout_ms: 60,
        reconnect_max_attempts: 2,
        reconnect_backoff_base_ms: 10,
        closed_grace_ms: 50,
        gc_interval_ms: 1_000,
    }
}

fn rig(engine: MockMediaEngine, config: SessionConfig) -> Rig {
    let events = EventBus::new(64);
    let transport = Arc::new(SignalingTransport::new(
        MemoryRelay::shared(),
        SignalingConfig {
            send_retry_base_ms: 1,
            ..SignalingConfig::default()
        },
    ));
    let cancel = CancellationToken::new();
    let monitor = ConnectionMonitor::new(
        KeepaliveConfig {
            interval_ms: 1_000,
            miss_threshold: 3,
        },
        events.clone(),
    );
    let (monitor_handle, _monitor_task) = monitor.spawn(cancel.clone());
    let engine = Arc::new(engine);

    let ctx = SessionContext {
        config,
        transport: Arc::clone(&transport),
        engine: Arc::clone(&engine) as Arc<dyn MediaEngine>,
        events: events.clone(),
        monitor: monitor_handle,
    };
    Rig {
        ctx,
        engine,
        transport,
        events,
        _cancel: cancel,
    }
}

/// Spawn a publisher worker plus the engine-to-worker event router the
/// manager normally provides
async fn spawn_session(rig: &Rig, session: &SessionId) -> SessionHandle {
    let subscription = rig
        .transport
        .subscribe(session, Role::Publisher)
        .await
        .unwrap();
    let handle = rig.ctx.spawn_publisher(
        session.clone(),
        CameraId::from("cam-test"),
        ViewerId::from("viewer-test"),
        subscription,
    );

    let mut engine_events = rig.ctx.engine.events();
    let commands = handle.commands();
    let target = session.clone();
    tokio::spawn(async move {
        while let Ok(event) = engine_events.recv().await {
            if event.session == target {
                let _ = commands.send(SessionCommand::Media(event.kind)).await;
            }
        }
    });

    handle
}

/// Attach to the session's channel as the remote viewer
async fn viewer_subscription(rig: &Rig, session: &SessionId) -> SessionSubscription {
    rig.transport.subscribe(session, Role::Viewer).await.unwrap()
}

async fn recv_kind(sub: &mut SessionSubscription, kind: MessageKind) -> SignalingMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out waiting for publisher message")
            .expect("signaling channel ended");
        if msg.kind == kind {
            return msg;
        }
    }
}

async fn wait_for_phase(handle: &SessionHandle, wanted: SessionPhase) -> SessionSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = handle.snapshot().await.expect("worker gone while waiting");
        if snapshot.phase == wanted {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never reached {}, currently {}",
            wanted,
            snapshot.phase
        );
        sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_close(
    rx: &mut broadcast::Receiver<CamcastEvent>,
    session: &SessionId,
) -> CloseReason {
    loop {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for session close")
            .expect("event bus closed");
        if let CamcastEvent::SessionClosed {
            session: closed,
            reason,
            ..
        } = event
        {
            if &closed == session {
                return reason;
            }
        }
    }
}

/// Answer the most recent offer, as the viewer endpoint would: mint the
/// answering description through the viewer's own engine and send it
/// back at the offer's incarnation
async fn answer_offer(rig: &Rig, offer: &SignalingMessage, viewer_seq: u64) {
    let viewer_engine = MockMediaEngine::manual();
    let payload = viewer_engine
        .create_answer(&offer.session, offer.payload_str())
        .await
        .unwrap();
    let answer = SignalingMessage::answer(
        offer.session.clone(),
        Role::Viewer,
        viewer_seq,
        offer.incarnation,
        payload,
    );
    rig.transport.send(&answer).await.unwrap();
}

#[tokio::test]
async fn test_full_negotiation_reaches_connected() {
    let rig = rig(MockMediaEngine::new(), fast_config());
    let session = SessionId::generate();
    let mut viewer = viewer_subscription(&rig, &session).await;
    let handle = spawn_session(&rig, &session).await;

    handle.start().await.unwrap();
    let offer = recv_kind(&mut viewer, MessageKind::Offer).await;
    assert_eq!(offer.incarnation, 1);
    assert_eq!(wait_for_phase(&handle, SessionPhase::AnsweringWait).await.incarnation, 1);

    answer_offer(&rig, &offer, 1).await;

    let snapshot = wait_for_phase(&handle, SessionPhase::Connected).await;
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert!(rig.engine.session_connected(&session));

    // The publisher forwarded its locally gathered candidate
    let candidate = recv_kind(&mut viewer, MessageKind::Candidate).await;
    assert_eq!(candidate.incarnation, 1);
}

#[tokio::test]
async fn test_negotiation_timeout_closes_session() {
    let rig = rig(MockMediaEngine::new(), fast_config());
    let session = SessionId::generate();
    let mut bus = rig.events.subscribe();
    let handle = spawn_session(&rig, &session).await;

    // Nobody ever answers
    handle.start().await.unwrap();

    let reason = wait_for_close(&mut bus, &session).await;
    assert_eq!(reason, CloseReason::NegotiationTimeout);
    assert!(handle.closed_at().is_some());
}

#[tokio::test]
async fn test_engine_offer_failure_closes_session() {
    let rig = rig(MockMediaEngine::new(), fast_config());
    rig.engine.fail_next_offers(1);
    let session = SessionId::generate();
    let mut bus = rig.events.subscribe();
    let handle = spawn_session(&rig, &session).await;

    handle.start().await.unwrap();

    let reason = wait_for_close(&mut bus, &session).await;
    assert_eq!(reason, CloseReason::MediaFailure);
    assert_eq!(rig.engine.offers_minted(&session), 0);
}

#[tokio::test]
async fn test_remote_bye_during_negotiation() {
    let rig = rig(MockMediaEngine::new(), fast_config());
    let session = SessionId::generate();
    let mut viewer = viewer_subscription(&rig, &session).await;
    let mut bus = rig.events.subscribe();
    let handle = spawn_session(&rig, &session).await;

    handle.start().await.unwrap();
    let offer = recv_kind(&mut viewer, MessageKind::Offer).await;

    let bye = SignalingMessage::bye(session.clone(), Role::Viewer, 1, offer.incarnation);
    rig.transport.send(&bye).await.unwrap();

    let reason = wait_for_close(&mut bus, &session).await;
    assert_eq!(reason, CloseReason::RemoteBye);
    assert!(handle.is_closed());
}

#[tokio::test]
async fn test_degraded_session_recovers_on_liveness() {
    let config = SessionConfig {
        // Long enough that recovery always lands inside the window
        degrade_timeout_ms: 500,
        ..fast_config()
    };
    let rig = rig(MockMediaEngine::new(), config);
    let session = SessionId::generate();
    let mut viewer = viewer_subscription(&rig, &session).await;
    let handle = spawn_session(&rig, &session).await;

    handle.start().await.unwrap();
    let offer = recv_kind(&mut viewer, MessageKind::Offer).await;
    answer_offer(&rig, &offer, 1).await;
    wait_for_phase(&handle, SessionPhase::Connected).await;

    handle
        .commands()
        .send(SessionCommand::LivenessChanged {
            healthy: false,
            misses: 3,
        })
        .await
        .unwrap();
    wait_for_phase(&handle, SessionPhase::Degraded).await;

    handle
        .commands()
        .send(SessionCommand::LivenessChanged {
            healthy: true,
            misses: 0,
        })
        .await
        .unwrap();
    let snapshot = wait_for_phase(&handle, SessionPhase::Connected).await;
    assert_eq!(snapshot.reconnect_attempts, 0);
    // Recovery keeps the original negotiation; no renegotiation happened
    assert_eq!(snapshot.incarnation, 1);
}

#[tokio::test]
async fn test_renegotiation_drops_stale_answer() {
    let rig = rig(MockMediaEngine::new(), fast_config());
    let session = SessionId::generate();
    let mut viewer = viewer_subscription(&rig, &session).await;
    let handle = spawn_session(&rig, &session).await;

    handle.start().await.unwrap();
    let offer = recv_kind(&mut viewer, MessageKind::Offer).await;
    answer_offer(&rig, &offer, 1).await;
    wait_for_phase(&handle, SessionPhase::Connected).await;

    // Degrade past the timeout so the worker renegotiates
    handle
        .commands()
        .send(SessionCommand::LivenessChanged {
            healthy: false,
            misses: 3,
        })
        .await
        .unwrap();
    let fresh_offer = recv_kind(&mut viewer, MessageKind::Offer).await;
    assert_eq!(fresh_offer.incarnation, 2);

    // An answer from the finished cycle must not reconnect the session
    answer_offer(
        &rig,
        &SignalingMessage {
            incarnation: 1,
            ..fresh_offer.clone()
        },
        2,
    )
    .await;
    sleep(Duration::from_millis(30)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::Reconnecting);

    // The current-incarnation answer completes the cycle
    answer_offer(&rig, &fresh_offer, 3).await;
    let snapshot = wait_for_phase(&handle, SessionPhase::Connected).await;
    assert_eq!(snapshot.incarnation, 2);
    assert_eq!(snapshot.reconnect_attempts, 0);
}

#[tokio::test]
async fn test_reconnect_attempts_exhausted() {
    let config = SessionConfig {
        reconnect_max_attempts: 1,
        ..fast_config()
    };
    let rig = rig(MockMediaEngine::manual(), config);
    let session = SessionId::generate();
    let mut viewer = viewer_subscription(&rig, &session).await;
    let mut bus = rig.events.subscribe();
    let handle = spawn_session(&rig, &session).await;

    handle.start().await.unwrap();
    let offer = recv_kind(&mut viewer, MessageKind::Offer).await;
    answer_offer(&rig, &offer, 1).await;
    wait_for_phase(&handle, SessionPhase::Negotiating).await;
    rig.engine.fire(&session, MediaEventKind::Connected);
    wait_for_phase(&handle, SessionPhase::Connected).await;

    // Degrade, renegotiate once, and let the attempt time out unanswered
    handle
        .commands()
        .send(SessionCommand::LivenessChanged {
            healthy: false,
            misses: 3,
        })
        .await
        .unwrap();
    let fresh_offer = recv_kind(&mut viewer, MessageKind::Offer).await;
    assert_eq!(fresh_offer.incarnation, 2);

    let reason = wait_for_close(&mut bus, &session).await;
    assert_eq!(reason, CloseReason::ReconnectExhausted);
}

#[tokio::test]
async fn test_teardown_sends_bye_and_worker_finishes() {
    let rig = rig(MockMediaEngine::new(), fast_config());
    let session = SessionId::generate();
    let mut viewer = viewer_subscription(&rig, &session).await;
    let mut bus = rig.events.subscribe();
    let handle = spawn_session(&rig, &session).await;

    handle.start().await.unwrap();
    let offer = recv_kind(&mut viewer, MessageKind::Offer).await;
    answer_offer(&rig, &offer, 1).await;
    wait_for_phase(&handle, SessionPhase::Connected).await;

    handle.teardown(CloseReason::LocalTeardown).await.unwrap();

    recv_kind(&mut viewer, MessageKind::Bye).await;
    let reason = wait_for_close(&mut bus, &session).await;
    assert_eq!(reason, CloseReason::LocalTeardown);

    // The worker is gone; further commands fail rather than hang
    sleep(Duration::from_millis(50)).await;
    assert!(handle.is_closed());
    assert!(handle.start().await.is_err());
}

#[tokio::test]
async fn test_start_is_ignored_outside_idle() {
    let rig = rig(MockMediaEngine::new(), fast_config());
    let session = SessionId::generate();
    let mut viewer = viewer_subscription(&rig, &session).await;
    let handle = spawn_session(&rig, &session).await;

    handle.start().await.unwrap();
    let first = recv_kind(&mut viewer, MessageKind::Offer).await;

    // A second Start must not mint a second negotiation cycle
    handle.start().await.unwrap();
    sleep(Duration::from_millis(30)).await;
    assert_eq!(rig.engine.offers_minted(&session), 1);

    answer_offer(&rig, &first, 1).await;
    wait_for_phase(&handle, SessionPhase::Connected).await;
}
