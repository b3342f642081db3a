//! End-to-end session lifecycle against a fake receiver and stub runners.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FnRunnerFactory, SERVICE_REF, harness, spawn_fake_receiver, test_config};
use xg2g::errors::OrchestratorError;
use xg2g::models::{ExitReason, SessionState};
use xg2g::orchestrator::SessionEvent;
use xg2g::runner::StubRunner;

#[tokio::test]
async fn session_reaches_ready_and_publishes_a_playlist() {
    let (addr, _receiver) = spawn_fake_receiver().await;
    let data = tempfile::tempdir().unwrap();
    let hls = tempfile::tempdir().unwrap();
    let h = harness(
        test_config(addr, data.path(), hls.path()),
        Arc::new(FnRunnerFactory::new(StubRunner::healthy)),
    )
    .await;

    let mut events = h.orchestrator.subscribe();
    let session_id = h
        .orchestrator
        .start_intent(SERVICE_REF, None, None)
        .await
        .unwrap();

    h.wait_for_state(&session_id, SessionState::Ready, Duration::from_secs(3))
        .await;

    // the promoted playlist exists, is non-empty, and references segments
    // that exist on disk
    let playlist = hls
        .path()
        .join("sessions")
        .join(&session_id)
        .join("index.m3u8");
    let content = tokio::fs::read_to_string(&playlist).await.unwrap();
    assert!(content.starts_with("#EXTM3U"));
    assert!(content.contains("seg_000001.ts"));

    // SessionReady is never observed before the promotion
    let mut saw_started = false;
    let mut saw_ready = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        match event {
            SessionEvent::SessionStarted { .. } => saw_started = true,
            SessionEvent::SessionReady { .. } => {
                assert!(saw_started, "ready before started");
                saw_ready = true;
                break;
            }
            SessionEvent::SessionStopped { .. } => panic!("premature stop"),
        }
    }
    assert!(saw_ready);
}

#[tokio::test]
async fn stop_intent_reaches_terminal_state_with_ctx_cancel() {
    let (addr, _receiver) = spawn_fake_receiver().await;
    let data = tempfile::tempdir().unwrap();
    let hls = tempfile::tempdir().unwrap();
    let h = harness(
        test_config(addr, data.path(), hls.path()),
        Arc::new(FnRunnerFactory::new(StubRunner::healthy)),
    )
    .await;

    let session_id = h
        .orchestrator
        .start_intent(SERVICE_REF, None, None)
        .await
        .unwrap();
    h.wait_for_state(&session_id, SessionState::Ready, Duration::from_secs(3))
        .await;

    let mut events = h.orchestrator.subscribe();
    h.orchestrator.stop_intent(&session_id).await.unwrap();

    let snapshot = h
        .orchestrator
        .query(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.state, SessionState::Stopped);
    assert_eq!(snapshot.exit.as_ref().unwrap().reason, ExitReason::CtxCancel);
    assert!(snapshot.ended_at.is_some());

    // exactly one SessionStopped on the bus
    let mut stops = 0;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        if matches!(event, SessionEvent::SessionStopped { .. }) {
            stops += 1;
        }
    }
    assert_eq!(stops, 1);

    // the terminal exit is durable
    let exit = h.store.get_exit(&session_id).await.unwrap().unwrap();
    assert_eq!(exit.reason, ExitReason::CtxCancel);
}

#[tokio::test]
async fn identical_idempotency_keys_return_the_same_session() {
    let (addr, _receiver) = spawn_fake_receiver().await;
    let data = tempfile::tempdir().unwrap();
    let hls = tempfile::tempdir().unwrap();
    let h = harness(
        test_config(addr, data.path(), hls.path()),
        Arc::new(FnRunnerFactory::new(StubRunner::healthy)),
    )
    .await;

    let first = h
        .orchestrator
        .start_intent(SERVICE_REF, None, Some("k-abc"))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .start_intent(SERVICE_REF, None, Some("k-abc"))
        .await
        .unwrap();
    assert_eq!(first, second);

    // a different key allocates a fresh session
    let third = h
        .orchestrator
        .start_intent(SERVICE_REF, None, Some("k-other"))
        .await
        .unwrap();
    assert_ne!(first, third);
    assert_eq!(h.orchestrator.active_session_count(), 2);
}

#[tokio::test]
async fn failing_transcoder_stops_the_session_with_error() {
    let (addr, _receiver) = spawn_fake_receiver().await;
    let data = tempfile::tempdir().unwrap();
    let hls = tempfile::tempdir().unwrap();
    let h = harness(
        test_config(addr, data.path(), hls.path()),
        Arc::new(FnRunnerFactory::new(|| {
            StubRunner::failing(Duration::from_millis(50), 1)
        })),
    )
    .await;

    let session_id = h
        .orchestrator
        .start_intent(SERVICE_REF, None, None)
        .await
        .unwrap();
    h.wait_for_state(&session_id, SessionState::Stopped, Duration::from_secs(3))
        .await;

    let snapshot = h.orchestrator.query(&session_id).await.unwrap().unwrap();
    let exit = snapshot.exit.unwrap();
    assert_eq!(exit.reason, ExitReason::Error);
    assert_eq!(exit.code, 1);
    // the stderr ring tail is retained for post-mortem reporting
    assert!(!snapshot.last_log_lines.is_empty());
}

#[tokio::test]
async fn repeated_failures_open_the_circuit_breaker() {
    let (addr, _receiver) = spawn_fake_receiver().await;
    let data = tempfile::tempdir().unwrap();
    let hls = tempfile::tempdir().unwrap();
    let mut config = test_config(addr, data.path(), hls.path());
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.reset_timeout = Duration::from_secs(60);
    let h = harness(
        config,
        Arc::new(FnRunnerFactory::new(|| {
            StubRunner::failing(Duration::from_millis(20), 1)
        })),
    )
    .await;

    for _ in 0..2 {
        let id = h
            .orchestrator
            .start_intent(SERVICE_REF, None, None)
            .await
            .unwrap();
        h.wait_for_state(&id, SessionState::Stopped, Duration::from_secs(3))
            .await;
    }

    let err = h
        .orchestrator
        .start_intent(SERVICE_REF, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::CircuitOpen));
}

#[tokio::test]
async fn sessions_are_destroyed_after_the_grace_interval() {
    let (addr, _receiver) = spawn_fake_receiver().await;
    let data = tempfile::tempdir().unwrap();
    let hls = tempfile::tempdir().unwrap();
    let h = harness(
        test_config(addr, data.path(), hls.path()),
        Arc::new(FnRunnerFactory::new(StubRunner::healthy)),
    )
    .await;

    let session_id = h
        .orchestrator
        .start_intent(SERVICE_REF, None, None)
        .await
        .unwrap();
    h.wait_for_state(&session_id, SessionState::Ready, Duration::from_secs(3))
        .await;
    h.orchestrator.stop_intent(&session_id).await.unwrap();

    // grace is 250ms in the test config; the registry entry and the live
    // session dir both go away
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let session_dir = hls.path().join("sessions").join(&session_id);
    loop {
        if h.orchestrator.active_session_count() == 0 && !session_dir.exists() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "session lingered");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // the durable record survives destruction
    let record = h.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(record.state, SessionState::Stopped);

    // stop on the destroyed session is a no-op, unknown ids still fail
    h.orchestrator.stop_intent(&session_id).await.unwrap();
    assert!(matches!(
        h.orchestrator.stop_intent("sess-unknown").await,
        Err(OrchestratorError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn invalid_service_refs_and_profiles_are_rejected() {
    let (addr, _receiver) = spawn_fake_receiver().await;
    let data = tempfile::tempdir().unwrap();
    let hls = tempfile::tempdir().unwrap();
    let h = harness(
        test_config(addr, data.path(), hls.path()),
        Arc::new(FnRunnerFactory::new(StubRunner::healthy)),
    )
    .await;

    assert!(matches!(
        h.orchestrator.start_intent("bad/../ref", None, None).await,
        Err(OrchestratorError::InvalidServiceRef(_))
    ));
    assert!(matches!(
        h.orchestrator
            .start_intent(SERVICE_REF, Some("nope"), None)
            .await,
        Err(OrchestratorError::UnknownProfile(_))
    ));
}
