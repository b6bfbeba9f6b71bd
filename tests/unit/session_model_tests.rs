//! Unit tests for session lifecycle and the session registry.

use std::sync::Arc;
use std::time::Duration;

use datagate::models::message::RequestId;
use datagate::models::session::{Session, StreamState, TransportKind};
use datagate::session::registry::SessionRegistry;
use datagate::AppError;

#[test]
fn session_ids_are_unique() {
    let a = Session::new(TransportKind::Http, "2025-03-26".into(), 4);
    let b = Session::new(TransportKind::Http, "2025-03-26".into(), 4);
    assert_ne!(a.id(), b.id());
    assert_eq!(a.transport(), TransportKind::Http);
}

#[test]
fn cancel_request_signals_only_that_request() {
    let session = Arc::new(Session::new(TransportKind::Http, "2025-03-26".into(), 4));
    let one = session.begin_request(&RequestId::Number(1)).expect("claim");
    let two = session
        .begin_request(&RequestId::Text("two".into()))
        .expect("claim");
    assert_eq!(session.inflight_count(), 2);

    assert!(session.cancel_request(&RequestId::Number(1)));
    assert!(one.token().is_cancelled());
    assert!(!two.token().is_cancelled());
    assert!(!session.cancel_request(&RequestId::Number(99)));

    drop(one);
    drop(two);
    assert_eq!(session.inflight_count(), 0);
}

#[test]
fn terminate_cancels_inflight_requests() {
    let session = Arc::new(Session::new(TransportKind::Http, "2025-03-26".into(), 4));
    let guard = session.begin_request(&RequestId::Number(5)).expect("claim");
    session.terminate();
    assert!(guard.token().is_cancelled());
    assert!(session.is_terminated());
    assert_eq!(session.stream_state(), StreamState::Closed);
}

#[test]
fn attaching_a_stream_bumps_the_generation_watch() {
    let session = Session::new(TransportKind::Http, "2025-03-26".into(), 4);
    let mut generation = session.stream_generation();
    assert_eq!(*generation.borrow_and_update(), 0);

    let first = session.attach_stream().expect("attach");
    assert!(generation.has_changed().expect("sender alive"));
    assert_eq!(*generation.borrow_and_update(), first);

    let second = session.attach_stream().expect("attach");
    assert_eq!(*generation.borrow_and_update(), second);
    assert!(session.is_current_stream(second));
}

#[test]
fn published_events_get_increasing_sequence_numbers() {
    let session = Session::new(TransportKind::Http, "2025-03-26".into(), 4);
    let a = session.publish(serde_json::json!({"n": 1}));
    let b = session.publish(serde_json::json!({"n": 2}));
    assert!(b.seq > a.seq);
    assert_eq!(session.events().latest_seq(), b.seq);
}

#[test]
fn registry_lookup_and_terminate() {
    let registry = SessionRegistry::new(Duration::from_secs(60), 16);
    let session = registry.create("2025-06-18");
    assert_eq!(registry.len(), 1);
    assert_eq!(session.protocol_version(), "2025-06-18");

    let found = registry.lookup(session.id()).expect("lookup");
    assert!(Arc::ptr_eq(&found, &session));

    registry.terminate(session.id()).expect("terminate");
    assert!(session.is_terminated());
    assert!(registry.is_empty());

    let err = registry.lookup(session.id()).expect_err("gone");
    assert!(matches!(err, AppError::UnknownSession(_)));
    let err = registry.terminate(session.id()).expect_err("gone");
    assert!(matches!(err, AppError::UnknownSession(_)));

    let counters = registry.counters();
    assert_eq!(counters.created, 1);
    assert_eq!(counters.terminated, 1);
    assert_eq!(counters.active, 0);
}

#[test]
fn unknown_session_id_is_rejected() {
    let registry = SessionRegistry::new(Duration::from_secs(60), 16);
    let err = registry.lookup("not-a-session").expect_err("unknown");
    assert!(matches!(err, AppError::UnknownSession(_)));
}

#[test]
fn idle_sessions_are_reaped() {
    let registry = SessionRegistry::new(Duration::ZERO, 16);
    let session = registry.create("2025-03-26");

    assert!(registry.lookup(session.id()).is_err());
    assert_eq!(registry.reap_idle(), 1);
    assert!(session.is_terminated());
    assert!(registry.is_empty());
    assert_eq!(registry.counters().expired, 1);
}

#[test]
fn close_all_terminates_everything() {
    let registry = SessionRegistry::new(Duration::from_secs(60), 16);
    let a = registry.create("2025-03-26");
    let b = registry.create("2025-03-26");
    registry.close_all();
    assert!(registry.is_empty());
    assert!(a.is_terminated());
    assert!(b.is_terminated());
}
