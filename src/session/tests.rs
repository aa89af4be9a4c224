//! Session store tests

use std::time::Duration;

use super::*;

#[test]
fn create_or_takeover_creates_fresh_session_with_no_session_present() {
    let store = SessionStore::new();
    let takeover = store.create_or_takeover("c1", true, 60, 50, 10);
    assert!(!takeover.session_present);
    assert!(!takeover.previous_online);
    assert_eq!(store.len(), 1);
}

#[test]
fn persisted_session_is_resumed_on_reconnect() {
    let store = SessionStore::new();
    let first = store.create_or_takeover("c1", false, 60, 50, 10);
    first.session.borrow_mut().subscriptions.insert("a/b".to_string(), QoS::AtLeastOnce);
    store.detach("c1");

    let second = store.create_or_takeover("c1", false, 60, 50, 10);
    assert!(second.session_present);
    assert!(!second.previous_online);
    assert!(second.session.borrow().subscriptions.contains_key("a/b"));
}

#[test]
fn clean_session_takeover_discards_persisted_state() {
    let store = SessionStore::new();
    let first = store.create_or_takeover("c1", false, 60, 50, 10);
    first.session.borrow_mut().subscriptions.insert("a/b".to_string(), QoS::AtLeastOnce);
    store.detach("c1");

    let second = store.create_or_takeover("c1", true, 60, 50, 10);
    assert!(!second.session_present);
    assert!(second.session.borrow().subscriptions.is_empty());
}

#[test]
fn takeover_of_online_session_reports_previous_online() {
    let store = SessionStore::new();
    store.create_or_takeover("c1", false, 60, 50, 10);
    let second = store.create_or_takeover("c1", false, 60, 50, 10);
    assert!(second.previous_online);
}

#[test]
fn detach_with_clean_session_deletes_the_record() {
    let store = SessionStore::new();
    store.create_or_takeover("c1", true, 60, 50, 10);
    let removed = store.detach("c1");
    assert!(removed);
    assert!(store.get("c1").is_none());
}

#[test]
fn detach_without_clean_session_persists_the_record() {
    let store = SessionStore::new();
    store.create_or_takeover("c1", false, 60, 50, 10);
    let removed = store.detach("c1");
    assert!(!removed);
    assert!(store.get("c1").is_some());
    assert!(!store.get("c1").unwrap().borrow().connected);
}

#[test]
fn expire_offline_only_removes_sessions_past_their_expiry() {
    let store = SessionStore::new();
    store.create_or_takeover("stale", false, 60, 50, 10);
    store.create_or_takeover("fresh", false, 60, 50, 10);
    store.detach("stale");
    store.detach("fresh");

    store.get("stale").unwrap().borrow_mut().disconnected_at =
        Some(std::time::Instant::now() - Duration::from_secs(3600));

    let expired = store.expire_offline(Duration::from_secs(60));
    assert_eq!(expired.len(), 1);
    assert_eq!(&*expired[0], "stale");
    assert!(store.get("stale").is_none());
    assert!(store.get("fresh").is_some());
}

#[test]
fn expire_offline_never_removes_connected_sessions() {
    let store = SessionStore::new();
    store.create_or_takeover("c1", false, 60, 50, 10);
    let expired = store.expire_offline(Duration::from_secs(0));
    assert!(expired.is_empty());
}

#[test]
fn keep_alive_expired_uses_no_keepalive_timeout_when_zero() {
    let session = Session::new(std::sync::Arc::from("c1"), true, 0, 50, 10);
    assert!(!session.keep_alive_expired(1.5, Duration::from_secs(3600)));
}

#[test]
fn keep_alive_expired_scales_by_factor() {
    let mut session = Session::new(std::sync::Arc::from("c1"), true, 1, 50, 10);
    session.last_activity_at = std::time::Instant::now() - Duration::from_millis(1600);
    assert!(session.keep_alive_expired(1.5, Duration::from_secs(3600)));
}
