//! Auth module tests

use super::*;
use crate::config::{AuthConfig, UserConfig};

fn make_config(users: Vec<UserConfig>) -> AuthConfig {
    AuthConfig {
        enabled: true,
        users,
    }
}

fn user(username: &str, password: &str) -> UserConfig {
    UserConfig {
        username: username.to_string(),
        password: password.to_string(),
        role: None,
    }
}

#[test]
fn allow_all_accepts_any_credentials() {
    let provider = AllowAllAuthProvider;
    assert!(provider.authenticate("c1", None, None));
    assert!(provider.authenticate("c1", Some("anyone"), Some(b"wrong")));
    assert!(provider.authorize_publish("c1", "a/b"));
}

#[test]
fn dictionary_accepts_correct_password() {
    let provider = DictionaryAuthProvider::new(&make_config(vec![user("alice", "secret")]), false);
    assert!(provider.authenticate("c1", Some("alice"), Some(b"secret")));
}

#[test]
fn dictionary_rejects_wrong_password() {
    let provider = DictionaryAuthProvider::new(&make_config(vec![user("alice", "secret")]), false);
    assert!(!provider.authenticate("c1", Some("alice"), Some(b"wrong")));
}

#[test]
fn dictionary_rejects_unknown_username() {
    let provider = DictionaryAuthProvider::new(&make_config(vec![user("alice", "secret")]), false);
    assert!(!provider.authenticate("c1", Some("bob"), Some(b"secret")));
}

#[test]
fn dictionary_anonymous_gated_by_allow_anonymous() {
    let denies = DictionaryAuthProvider::new(&make_config(vec![]), false);
    assert!(!denies.authenticate("c1", None, None));

    let allows = DictionaryAuthProvider::new(&make_config(vec![]), true);
    assert!(allows.authenticate("c1", None, None));
}

#[test]
fn dictionary_remembers_username_until_forgotten() {
    let provider = DictionaryAuthProvider::new(&make_config(vec![user("alice", "secret")]), false);
    provider.authenticate("c1", Some("alice"), Some(b"secret"));
    assert_eq!(provider.username_of("c1"), Some("alice".to_string()));

    provider.forget_client("c1");
    assert_eq!(provider.username_of("c1"), None);
}

#[test]
fn dictionary_allows_publish_and_subscribe_unconditionally() {
    let provider = DictionaryAuthProvider::new(&make_config(vec![user("alice", "secret")]), false);
    assert!(provider.authorize_publish("c1", "any/topic"));
    assert_eq!(
        provider.authorize_subscribe("c1", "any/+"),
        SubscribeAuthorization::Granted(QoS::ExactlyOnce)
    );
}
