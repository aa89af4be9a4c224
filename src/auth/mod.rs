//! Authentication / authorization capability interface.
//!
//! The broker core depends only on the [`AuthProvider`] trait:
//! `authenticate`, `authorize_publish`, `authorize_subscribe`. The
//! concrete providers below — dictionary, role-based ACL, user-callback —
//! are collaborators built against that interface, not part of the core
//! itself; a deployment can swap in its own.
//!
//! Every method here is synchronous: hook and auth callbacks run on the
//! single event-loop thread and are never awaited, so there is nothing
//! to gain (and correctness to lose) from giving them an async signature.

mod acl;
mod callback;

pub use acl::RoleAclAuthProvider;
pub use callback::CallbackAuthProvider;

use std::cell::RefCell;
use std::collections::HashMap;

use crate::config::AuthConfig;
use crate::protocol::QoS;

/// Result of a SUBSCRIBE authorization check: the granted QoS, or denial.
///
/// Mirrors the `{0,1,2,-1}` return domain conventionally used for
/// `authorize_subscribe` without relying on a signed integer at call
/// sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeAuthorization {
    Granted(QoS),
    Denied,
}

/// The capability interface every auth/ACL collaborator implements.
///
/// `client_id` identifies the calling session throughout; providers that
/// need the authenticated username for later publish/subscribe checks
/// are expected to remember it themselves (see [`DictionaryAuthProvider`]).
pub trait AuthProvider {
    /// Called once during the CONNECT handshake.
    fn authenticate(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>) -> bool;

    /// Called for every PUBLISH the session sends.
    fn authorize_publish(&self, client_id: &str, topic: &str) -> bool;

    /// Called for every filter in a SUBSCRIBE.
    fn authorize_subscribe(&self, client_id: &str, filter: &str) -> SubscribeAuthorization;

    /// Called when a session is torn down, so providers that cache
    /// per-client state (the authenticated username, in particular) can
    /// release it.
    fn forget_client(&self, _client_id: &str) {}
}

/// Accepts every connection, publish, and subscribe. The default when no
/// auth collaborator is configured and `allow_anonymous=true`.
pub struct AllowAllAuthProvider;

impl AuthProvider for AllowAllAuthProvider {
    fn authenticate(&self, _client_id: &str, _username: Option<&str>, _password: Option<&[u8]>) -> bool {
        true
    }

    fn authorize_publish(&self, _client_id: &str, _topic: &str) -> bool {
        true
    }

    fn authorize_subscribe(&self, _client_id: &str, _filter: &str) -> SubscribeAuthorization {
        SubscribeAuthorization::Granted(QoS::ExactlyOnce)
    }
}

struct UserEntry {
    password: String,
    role: Option<String>,
}

/// Plaintext username/password dictionary, loaded from [`AuthConfig`].
///
/// Remembers each connected client's username (keyed by client
/// identifier) so that [`RoleAclAuthProvider`] can look up its role
/// without threading the username through every publish/subscribe call.
pub struct DictionaryAuthProvider {
    allow_anonymous: bool,
    users: HashMap<String, UserEntry>,
    client_usernames: RefCell<HashMap<String, Option<String>>>,
}

impl DictionaryAuthProvider {
    pub fn new(config: &AuthConfig, allow_anonymous: bool) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| {
                (
                    u.username.clone(),
                    UserEntry {
                        password: u.password.clone(),
                        role: u.role.clone(),
                    },
                )
            })
            .collect();

        Self {
            allow_anonymous,
            users,
            client_usernames: RefCell::new(HashMap::new()),
        }
    }

    /// The role assigned to `username` in the static user table, if any.
    pub fn role_of(&self, username: &str) -> Option<String> {
        self.users.get(username).and_then(|u| u.role.clone())
    }

    /// The username a connected client authenticated with, if any.
    pub fn username_of(&self, client_id: &str) -> Option<String> {
        self.client_usernames
            .borrow()
            .get(client_id)
            .cloned()
            .flatten()
    }
}

impl AuthProvider for DictionaryAuthProvider {
    fn authenticate(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>) -> bool {
        let accepted = match username {
            None => self.allow_anonymous,
            Some(username) => match self.users.get(username) {
                Some(entry) => {
                    let supplied = password.unwrap_or(&[]);
                    std::str::from_utf8(supplied)
                        .map(|s| s == entry.password)
                        .unwrap_or(false)
                }
                None => false,
            },
        };

        if accepted {
            self.client_usernames
                .borrow_mut()
                .insert(client_id.to_string(), username.map(str::to_string));
        }
        accepted
    }

    fn authorize_publish(&self, _client_id: &str, _topic: &str) -> bool {
        true
    }

    fn authorize_subscribe(&self, _client_id: &str, _filter: &str) -> SubscribeAuthorization {
        SubscribeAuthorization::Granted(QoS::ExactlyOnce)
    }

    fn forget_client(&self, client_id: &str) {
        self.client_usernames.borrow_mut().remove(client_id);
    }
}

#[cfg(test)]
mod tests;
