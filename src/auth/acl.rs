//! Role-based topic ACL, layered on top of a [`DictionaryAuthProvider`].
//!
//! Static roles, each with a list of publish/subscribe topic patterns,
//! plus `%c`/`%u` variable substitution for per-client and per-user
//! topic spaces.

use std::collections::HashMap;
use std::rc::Rc;

use crate::config::AclConfig;
use crate::protocol::QoS;
use crate::topic::topic_matches_filter;

use super::{AuthProvider, DictionaryAuthProvider, SubscribeAuthorization};

struct RoleEntry {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

/// Wraps a [`DictionaryAuthProvider`] (for authentication and username
/// tracking) with per-role publish/subscribe topic patterns.
///
/// A client with no role, including an anonymous one, is denied
/// everything — there is no separate default allow-list. Patterns
/// support the usual `+`/`#` wildcards plus `%c` (client identifier) and
/// `%u` (username) substitution.
pub struct RoleAclAuthProvider {
    inner: Rc<DictionaryAuthProvider>,
    roles: HashMap<String, RoleEntry>,
}

impl RoleAclAuthProvider {
    pub fn new(config: &AclConfig, inner: Rc<DictionaryAuthProvider>) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|r| {
                (
                    r.name.clone(),
                    RoleEntry {
                        publish: r.publish.clone(),
                        subscribe: r.subscribe.clone(),
                    },
                )
            })
            .collect();
        Self { inner, roles }
    }

    fn role_for(&self, client_id: &str) -> Option<&RoleEntry> {
        let username = self.inner.username_of(client_id)?;
        let role_name = self.inner.role_of(&username)?;
        self.roles.get(&role_name)
    }

    fn substitute(pattern: &str, client_id: &str, username: Option<&str>) -> String {
        pattern
            .replace("%c", client_id)
            .replace("%u", username.unwrap_or(""))
    }

    fn any_pattern_matches(patterns: &[String], topic: &str, client_id: &str, username: Option<&str>) -> bool {
        patterns
            .iter()
            .any(|p| topic_matches_filter(topic, &Self::substitute(p, client_id, username)))
    }
}

impl AuthProvider for RoleAclAuthProvider {
    fn authenticate(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>) -> bool {
        self.inner.authenticate(client_id, username, password)
    }

    fn authorize_publish(&self, client_id: &str, topic: &str) -> bool {
        let Some(role) = self.role_for(client_id) else {
            return false;
        };
        let username = self.inner.username_of(client_id);
        Self::any_pattern_matches(&role.publish, topic, client_id, username.as_deref())
    }

    fn authorize_subscribe(&self, client_id: &str, filter: &str) -> SubscribeAuthorization {
        let Some(role) = self.role_for(client_id) else {
            return SubscribeAuthorization::Denied;
        };
        let username = self.inner.username_of(client_id);
        if Self::any_pattern_matches(&role.subscribe, filter, client_id, username.as_deref()) {
            SubscribeAuthorization::Granted(QoS::ExactlyOnce)
        } else {
            SubscribeAuthorization::Denied
        }
    }

    fn forget_client(&self, client_id: &str) {
        self.inner.forget_client(client_id);
    }
}
