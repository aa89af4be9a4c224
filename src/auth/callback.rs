//! User-supplied closures as an auth collaborator.
//!
//! Lets an embedding application authorize without writing a full
//! `AuthProvider` impl — useful for one-off deployments or tests. Closures
//! are `Rc`-boxed rather than `Arc`-boxed since the broker core never
//! leaves the single event-loop thread.

use std::rc::Rc;

use super::{AuthProvider, SubscribeAuthorization};

type AuthenticateFn = dyn Fn(&str, Option<&str>, Option<&[u8]>) -> bool;
type AuthorizePublishFn = dyn Fn(&str, &str) -> bool;
type AuthorizeSubscribeFn = dyn Fn(&str, &str) -> SubscribeAuthorization;

/// An [`AuthProvider`] built from three closures. Any omitted callback
/// defaults to "allow everything" for that check.
pub struct CallbackAuthProvider {
    authenticate: Rc<AuthenticateFn>,
    authorize_publish: Rc<AuthorizePublishFn>,
    authorize_subscribe: Rc<AuthorizeSubscribeFn>,
}

impl CallbackAuthProvider {
    pub fn new() -> Self {
        Self {
            authenticate: Rc::new(|_, _, _| true),
            authorize_publish: Rc::new(|_, _| true),
            authorize_subscribe: Rc::new(|_, _| SubscribeAuthorization::Granted(crate::protocol::QoS::ExactlyOnce)),
        }
    }

    pub fn on_authenticate(mut self, f: impl Fn(&str, Option<&str>, Option<&[u8]>) -> bool + 'static) -> Self {
        self.authenticate = Rc::new(f);
        self
    }

    pub fn on_authorize_publish(mut self, f: impl Fn(&str, &str) -> bool + 'static) -> Self {
        self.authorize_publish = Rc::new(f);
        self
    }

    pub fn on_authorize_subscribe(mut self, f: impl Fn(&str, &str) -> SubscribeAuthorization + 'static) -> Self {
        self.authorize_subscribe = Rc::new(f);
        self
    }
}

impl Default for CallbackAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthProvider for CallbackAuthProvider {
    fn authenticate(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>) -> bool {
        (self.authenticate)(client_id, username, password)
    }

    fn authorize_publish(&self, client_id: &str, topic: &str) -> bool {
        (self.authorize_publish)(client_id, topic)
    }

    fn authorize_subscribe(&self, client_id: &str, filter: &str) -> SubscribeAuthorization {
        (self.authorize_subscribe)(client_id, filter)
    }
}
