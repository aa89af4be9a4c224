//! Interceptor and hook capability interfaces.
//!
//! Two distinct extension points, kept deliberately separate:
//!
//! - [`Hooks`] are named observation/veto callbacks fired at specific
//!   lifecycle points (connect, publish, subscribe, unsubscribe,
//!   disconnect, will publication). They are synchronous and run on the
//!   single event-loop thread, blocking it while they execute, so an
//!   async signature would buy nothing.
//! - [`Interceptor`]s form an ordered pipeline that runs once per
//!   message, before routing, and may rewrite or drop it via a mutable
//!   [`MessageContext`].
//!
//! Authentication/authorization checks live entirely behind
//! `auth::AuthProvider` instead, so `Hooks` only ever observes or vetoes
//! — it never decides whether a client is who it claims to be.

use bytes::Bytes;

use crate::protocol::QoS;


/// Broker lifecycle hooks.
///
/// Every method has a default implementation, so an embedder only
/// overrides the events it cares about. Defaults allow/observe and
/// never veto.
pub trait Hooks {
    /// Called after CONNACK is sent with a success return code.
    fn on_connect(&self, _client_id: &str, _username: Option<&str>) {}

    /// Called for every PUBLISH this session sends, after the
    /// interceptor pipeline and authorization have both passed.
    fn on_publish(&self, _client_id: &str, _topic: &str, _payload: &[u8], _qos: QoS, _retain: bool) {}

    /// Called for each filter in a SUBSCRIBE that passed
    /// authorization, with the QoS that will be granted. Returning
    /// `Some(qos)` overrides the granted QoS (e.g. to downgrade it);
    /// returning `None` turns the grant into a SUBACK failure
    /// (`0x80`) for that filter.
    fn on_subscribe(&self, _client_id: &str, _filter: &str, requested_qos: QoS) -> Option<QoS> {
        Some(requested_qos)
    }

    fn on_unsubscribe(&self, _client_id: &str, _filter: &str) {}

    /// Called when a session is torn down, graceful or not.
    fn on_disconnect(&self, _client_id: &str, _graceful: bool) {}

    /// Called before a will message is routed. Returning `false`
    /// suppresses publication.
    fn on_will_publish(&self, _client_id: &str, _topic: &str) -> bool {
        true
    }
}

/// No-op [`Hooks`] implementation; the default when no collaborator is
/// configured.
#[derive(Default)]
pub struct NoopHooks;

impl Hooks for NoopHooks {}

/// Chains multiple [`Hooks`] implementations in registration order.
///
/// Veto-style callbacks (`on_subscribe`, `on_will_publish`) are folded:
/// the first denial or the lowest overridden QoS wins, and every
/// member still runs its observational callbacks even after an
/// earlier member has vetoed.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }
}

impl Hooks for CompositeHooks {
    fn on_connect(&self, client_id: &str, username: Option<&str>) {
        for h in &self.hooks {
            h.on_connect(client_id, username);
        }
    }

    fn on_publish(&self, client_id: &str, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        for h in &self.hooks {
            h.on_publish(client_id, topic, payload, qos, retain);
        }
    }

    fn on_subscribe(&self, client_id: &str, filter: &str, requested_qos: QoS) -> Option<QoS> {
        let mut granted = Some(requested_qos);
        for h in &self.hooks {
            let current = granted?;
            granted = h.on_subscribe(client_id, filter, current);
        }
        granted
    }

    fn on_unsubscribe(&self, client_id: &str, filter: &str) {
        for h in &self.hooks {
            h.on_unsubscribe(client_id, filter);
        }
    }

    fn on_disconnect(&self, client_id: &str, graceful: bool) {
        for h in &self.hooks {
            h.on_disconnect(client_id, graceful);
        }
    }

    fn on_will_publish(&self, client_id: &str, topic: &str) -> bool {
        let mut allowed = true;
        for h in &self.hooks {
            if !h.on_will_publish(client_id, topic) {
                allowed = false;
            }
        }
        allowed
    }
}

/// A message in flight through the interceptor pipeline.
///
/// Interceptors see the same context instance in registration order
/// and may rewrite `topic`/`payload`/`qos`/`retain` in place; calling
/// [`MessageContext::drop`] marks the message to be discarded once the
/// pipeline finishes, without short-circuiting remaining interceptors.
pub struct MessageContext {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    dropped: bool,
}

impl MessageContext {
    pub fn new(topic: String, payload: Bytes, qos: QoS, retain: bool) -> Self {
        Self {
            topic,
            payload,
            qos,
            retain,
            dropped: false,
        }
    }

    pub fn drop(&mut self) {
        self.dropped = true;
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }
}

/// A single stage in the pre-routing interceptor pipeline.
pub trait Interceptor {
    fn intercept(&self, ctx: &mut MessageContext);
}

/// An ordered list of [`Interceptor`]s, run once per inbound PUBLISH
/// before it reaches the router.
#[derive(Default)]
pub struct InterceptorChain {
    stages: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn add<I: Interceptor + 'static>(&mut self, interceptor: I) {
        self.stages.push(Box::new(interceptor));
    }

    pub fn with<I: Interceptor + 'static>(mut self, interceptor: I) -> Self {
        self.add(interceptor);
        self
    }

    /// Runs every stage in order, even after one marks the message
    /// dropped — a later stage may still want to observe it.
    pub fn run(&self, ctx: &mut MessageContext) {
        for stage in &self.stages {
            stage.intercept(ctx);
        }
    }
}
