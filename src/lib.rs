//! EdgeMQ — a native MQTT 3.1.1 broker for single-node, constrained
//! deployments (edge gateways, IoT hubs) where pulling in an external
//! broker process isn't an option.
//!
//! The crate is organized around the data flow described in its design
//! notes: bytes arrive on a socket, the [`codec`] turns them into
//! [`protocol`] packets, the per-connection state machine in [`broker`]
//! dispatches them, [`auth`] and [`hooks`] gate and observe what
//! happens, the [`topic`] tree decides who should see a PUBLISH, and
//! [`session`] tracks each client's QoS handshakes and offline queue.
//!
//! Everything here runs on a single cooperative event loop (a
//! `current_thread` tokio runtime driving one `LocalSet`) rather than a
//! multi-threaded, lock-based design — see `broker`'s module docs for
//! why that's a deliberate choice for this deployment target, not an
//! oversight.

pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod protocol;
pub mod session;
pub mod topic;

pub use auth::AuthProvider;
pub use broker::{Broker, BrokerHandle};
pub use config::Config;
pub use hooks::{CompositeHooks, Hooks, Interceptor, NoopHooks};
pub use protocol::QoS;
