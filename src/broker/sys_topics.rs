//! `$SYS/*` stats publisher: every `stats_interval`,
//! publishes the broker's aggregate counters as retained QoS 0 messages.

use std::rc::Rc;

use bytes::Bytes;

use crate::protocol::{Packet, Publish, QoS};

use super::{router, BrokerCore};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Publishes every `$SYS/*` topic as a retained message and
/// fans it out to any live subscriber, bypassing the interceptor/hook
/// pipeline (this is broker telemetry, not a client publish).
pub fn publish_stats(core: &BrokerCore) {
    let uptime = core.start_time.elapsed().as_secs();
    publish(core, "$SYS/broker/version", VERSION.to_string());
    publish(core, "$SYS/broker/uptime", uptime.to_string());

    let counters = core.counters.borrow();
    publish(core, "$SYS/broker/clients/connected", core.connected_client_count().to_string());
    publish(core, "$SYS/broker/clients/total", counters.clients_total.to_string());
    publish(core, "$SYS/broker/messages/received", counters.messages_received.to_string());
    publish(core, "$SYS/broker/messages/sent", counters.messages_sent.to_string());
    publish(core, "$SYS/broker/messages/publish/received", counters.publish_received.to_string());
    publish(core, "$SYS/broker/messages/publish/sent", counters.publish_sent.to_string());
    publish(core, "$SYS/broker/bytes/received", counters.bytes_received.to_string());
    publish(core, "$SYS/broker/bytes/sent", counters.bytes_sent.to_string());
    drop(counters);
    publish(core, "$SYS/broker/subscriptions/count", core.subscriptions.borrow().total_subscription_count().to_string());
    publish(core, "$SYS/broker/messages/retained/count", core.retained.borrow().len().to_string());
    publish(core, "$SYS/broker/load/connections", core.connected_client_count().to_string());

    #[cfg(target_os = "linux")]
    if let Some((free, used)) = super::read_proc_statm() {
        publish(core, "$SYS/broker/heap/free", free.to_string());
        publish(core, "$SYS/broker/heap/used", used.to_string());
    }
}

fn publish(core: &BrokerCore, topic: &str, value: String) {
    let payload = Bytes::from(value);
    core.retained.borrow_mut().publish(topic, payload.clone(), QoS::AtMostOnce);

    let subscribers = core.subscriptions.borrow().matches(topic);
    for sub in subscribers {
        if !core.connections.borrow().contains_key(&sub.client_id) {
            continue;
        }
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: true,
            topic: std::sync::Arc::from(topic),
            packet_id: None,
            payload: payload.clone(),
        };
        router::send(core, &sub.client_id, &Packet::Publish(publish));
    }
}

/// Runs the stats publisher loop: publishes immediately on startup, then
/// every `stats_interval` until `shutdown` fires.
pub async fn spawn_stats_publisher(core: Rc<BrokerCore>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let interval = core.config.timing.stats_interval();
    let mut ticker = tokio::time::interval(interval);

    publish_stats(&core);

    loop {
        tokio::select! {
            _ = ticker.tick() => publish_stats(&core),
            _ = shutdown.changed() => if *shutdown.borrow() { break },
        }
    }
}
