use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// In-process counters for a room: open connections and message traffic.
///
/// Nothing serves these over the network; they are rendered into the log
/// when the server stops.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Tracks the number of open connections.
    pub connections: IntGauge,
    /// Counts complete frames read from peers.
    pub messages_received: IntCounter,
    /// Counts frames queued to peers, fan-out included.
    pub messages_sent: IntCounter,
    /// Counts broadcast targets that could not be reached.
    pub broadcast_failures: IntCounter,
    /// Prometheus registry used to store and manage the metrics.
    registry: Registry,
}

impl HealthMetrics {
    /// Creates the counters and registers them in a private registry.
    pub fn new() -> Self {
        let registry = Registry::new();
        let connections = IntGauge::new("connections", "Open connections")
            .expect("static metric definition");
        let messages_received = IntCounter::new("messages_received", "Frames received")
            .expect("static metric definition");
        let messages_sent = IntCounter::new("messages_sent", "Frames queued to peers")
            .expect("static metric definition");
        let broadcast_failures = IntCounter::new("broadcast_failures", "Unreachable broadcast targets")
            .expect("static metric definition");

        for collector in [
            Box::new(connections.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(messages_received.clone()),
            Box::new(messages_sent.clone()),
            Box::new(broadcast_failures.clone()),
        ] {
            // Names are unique within a fresh registry.
            let _ = registry.register(collector);
        }

        Self {
            connections,
            messages_received,
            messages_sent,
            broadcast_failures,
            registry,
        }
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn expose_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::new()
    }
}
