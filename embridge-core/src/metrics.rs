//! Connector metrics.
//!
//! Recorded through the `metrics` facade; installing an exporter is up to the
//! embedding process.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metrics handle labelled with the connection name and destination
#[derive(Debug, Clone)]
pub struct BridgeMetrics {
    connection: String,
    destination: String,
}

impl BridgeMetrics {
    pub fn new(connection: &str, destination: &str) -> Self {
        Self {
            connection: connection.to_string(),
            destination: destination.to_string(),
        }
    }

    /// Inbound message handed to the pipeline
    pub fn record_received(&self) {
        counter!("embridge_messages_received_total", "connection" => self.connection.clone(), "destination" => self.destination.clone())
            .increment(1);
    }

    pub fn record_acked(&self) {
        counter!("embridge_messages_acked_total", "connection" => self.connection.clone(), "destination" => self.destination.clone())
            .increment(1);
    }

    pub fn record_rolled_back(&self) {
        counter!("embridge_session_rollbacks_total", "connection" => self.connection.clone(), "destination" => self.destination.clone())
            .increment(1);
    }

    pub fn record_unsupported(&self, kind: &str) {
        counter!("embridge_unsupported_messages_total", "connection" => self.connection.clone(), "kind" => kind.to_string())
            .increment(1);
    }

    /// Outbound send confirmed by the broker
    pub fn record_sent(&self, latency: Duration) {
        counter!("embridge_messages_sent_total", "connection" => self.connection.clone(), "destination" => self.destination.clone())
            .increment(1);
        histogram!("embridge_send_latency_seconds", "connection" => self.connection.clone())
            .record(latency.as_secs_f64());
    }

    pub fn record_send_failure(&self) {
        counter!("embridge_send_failures_total", "connection" => self.connection.clone(), "destination" => self.destination.clone())
            .increment(1);
    }

    pub fn record_reconnect(&self) {
        counter!("embridge_reconnects_total", "connection" => self.connection.clone())
            .increment(1);
    }

    pub fn set_connected(&self, connected: bool) {
        gauge!("embridge_connector_up", "connection" => self.connection.clone())
            .set(if connected { 1.0 } else { 0.0 });
    }
}
