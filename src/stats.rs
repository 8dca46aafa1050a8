//! Counters for the tunneling fabric. The registry is owned here and
//! carried by the containers; nothing registers into a process-global.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct FabricMetrics {
    registry: Registry,

    pub sessions_opened: IntCounter,
    pub sessions_closed: IntCounter,
    pub sessions_refused: IntCounter,
    pub pairs_started: IntCounter,
    pub active_pairs: IntGauge,
    pub pending_accepted: IntCounter,
    pub pending_expired: IntCounter,
    pub udp_datagrams_in: IntCounter,
    pub udp_datagrams_out: IntCounter,
    pub udp_dropped_no_session: IntCounter,
    pub udp_dropped_backpressure: IntCounter,
    pub udp_dropped_unknown_flow: IntCounter,
    pub local_dial_failures: IntCounter,
    pub reconnect_attempts: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl FabricMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        Ok(Self {
            sessions_opened: counter(
                &registry,
                "burrow_sessions_opened_total",
                "Data-plane sessions accepted after a valid header",
            )?,
            sessions_closed: counter(
                &registry,
                "burrow_sessions_closed_total",
                "Data-plane sessions closed for any reason",
            )?,
            sessions_refused: counter(
                &registry,
                "burrow_sessions_refused_total",
                "Data-plane dials refused for an invalid or unbound port",
            )?,
            pairs_started: counter(
                &registry,
                "burrow_pairs_started_total",
                "Pending connections paired with a session",
            )?,
            active_pairs: gauge(
                &registry,
                "burrow_active_pairs",
                "TCP pairs currently pumping",
            )?,
            pending_accepted: counter(
                &registry,
                "burrow_pending_accepted_total",
                "End-user TCP connections accepted on public ports",
            )?,
            pending_expired: counter(
                &registry,
                "burrow_pending_expired_total",
                "Pending connections that timed out unpaired",
            )?,
            udp_datagrams_in: counter(
                &registry,
                "burrow_udp_datagrams_in_total",
                "Datagrams received on public UDP ports",
            )?,
            udp_datagrams_out: counter(
                &registry,
                "burrow_udp_datagrams_out_total",
                "Datagrams emitted back to end users",
            )?,
            udp_dropped_no_session: counter(
                &registry,
                "burrow_udp_dropped_no_session_total",
                "Datagrams dropped because no session was available",
            )?,
            udp_dropped_backpressure: counter(
                &registry,
                "burrow_udp_dropped_backpressure_total",
                "Envelopes dropped at the session write watermark",
            )?,
            udp_dropped_unknown_flow: counter(
                &registry,
                "burrow_udp_dropped_unknown_flow_total",
                "Response envelopes for flows the gateway no longer tracks",
            )?,
            local_dial_failures: counter(
                &registry,
                "burrow_local_dial_failures_total",
                "Agent-side failures dialing the local service",
            )?,
            reconnect_attempts: counter(
                &registry,
                "burrow_reconnect_attempts_total",
                "Agent reconnect attempts toward the gateway",
            )?,
            registry,
        })
    }

    pub fn encode_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
