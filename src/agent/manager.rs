use super::{forwarder, AgentError, AgentState, MappingStatus};
use crate::config::{save_agent_config, PortMapping};
use crate::gateway::control::{AllocateRequest, AllocateResponse};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

/// Reconnect backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Consecutive unused closes before the sticky public port is treated
/// as invalid and allocation is redone from scratch.
const MAX_REFUSALS: u32 = 5;

/// What a session task reports back to its mapping's maintainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The gateway started using the session; open a replacement so the
    /// idle floor holds.
    Used,
    /// The session closed before carrying any data: the gateway refused
    /// it or the connection never came up.
    Refused,
    /// The local service could not be dialed; replacements wait out the
    /// backoff instead of hammering a dead service.
    DialFailed,
    /// The session carried traffic and ended cleanly.
    Served,
}

/// Exponential backoff, factor 2 with ±20 % jitter.
pub struct Backoff {
    next_delay: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            next_delay: min,
            min,
            max,
        }
    }

    pub fn next(&mut self) -> Duration {
        use rand::Rng;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(0.8..=1.2);
        let delay = self.next_delay.mul_f64(jitter);
        self.next_delay = (self.next_delay * 2).min(self.max);
        delay.min(self.max)
    }

    pub fn reset(&mut self) {
        self.next_delay = self.min;
    }
}

/// The maintainer for one enabled mapping: allocate a public port, then
/// keep the idle session pool between its floor and ceiling until the
/// mapping is disabled or removed.
pub async fn run_mapping(
    state: Arc<AgentState>,
    mapping: PortMapping,
    status: Arc<MappingStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let tuning = state.tuning.clone();
    let backoff_min = Duration::from_millis(tuning.reconnect_delay_ms.max(100));
    let mut sticky = mapping.assigned_public_port;
    let mut health = state.health.track();

    'outer: loop {
        if *shutdown.borrow() {
            break;
        }

        // Phase 1: get a public port, sticky one preferred.
        let mut backoff = Backoff::new(backoff_min, MAX_BACKOFF);
        let public_port = loop {
            match request_allocation(&state, &mapping, sticky).await {
                Ok(port) => break port,
                Err(AgentError::AllocationRefused(message)) => {
                    health.mark_retrying();
                    tracing::warn!(
                        "Allocation refused for mapping '{}': {}",
                        mapping.name,
                        message
                    );
                    if sticky.take().is_some() {
                        // The remembered port may be the problem.
                        *status.assigned_port.write().await = None;
                        persist_assigned(&state, mapping.id, None).await;
                    }
                }
                Err(e) => {
                    health.mark_retrying();
                    state.metrics.reconnect_attempts.inc();
                    tracing::warn!(
                        "Gateway unreachable for mapping '{}': {}",
                        mapping.name,
                        e
                    );
                }
            }
            if !mapping.auto_reconnect {
                tracing::info!(
                    "Mapping '{}' has auto_reconnect off, giving up",
                    mapping.name
                );
                break 'outer;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff.next()) => {}
                _ = shutdown.changed() => break 'outer,
            }
        };

        sticky = Some(public_port);
        *status.assigned_port.write().await = Some(public_port);
        persist_assigned(&state, mapping.id, Some(public_port)).await;
        health.mark_serving();
        tracing::info!(
            "Mapping '{}' serving public port {}",
            mapping.name,
            public_port
        );

        // Phase 2: hold the idle pool at its floor.
        let (events_tx, mut events_rx) = mpsc::channel::<SessionEvent>(64);
        let mut check =
            tokio::time::interval(Duration::from_millis(tuning.check_interval_ms.max(100)));
        let mut session_backoff = Backoff::new(backoff_min, MAX_BACKOFF);
        let mut refusals: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break 'outer;
            }

            let idle = status.idle_sessions.load(Ordering::Relaxed);
            let total = idle + status.active_sessions.load(Ordering::Relaxed);
            if idle < tuning.min_idle && total < tuning.max_total {
                status.idle_sessions.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(forwarder::run_session(
                    state.clone(),
                    mapping.clone(),
                    public_port,
                    status.clone(),
                    events_tx.clone(),
                    shutdown.clone(),
                ));
                continue;
            }

            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(SessionEvent::Used) => {
                        refusals = 0;
                        // Loop around: the floor check replaces it eagerly.
                    }
                    Some(SessionEvent::Served) => {
                        // Traffic made it all the way through; failures
                        // start over from the minimum delay.
                        session_backoff.reset();
                    }
                    Some(SessionEvent::DialFailed) => {
                        // The local service is down. The replacement
                        // still comes, but only after the backoff.
                        tokio::select! {
                            _ = tokio::time::sleep(session_backoff.next()) => {}
                            _ = shutdown.changed() => break 'outer,
                        }
                    }
                    Some(SessionEvent::Refused) => {
                        refusals += 1;
                        state.metrics.reconnect_attempts.inc();
                        if refusals >= MAX_REFUSALS {
                            tracing::warn!(
                                "Mapping '{}' refused {} times on port {}; clearing it and reallocating",
                                mapping.name, refusals, public_port
                            );
                            sticky = None;
                            *status.assigned_port.write().await = None;
                            persist_assigned(&state, mapping.id, None).await;
                            health.mark_retrying();
                            continue 'outer;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(session_backoff.next()) => {}
                            _ = shutdown.changed() => break 'outer,
                        }
                    }
                    None => {}
                },
                _ = check.tick() => {}
                _ = shutdown.changed() => break 'outer,
            }
        }
    }

    // Teardown: sessions die with the shutdown signal; give the port back.
    release_remote(&state, mapping.local_port).await;
    status.running.store(false, Ordering::Relaxed);
    tracing::info!("Mapping '{}' stopped", mapping.name);
}

async fn request_allocation(
    state: &Arc<AgentState>,
    mapping: &PortMapping,
    sticky: Option<u16>,
) -> Result<u16, AgentError> {
    let request = AllocateRequest {
        local_port: mapping.local_port,
        preferred_port: sticky.or(mapping.preferred_port),
        protocol: mapping.protocol,
    };
    let url = state.control_url("/ports/allocate");
    let response: AllocateResponse = state
        .http
        .post(&url)
        .json(&request)
        .send()
        .await?
        .json()
        .await?;

    if response.success {
        response.public_port.ok_or_else(|| {
            AgentError::AllocationRefused("gateway omitted the public port".to_string())
        })
    } else {
        Err(AgentError::AllocationRefused(
            response.message.unwrap_or_else(|| "unknown".to_string()),
        ))
    }
}

/// Keep the sticky port on disk so a restart reclaims it.
async fn persist_assigned(state: &Arc<AgentState>, id: u32, port: Option<u16>) {
    let mut config = state.config.write().await;
    match config.port_mappings.iter_mut().find(|m| m.id == id) {
        Some(mapping) if mapping.assigned_public_port != port => {
            mapping.assigned_public_port = port;
        }
        _ => return,
    }
    if let Err(e) = save_agent_config(&state.config_path, &config) {
        tracing::warn!("Failed to persist assigned port: {}", e);
    }
}

pub async fn release_remote(state: &Arc<AgentState>, local_port: u16) {
    let url = state.control_url(&format!("/ports/mapping/{}", local_port));
    match state.http.delete(&url).send().await {
        Ok(_) => tracing::debug!("Released gateway mapping for local port {}", local_port),
        Err(e) => tracing::debug!(
            "Release for local port {} did not reach the gateway: {}",
            local_port,
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        let first = backoff.next();
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));

        let second = backoff.next();
        assert!(second >= Duration::from_millis(1600) && second <= Duration::from_millis(2400));

        for _ in 0..10 {
            backoff.next();
        }
        let capped = backoff.next();
        assert!(capped <= Duration::from_secs(30));
        assert!(capped >= Duration::from_secs(24)); // 30s minus full jitter
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..6 {
            backoff.next();
        }
        backoff.reset();
        let delay = backoff.next();
        assert!(delay <= Duration::from_millis(1200));
    }
}
