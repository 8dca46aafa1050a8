//! Process health derived from live fabric signals.
//!
//! Health is not a status somebody remembers to set. Each component
//! that ought to be moving traffic (the gateway's data-plane acceptor,
//! every enabled mapping on the agent) registers a [`ComponentHealth`]
//! handle and reports which of three states it is in: still coming up,
//! serving, or parked in reconnect backoff. `/health` computes the
//! process status from those counts at request time.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Starting,
    Connecting,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    /// Components that ought to be serving.
    pub tracked: usize,
    pub serving: usize,
    /// Components sitting in reconnect backoff.
    pub retrying: usize,
    pub message: String,
}

#[derive(Default)]
struct Signals {
    started: AtomicBool,
    tracked: AtomicUsize,
    serving: AtomicUsize,
    retrying: AtomicUsize,
}

pub struct HealthMonitor {
    start_time: Instant,
    signals: Arc<Signals>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            signals: Arc::new(Signals::default()),
        }
    }

    /// Listeners are bound; the process is past `Starting`.
    pub fn mark_started(&self) {
        self.signals.started.store(true, Ordering::Relaxed);
    }

    /// Register one component that ought to be serving. Dropping the
    /// handle removes the component from the tally.
    pub fn track(&self) -> ComponentHealth {
        self.signals.tracked.fetch_add(1, Ordering::Relaxed);
        ComponentHealth {
            signals: self.signals.clone(),
            state: ComponentState::Pending,
        }
    }

    /// Fold the component counts into one status. A process with
    /// nothing to serve is healthy; it degrades as components fall into
    /// backoff and is unhealthy only when every one of them has.
    pub fn status(&self) -> HealthStatus {
        if !self.signals.started.load(Ordering::Relaxed) {
            return HealthStatus::Starting;
        }
        let tracked = self.signals.tracked.load(Ordering::Relaxed);
        let serving = self.signals.serving.load(Ordering::Relaxed);
        let retrying = self.signals.retrying.load(Ordering::Relaxed);

        if tracked == 0 || serving == tracked {
            return HealthStatus::Healthy;
        }
        if serving > 0 {
            return HealthStatus::Degraded;
        }
        if retrying == tracked {
            return HealthStatus::Unhealthy;
        }
        HealthStatus::Connecting
    }

    pub fn check_health(&self) -> HealthCheckResult {
        let status = self.status();
        let tracked = self.signals.tracked.load(Ordering::Relaxed);
        let serving = self.signals.serving.load(Ordering::Relaxed);
        let retrying = self.signals.retrying.load(Ordering::Relaxed);

        let message = match status {
            HealthStatus::Starting => "Service is starting up".to_string(),
            HealthStatus::Connecting => {
                format!("{} of {} components still connecting", tracked - serving, tracked)
            }
            HealthStatus::Healthy => "All systems operational".to_string(),
            HealthStatus::Degraded => {
                format!("{} of {} components serving", serving, tracked)
            }
            HealthStatus::Unhealthy => {
                format!("All {} components in reconnect backoff", tracked)
            }
        };

        HealthCheckResult {
            status,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            tracked,
            serving,
            retrying,
            message,
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

enum ComponentState {
    Pending,
    Serving,
    Retrying,
}

/// One tracked component's handle. Transitions keep the shared counts
/// exact no matter how often a state is re-announced.
pub struct ComponentHealth {
    signals: Arc<Signals>,
    state: ComponentState,
}

impl ComponentHealth {
    /// The component is moving traffic (port allocated, pool up).
    pub fn mark_serving(&mut self) {
        match self.state {
            ComponentState::Serving => return,
            ComponentState::Retrying => {
                self.signals.retrying.fetch_sub(1, Ordering::Relaxed);
            }
            ComponentState::Pending => {}
        }
        self.signals.serving.fetch_add(1, Ordering::Relaxed);
        self.state = ComponentState::Serving;
    }

    /// The component lost its connection and is waiting out a backoff.
    pub fn mark_retrying(&mut self) {
        match self.state {
            ComponentState::Retrying => return,
            ComponentState::Serving => {
                self.signals.serving.fetch_sub(1, Ordering::Relaxed);
            }
            ComponentState::Pending => {}
        }
        self.signals.retrying.fetch_add(1, Ordering::Relaxed);
        self.state = ComponentState::Retrying;
    }
}

impl Drop for ComponentHealth {
    fn drop(&mut self) {
        match self.state {
            ComponentState::Serving => {
                self.signals.serving.fetch_sub(1, Ordering::Relaxed);
            }
            ComponentState::Retrying => {
                self.signals.retrying.fetch_sub(1, Ordering::Relaxed);
            }
            ComponentState::Pending => {}
        }
        self.signals.tracked.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starting_until_marked() {
        let monitor = HealthMonitor::new();
        assert_eq!(monitor.status(), HealthStatus::Starting);
        assert!(!monitor.status().is_ready());

        monitor.mark_started();
        assert_eq!(monitor.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_nothing_tracked_is_healthy() {
        // A gateway with no rented ports has nothing to be unhealthy about.
        let monitor = HealthMonitor::new();
        monitor.mark_started();
        assert!(monitor.status().is_healthy());
    }

    #[test]
    fn test_status_follows_component_states() {
        let monitor = HealthMonitor::new();
        monitor.mark_started();

        let mut a = monitor.track();
        let mut b = monitor.track();
        assert_eq!(monitor.status(), HealthStatus::Connecting);

        a.mark_serving();
        assert_eq!(monitor.status(), HealthStatus::Degraded);

        b.mark_serving();
        assert_eq!(monitor.status(), HealthStatus::Healthy);

        a.mark_retrying();
        assert_eq!(monitor.status(), HealthStatus::Degraded);

        b.mark_retrying();
        assert_eq!(monitor.status(), HealthStatus::Unhealthy);

        // One recovers: partial service again.
        a.mark_serving();
        assert_eq!(monitor.status(), HealthStatus::Degraded);
    }

    #[test]
    fn test_repeated_marks_keep_counts_exact() {
        let monitor = HealthMonitor::new();
        monitor.mark_started();

        let mut a = monitor.track();
        a.mark_serving();
        a.mark_serving();
        a.mark_serving();
        assert_eq!(monitor.status(), HealthStatus::Healthy);

        a.mark_retrying();
        assert_eq!(monitor.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_drop_untracks() {
        let monitor = HealthMonitor::new();
        monitor.mark_started();

        let mut a = monitor.track();
        a.mark_retrying();
        assert_eq!(monitor.status(), HealthStatus::Unhealthy);

        drop(a);
        assert_eq!(monitor.status(), HealthStatus::Healthy);
        assert_eq!(monitor.check_health().tracked, 0);
    }

    #[test]
    fn test_check_health_payload() {
        let monitor = HealthMonitor::new();
        monitor.mark_started();

        let mut a = monitor.track();
        let _b = monitor.track();
        a.mark_serving();

        let result = monitor.check_health();
        assert_eq!(result.status, HealthStatus::Degraded);
        assert_eq!(result.tracked, 2);
        assert_eq!(result.serving, 1);
        assert_eq!(result.retrying, 0);
        assert!(result.message.contains("1 of 2"));
    }
}
