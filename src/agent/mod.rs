pub mod api;
pub mod forwarder;
pub mod manager;

pub use manager::{Backoff, SessionEvent};

use crate::config::{AgentConfig, AgentServerConfig, ConfigError, ConnectionTuning, PortMapping};
use crate::health::HealthMonitor;
use crate::stats::FabricMetrics;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Gateway request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Metrics registration failed: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Local API bind failed: {0}")]
    WebBindFailed(#[from] warp::Error),

    #[error("Allocation refused: {0}")]
    AllocationRefused(String),
}

/// Live counters for one mapping, shared between its maintainer, its
/// session tasks, and the local API.
pub struct MappingStatus {
    pub assigned_port: RwLock<Option<u16>>,
    pub idle_sessions: AtomicUsize,
    pub active_sessions: AtomicUsize,
    pub dial_failures: AtomicU64,
    pub running: AtomicBool,
}

impl MappingStatus {
    pub fn new() -> Self {
        Self {
            assigned_port: RwLock::new(None),
            idle_sessions: AtomicUsize::new(0),
            active_sessions: AtomicUsize::new(0),
            dial_failures: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }
}

impl Default for MappingStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// A running mapping: its maintainer task plus the shutdown signal that
/// cancels the maintainer and every session in its pool.
pub struct MappingHandle {
    pub mapping: PortMapping,
    pub status: Arc<MappingStatus>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Everything the agent's tasks share; owned by the container.
pub struct AgentState {
    pub config_path: PathBuf,
    pub config: RwLock<AgentConfig>,
    pub server: AgentServerConfig,
    pub tuning: ConnectionTuning,
    pub mappings: RwLock<HashMap<u32, MappingHandle>>,
    pub metrics: FabricMetrics,
    pub health: HealthMonitor,
    pub http: reqwest::Client,
    pub shutdown: watch::Sender<bool>,
}

impl AgentState {
    pub fn control_url(&self, path: &str) -> String {
        format!(
            "http://{}:{}{}",
            self.server.host, self.server.web_port, path
        )
    }
}

/// Spawn a maintainer for an enabled mapping. A mapping already running
/// is left alone.
pub async fn start_mapping(state: &Arc<AgentState>, mapping: PortMapping) {
    if !mapping.enabled {
        return;
    }
    let mut mappings = state.mappings.write().await;
    if mappings.contains_key(&mapping.id) {
        return;
    }

    let status = Arc::new(MappingStatus::new());
    status.running.store(true, Ordering::Relaxed);
    let (shutdown, _) = watch::channel(false);
    let task = tokio::spawn(manager::run_mapping(
        state.clone(),
        mapping.clone(),
        status.clone(),
        shutdown.subscribe(),
    ));

    tracing::info!("Started mapping '{}' (id {})", mapping.name, mapping.id);
    mappings.insert(
        mapping.id,
        MappingHandle {
            mapping,
            status,
            shutdown,
            task,
        },
    );
}

/// Cancel a mapping's maintainer and all its sessions. The maintainer
/// releases the public port on its way out.
pub async fn stop_mapping(state: &Arc<AgentState>, id: u32) -> bool {
    let handle = state.mappings.write().await.remove(&id);
    let Some(handle) = handle else {
        return false;
    };

    let _ = handle.shutdown.send(true);
    let abort = handle.task.abort_handle();
    if tokio::time::timeout(Duration::from_secs(5), handle.task)
        .await
        .is_err()
    {
        tracing::warn!("Mapping {} maintainer did not stop in time, aborting", id);
        abort.abort();
    }
    handle.status.running.store(false, Ordering::Relaxed);
    true
}

pub struct AgentContainer {
    state: Arc<AgentState>,
}

impl AgentContainer {
    pub fn new(config: AgentConfig, config_path: PathBuf) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let metrics = FabricMetrics::new()?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            state: Arc::new(AgentState {
                config_path,
                server: config.server.clone(),
                tuning: config.connection.clone(),
                config: RwLock::new(config),
                mappings: RwLock::new(HashMap::new()),
                metrics,
                health: HealthMonitor::new(),
                http,
                shutdown,
            }),
        })
    }

    pub fn state(&self) -> Arc<AgentState> {
        self.state.clone()
    }

    /// Bring up the local management API and start every enabled
    /// mapping. Returns the API's bound address.
    pub async fn start(&self) -> Result<SocketAddr, AgentError> {
        let routes = api::routes(self.state.clone());
        let api_addr = SocketAddr::from(([127, 0, 0, 1], self.state.server.local_api_port));
        let mut shutdown_rx = self.state.shutdown.subscribe();
        let (bound, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(api_addr, async move {
                let _ = shutdown_rx.changed().await;
            })?;
        tokio::spawn(server);
        tracing::info!("Agent API listening on {}", bound);
        self.state.health.mark_started();

        let mappings = self.state.config.read().await.port_mappings.clone();
        for mapping in mappings.into_iter().filter(|m| m.enabled) {
            start_mapping(&self.state, mapping).await;
        }

        Ok(bound)
    }

    /// Park until shutdown; the maintainers do the real work.
    pub async fn run(&self) {
        let mut shutdown_rx = self.state.shutdown.subscribe();
        if !*shutdown_rx.borrow() {
            let _ = shutdown_rx.changed().await;
        }
    }

    pub async fn stop(&self) {
        tracing::info!("Stopping agent");
        let _ = self.state.shutdown.send(true);
        let ids: Vec<u32> = self.state.mappings.read().await.keys().copied().collect();
        for id in ids {
            stop_mapping(&self.state, id).await;
        }
    }
}
