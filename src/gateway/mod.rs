pub mod acceptor;
pub mod bindings;
pub mod control;
pub mod dispatcher;
pub mod pool;
pub mod registry;

pub use bindings::{MappingTable, PortBinding};
pub use pool::{IdleSession, MuxSession, PoolCounts, SessionPool, PAIR_TIMEOUT};
pub use registry::{AvailablePort, PortRegistry, RegistryError};

use crate::config::{
    save_gateway_config, validate_gateway_config, ConfigError, GatewayConfig, Protocol,
};
use crate::fabric::session::SessionIds;
use crate::health::HealthMonitor;
use crate::stats::FabricMetrics;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Duration;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Allocation error: {0}")]
    RegistryError(#[from] RegistryError),

    #[error("Failed to bind port {port}: {source}")]
    BindFailed {
        port: u16,
        source: std::io::Error,
    },

    #[error("Control plane bind failed: {0}")]
    WebBindFailed(#[from] warp::Error),

    #[error("Metrics registration failed: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Container not started")]
    NotStarted,

    #[error("Data-plane listener lost")]
    DataPlaneLost,
}

/// Everything the gateway shares between its tasks. Owned by the
/// container and passed explicitly; nothing lives at module scope.
pub struct GatewayState {
    pub config: RwLock<GatewayConfig>,
    pub config_path: PathBuf,
    pub bind_ip: IpAddr,
    pub web_port: u16,
    pub data_plane_port: u16,
    pub registry: PortRegistry,
    pub table: MappingTable,
    pub pool: SessionPool,
    pub session_ids: SessionIds,
    pub metrics: FabricMetrics,
    pub health: HealthMonitor,
    pub shutdown: watch::Sender<bool>,
}

/// Rent a public port and bring its listeners up atomically. Any bind
/// failure rolls the whole allocation back. Re-allocating an identical
/// `(local_port, preferred_port)` pair returns the existing binding.
pub async fn activate_mapping(
    state: &Arc<GatewayState>,
    local_port: u16,
    preferred: Option<u16>,
    protocol: Protocol,
) -> Result<Arc<PortBinding>, GatewayError> {
    if let Some(existing) = state.table.get_by_local(local_port).await {
        let same_port = preferred.is_none()
            || preferred == Some(existing.public_port)
            || preferred == existing.preferred_port;
        if same_port && existing.protocol == protocol {
            return Ok(existing);
        }
        release_binding(state, &existing).await;
    }

    let public_port = state.registry.allocate(preferred).await?;

    let tcp_listener = if protocol.includes_tcp() {
        match TcpListener::bind((state.bind_ip, public_port)).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                state.registry.release(public_port).await;
                return Err(GatewayError::BindFailed {
                    port: public_port,
                    source: e,
                });
            }
        }
    } else {
        None
    };

    let udp_socket = if protocol.includes_udp() {
        match UdpSocket::bind((state.bind_ip, public_port)).await {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                // Roll back the half-open state before reporting failure.
                drop(tcp_listener);
                state.registry.release(public_port).await;
                return Err(GatewayError::BindFailed {
                    port: public_port,
                    source: e,
                });
            }
        }
    } else {
        None
    };

    state.pool.create(public_port).await;
    let binding = Arc::new(PortBinding::new(public_port, local_port, protocol, preferred));
    state.table.insert(binding.clone()).await;

    if let Some(listener) = tcp_listener {
        tokio::spawn(dispatcher::run_tcp_listener(
            state.clone(),
            listener,
            public_port,
            binding.shutdown_signal(),
        ));
    }
    if let Some(socket) = udp_socket {
        tokio::spawn(dispatcher::run_udp_listener(
            state.clone(),
            socket,
            public_port,
            binding.shutdown_signal(),
        ));
    }

    tracing::info!(
        "Bound public port {} ({}) for local port {}",
        public_port,
        protocol,
        local_port
    );
    Ok(binding)
}

/// Tear a binding down: listeners stop, pool contents are destroyed,
/// the port returns to the registry. Safe to call twice.
pub async fn release_binding(state: &Arc<GatewayState>, binding: &Arc<PortBinding>) {
    if state.table.remove(binding.public_port).await.is_none() {
        return;
    }
    binding.trigger_shutdown();
    for mux in state.pool.destroy(binding.public_port).await {
        mux.close().await;
        state.metrics.sessions_closed.inc();
    }
    state.registry.release(binding.public_port).await;
    tracing::info!(
        "Released public port {} (local port {})",
        binding.public_port,
        binding.local_port
    );
}

pub async fn release_by_local(state: &Arc<GatewayState>, local_port: u16) -> bool {
    match state.table.get_by_local(local_port).await {
        Some(binding) => {
            release_binding(state, &binding).await;
            true
        }
        None => false,
    }
}

/// Validate, persist, and apply an edited configuration. Port-spec
/// changes apply live; server-section changes wait for a restart.
pub async fn apply_config(
    state: &Arc<GatewayState>,
    new: GatewayConfig,
) -> Result<(), ConfigError> {
    validate_gateway_config(&new)?;

    {
        let current = state.config.read().await;
        if new.server != current.server {
            tracing::warn!("Server section changed; new ports take effect on restart");
        }
    }

    save_gateway_config(&state.config_path, &new)?;
    state
        .registry
        .replace_specs(new.port_ranges.clone(), new.specific_ports.clone())
        .await;
    {
        let mut config = state.config.write().await;
        let server = config.server.clone();
        *config = new;
        config.server = server;
    }

    // Bindings whose ports fell out of coverage lose their lease.
    for binding in state.table.list().await {
        if !state.registry.is_covered(binding.public_port).await {
            release_binding(state, &binding).await;
        }
    }
    Ok(())
}

pub struct GatewayContainer {
    state: Arc<GatewayState>,
    data_listener: Mutex<Option<TcpListener>>,
}

impl GatewayContainer {
    pub fn new(config: GatewayConfig, config_path: PathBuf) -> Result<Self, GatewayError> {
        let bind_ip: IpAddr = config.server.bind_ip.parse().unwrap_or_else(|_| {
            tracing::warn!(
                "Invalid bind IP '{}', defaulting to 0.0.0.0",
                config.server.bind_ip
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        let metrics = FabricMetrics::new()?;
        let registry = PortRegistry::new(
            config.port_ranges.clone(),
            config.specific_ports.clone(),
            [config.server.web_port, config.server.data_plane_port],
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            state: Arc::new(GatewayState {
                bind_ip,
                web_port: config.server.web_port,
                data_plane_port: config.server.data_plane_port,
                config: RwLock::new(config),
                config_path,
                registry,
                table: MappingTable::new(),
                pool: SessionPool::new(),
                session_ids: SessionIds::new(),
                metrics,
                health: HealthMonitor::new(),
                shutdown,
            }),
            data_listener: Mutex::new(None),
        })
    }

    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Bind the data plane and the control plane. Returns the control
    /// plane's bound address. A bind failure here is fatal for startup.
    pub async fn start(&self) -> Result<SocketAddr, GatewayError> {
        let data_addr = SocketAddr::new(self.state.bind_ip, self.state.data_plane_port);
        let listener = TcpListener::bind(data_addr)
            .await
            .map_err(|e| GatewayError::BindFailed {
                port: self.state.data_plane_port,
                source: e,
            })?;
        tracing::info!("Data plane listening on {}", data_addr);
        *self.data_listener.lock().await = Some(listener);

        let routes = control::routes(self.state.clone());
        let web_addr = SocketAddr::new(self.state.bind_ip, self.state.web_port);
        let mut shutdown_rx = self.state.shutdown.subscribe();
        let (bound, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(web_addr, async move {
                let _ = shutdown_rx.changed().await;
            })?;
        tokio::spawn(server);
        tracing::info!("Control plane listening on {}", bound);

        self.spawn_pending_sweep();
        self.state.health.mark_started();
        Ok(bound)
    }

    fn spawn_pending_sweep(&self) {
        let state = self.state.clone();
        let mut shutdown_rx = self.state.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for conn in state.pool.sweep_pending(PAIR_TIMEOUT).await {
                            state.metrics.pending_expired.inc();
                            tracing::debug!(
                                "Pending connection {} from {} timed out unpaired",
                                conn.id,
                                conn.peer
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
    }

    /// Accept data-plane sessions until shutdown. Losing the data-plane
    /// listener is the one fatal condition that ends the process.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let listener = self
            .data_listener
            .lock()
            .await
            .take()
            .ok_or(GatewayError::NotStarted)?;

        let mut plane = self.state.health.track();
        plane.mark_serving();
        let result = acceptor::run_data_plane(
            self.state.clone(),
            listener,
            self.state.shutdown.subscribe(),
        )
        .await;
        if result.is_err() {
            plane.mark_retrying();
        }
        result
    }

    /// Graceful shutdown: stop accepting, let pumps drain, close
    /// listeners, return every port to the registry.
    pub async fn stop(&self) {
        tracing::info!("Stopping gateway");
        let _ = self.state.shutdown.send(true);
        for binding in self.state.table.list().await {
            release_binding(&self.state, &binding).await;
        }
    }
}
