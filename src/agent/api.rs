use super::{manager, start_mapping, stop_mapping, AgentState};
use crate::config::{save_agent_config, validate_agent_config, PortMapping, Protocol};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::Filter;

#[derive(Debug, Clone, Deserialize)]
pub struct MappingRequest {
    pub name: String,

    #[serde(default = "default_local_host")]
    pub local_host: String,

    pub local_port: u16,
    pub protocol: Protocol,

    #[serde(default)]
    pub preferred_port: Option<u16>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    #[serde(default)]
    pub udp_flow_idle_ms: Option<u64>,
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct MappingView {
    pub id: u32,
    pub name: String,
    pub local_host: String,
    pub local_port: u16,
    pub protocol: Protocol,
    pub preferred_port: Option<u16>,
    pub assigned_public_port: Option<u16>,
    pub enabled: bool,
    pub description: Option<String>,
    pub auto_reconnect: bool,
    pub udp_flow_idle_ms: Option<u64>,
    pub idle_sessions: usize,
    pub active_sessions: usize,
    pub dial_failures: u64,
    pub running: bool,
}

#[derive(Debug, Serialize)]
pub struct ApiStatus {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiStatus {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// The agent's local management surface: mapping CRUD plus start/stop.
/// The persisted JSON file stays authoritative; every edit lands there
/// before it takes effect.
pub fn routes(
    state: Arc<AgentState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let with_state = {
        let state = state.clone();
        warp::any().map(move || state.clone())
    };

    let list = warp::path!("mappings")
        .and(warp::get())
        .and(with_state.clone())
        .and_then(handle_list);

    let create = warp::path!("mappings")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state.clone())
        .and_then(handle_create);

    let update = warp::path!("mappings" / u32)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_state.clone())
        .and_then(handle_update);

    let delete = warp::path!("mappings" / u32)
        .and(warp::delete())
        .and(with_state.clone())
        .and_then(handle_delete);

    let start = warp::path!("mappings" / u32 / "start")
        .and(warp::post())
        .and(with_state.clone())
        .and_then(handle_start);

    let stop = warp::path!("mappings" / u32 / "stop")
        .and(warp::post())
        .and(with_state.clone())
        .and_then(handle_stop);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_state.clone())
        .and_then(handle_health);

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and(with_state)
        .map(|state: Arc<AgentState>| state.metrics.encode_text());

    list.or(create)
        .or(update)
        .or(delete)
        .or(start)
        .or(stop)
        .or(health)
        .or(metrics)
}

async fn mapping_view(state: &Arc<AgentState>, mapping: &PortMapping) -> MappingView {
    let handles = state.mappings.read().await;
    let (assigned, idle, active, failures, running) = match handles.get(&mapping.id) {
        Some(handle) => (
            *handle.status.assigned_port.read().await,
            handle.status.idle_sessions.load(Ordering::Relaxed),
            handle.status.active_sessions.load(Ordering::Relaxed),
            handle.status.dial_failures.load(Ordering::Relaxed),
            handle.status.running.load(Ordering::Relaxed),
        ),
        None => (mapping.assigned_public_port, 0, 0, 0, false),
    };

    MappingView {
        id: mapping.id,
        name: mapping.name.clone(),
        local_host: mapping.local_host.clone(),
        local_port: mapping.local_port,
        protocol: mapping.protocol,
        preferred_port: mapping.preferred_port,
        assigned_public_port: assigned,
        enabled: mapping.enabled,
        description: mapping.description.clone(),
        auto_reconnect: mapping.auto_reconnect,
        udp_flow_idle_ms: mapping.udp_flow_idle_ms,
        idle_sessions: idle,
        active_sessions: active,
        dial_failures: failures,
        running,
    }
}

async fn handle_list(state: Arc<AgentState>) -> Result<impl warp::Reply, warp::Rejection> {
    let mappings = state.config.read().await.port_mappings.clone();
    let mut out = Vec::with_capacity(mappings.len());
    for mapping in &mappings {
        out.push(mapping_view(&state, mapping).await);
    }
    Ok(warp::reply::json(&out))
}

fn mapping_from_request(id: u32, request: MappingRequest, assigned: Option<u16>) -> PortMapping {
    PortMapping {
        id,
        name: request.name,
        local_host: request.local_host,
        local_port: request.local_port,
        protocol: request.protocol,
        preferred_port: request.preferred_port,
        assigned_public_port: assigned,
        enabled: request.enabled,
        description: request.description,
        auto_reconnect: request.auto_reconnect,
        udp_flow_idle_ms: request.udp_flow_idle_ms,
    }
}

async fn handle_create(
    request: MappingRequest,
    state: Arc<AgentState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let mapping = {
        let mut config = state.config.write().await;
        let id = config.port_mappings.iter().map(|m| m.id).max().unwrap_or(0) + 1;
        let mapping = mapping_from_request(id, request, None);
        config.port_mappings.push(mapping.clone());

        if let Err(e) = validate_agent_config(&config) {
            config.port_mappings.pop();
            return Ok(warp::reply::with_status(
                warp::reply::json(&ApiStatus::err(e.to_string())),
                StatusCode::BAD_REQUEST,
            ));
        }
        if let Err(e) = save_agent_config(&state.config_path, &config) {
            config.port_mappings.pop();
            return Ok(warp::reply::with_status(
                warp::reply::json(&ApiStatus::err(e.to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }
        mapping
    };

    if mapping.enabled {
        start_mapping(&state, mapping).await;
    }
    Ok(warp::reply::with_status(
        warp::reply::json(&ApiStatus::ok()),
        StatusCode::OK,
    ))
}

async fn handle_update(
    id: u32,
    request: MappingRequest,
    state: Arc<AgentState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    stop_mapping(&state, id).await;

    let mapping = {
        let mut config = state.config.write().await;
        let Some(index) = config.port_mappings.iter().position(|m| m.id == id) else {
            return Ok(warp::reply::with_status(
                warp::reply::json(&ApiStatus::err(format!("No mapping with id {}", id))),
                StatusCode::NOT_FOUND,
            ));
        };

        let previous = config.port_mappings[index].clone();
        // The sticky port only survives if it still points at the same
        // service shape.
        let assigned = if previous.local_port == request.local_port
            && previous.protocol == request.protocol
        {
            previous.assigned_public_port
        } else {
            None
        };
        let mapping = mapping_from_request(id, request, assigned);
        config.port_mappings[index] = mapping.clone();

        if let Err(e) = validate_agent_config(&config) {
            config.port_mappings[index] = previous;
            return Ok(warp::reply::with_status(
                warp::reply::json(&ApiStatus::err(e.to_string())),
                StatusCode::BAD_REQUEST,
            ));
        }
        if let Err(e) = save_agent_config(&state.config_path, &config) {
            config.port_mappings[index] = previous;
            return Ok(warp::reply::with_status(
                warp::reply::json(&ApiStatus::err(e.to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }
        mapping
    };

    if mapping.enabled {
        start_mapping(&state, mapping).await;
    }
    Ok(warp::reply::with_status(
        warp::reply::json(&ApiStatus::ok()),
        StatusCode::OK,
    ))
}

async fn handle_delete(
    id: u32,
    state: Arc<AgentState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let was_running = stop_mapping(&state, id).await;

    let removed = {
        let mut config = state.config.write().await;
        let index = config.port_mappings.iter().position(|m| m.id == id);
        match index {
            Some(index) => {
                let removed = config.port_mappings.remove(index);
                if let Err(e) = save_agent_config(&state.config_path, &config) {
                    tracing::warn!("Failed to persist mapping removal: {}", e);
                }
                Some(removed)
            }
            None => None,
        }
    };

    match removed {
        Some(mapping) => {
            // A stopped maintainer already released; cover the disabled case.
            if !was_running {
                manager::release_remote(&state, mapping.local_port).await;
            }
            Ok(warp::reply::json(&ApiStatus::ok()))
        }
        None => Ok(warp::reply::json(&ApiStatus::err(format!(
            "No mapping with id {}",
            id
        )))),
    }
}

async fn handle_start(
    id: u32,
    state: Arc<AgentState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let mapping = {
        let mut config = state.config.write().await;
        let Some(mapping) = config.port_mappings.iter_mut().find(|m| m.id == id) else {
            return Ok(warp::reply::json(&ApiStatus::err(format!(
                "No mapping with id {}",
                id
            ))));
        };
        mapping.enabled = true;
        let mapping = mapping.clone();
        if let Err(e) = save_agent_config(&state.config_path, &config) {
            tracing::warn!("Failed to persist mapping enable: {}", e);
        }
        mapping
    };

    start_mapping(&state, mapping).await;
    Ok(warp::reply::json(&ApiStatus::ok()))
}

async fn handle_stop(
    id: u32,
    state: Arc<AgentState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    {
        let mut config = state.config.write().await;
        let Some(mapping) = config.port_mappings.iter_mut().find(|m| m.id == id) else {
            return Ok(warp::reply::json(&ApiStatus::err(format!(
                "No mapping with id {}",
                id
            ))));
        };
        mapping.enabled = false;
        if let Err(e) = save_agent_config(&state.config_path, &config) {
            tracing::warn!("Failed to persist mapping disable: {}", e);
        }
    }

    stop_mapping(&state, id).await;
    Ok(warp::reply::json(&ApiStatus::ok()))
}

async fn handle_health(state: Arc<AgentState>) -> Result<impl warp::Reply, warp::Rejection> {
    let result = state.health.check_health();
    Ok(warp::reply::json(&result))
}
