use super::{activate_mapping, apply_config, release_by_local, GatewayState};
use crate::config::{GatewayConfig, Protocol};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::http::StatusCode;
use warp::Filter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub local_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_port: Option<u16>,

    pub protocol: Protocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActiveBinding {
    pub public_port: u16,
    pub local_port: u16,
    pub protocol: Protocol,
    pub pending: usize,
    pub idle_sessions: usize,
    pub mux_sessions: usize,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The gateway's HTTP/JSON surface: what agents and administrative
/// tooling talk to. Everything else rides the data plane.
pub fn routes(
    state: Arc<GatewayState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let with_state = {
        let state = state.clone();
        warp::any().map(move || state.clone())
    };

    let available = warp::path!("ports" / "available")
        .and(warp::get())
        .and(with_state.clone())
        .and_then(handle_available);

    let active = warp::path!("ports" / "active")
        .and(warp::get())
        .and(with_state.clone())
        .and_then(handle_active);

    let allocate = warp::path!("ports" / "allocate")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state.clone())
        .and_then(handle_allocate);

    let release = warp::path!("ports" / "mapping" / u16)
        .and(warp::delete())
        .and(with_state.clone())
        .and_then(handle_release);

    let get_config = warp::path!("config")
        .and(warp::get())
        .and(with_state.clone())
        .and_then(handle_get_config);

    let post_config = warp::path!("config")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state.clone())
        .and_then(handle_post_config);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_state.clone())
        .and_then(handle_health);

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and(with_state)
        .map(|state: Arc<GatewayState>| state.metrics.encode_text());

    available
        .or(active)
        .or(allocate)
        .or(release)
        .or(get_config)
        .or(post_config)
        .or(health)
        .or(metrics)
}

async fn handle_available(
    state: Arc<GatewayState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let available = state.registry.list_available().await;
    Ok(warp::reply::json(&available))
}

async fn handle_active(state: Arc<GatewayState>) -> Result<impl warp::Reply, warp::Rejection> {
    let mut out = Vec::new();
    for binding in state.table.list().await {
        let counts = state.pool.counts(binding.public_port).await.unwrap_or(
            super::PoolCounts {
                pending: 0,
                idle: 0,
                mux: 0,
            },
        );
        out.push(ActiveBinding {
            public_port: binding.public_port,
            local_port: binding.local_port,
            protocol: binding.protocol,
            pending: counts.pending,
            idle_sessions: counts.idle,
            mux_sessions: counts.mux,
            uptime_seconds: binding.created_at.elapsed().as_secs(),
        });
    }
    out.sort_by_key(|b| b.public_port);
    Ok(warp::reply::json(&out))
}

async fn handle_allocate(
    request: AllocateRequest,
    state: Arc<GatewayState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let response = match activate_mapping(
        &state,
        request.local_port,
        request.preferred_port,
        request.protocol,
    )
    .await
    {
        Ok(binding) => AllocateResponse {
            success: true,
            public_port: Some(binding.public_port),
            protocol: Some(binding.protocol),
            message: None,
        },
        Err(e) => {
            tracing::warn!(
                "Allocation for local port {} failed: {}",
                request.local_port,
                e
            );
            AllocateResponse {
                success: false,
                public_port: None,
                protocol: None,
                message: Some(e.to_string()),
            }
        }
    };
    Ok(warp::reply::json(&response))
}

async fn handle_release(
    local_port: u16,
    state: Arc<GatewayState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let released = release_by_local(&state, local_port).await;
    let response = StatusResponse {
        success: released,
        message: if released {
            None
        } else {
            Some(format!("No binding for local port {}", local_port))
        },
    };
    Ok(warp::reply::json(&response))
}

async fn handle_get_config(
    state: Arc<GatewayState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let config = state.config.read().await.clone();
    Ok(warp::reply::json(&config))
}

async fn handle_post_config(
    new: GatewayConfig,
    state: Arc<GatewayState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    match apply_config(&state, new).await {
        Ok(()) => Ok(warp::reply::with_status(
            warp::reply::json(&StatusResponse {
                success: true,
                message: None,
            }),
            StatusCode::OK,
        )),
        Err(e) => Ok(warp::reply::with_status(
            warp::reply::json(&StatusResponse {
                success: false,
                message: Some(e.to_string()),
            }),
            StatusCode::BAD_REQUEST,
        )),
    }
}

async fn handle_health(state: Arc<GatewayState>) -> Result<impl warp::Reply, warp::Rejection> {
    let result = state.health.check_health();
    Ok(warp::reply::json(&result))
}
