use super::pool::IdleSession;
use super::{dispatcher, GatewayError, GatewayState};
use crate::fabric::frame::{decode_port_header, PORT_HEADER_SIZE};
use crate::fabric::session::{Session, SessionState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

/// An agent must produce its 4-byte header within this window.
const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive on data-plane sockets; session liveness is inferred from
/// it, the framing itself carries no heartbeats.
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Losing the data-plane listener is fatal for the process; transient
/// accept errors are tolerated up to this streak.
const MAX_ACCEPT_ERRORS: u32 = 16;

/// The single accept loop for all agent sessions, across all bindings.
/// Routing is by the 4-byte port-selection header.
pub async fn run_data_plane(
    state: Arc<GatewayState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    let mut consecutive_errors = 0u32;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        consecutive_errors = 0;
                        let state = state.clone();
                        tokio::spawn(async move {
                            handshake(state, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("Data-plane accept error: {}", e);
                        consecutive_errors += 1;
                        if consecutive_errors >= MAX_ACCEPT_ERRORS {
                            return Err(GatewayError::DataPlaneLost);
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("Data plane stopped accepting sessions");
    Ok(())
}

/// Read exactly the header, validate the declared port, and park the
/// session in its pool. Anything invalid closes the socket with no
/// response.
async fn handshake(state: Arc<GatewayState>, mut stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = set_keepalive(&stream) {
        tracing::debug!("Failed to set keepalive for {}: {}", peer, e);
    }

    let mut header = [0u8; PORT_HEADER_SIZE];
    match timeout(HEADER_TIMEOUT, stream.read_exact(&mut header)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::debug!("Session from {} closed before header: {}", peer, e);
            state.metrics.sessions_refused.inc();
            return;
        }
        Err(_) => {
            tracing::debug!("Session from {} timed out sending header", peer);
            state.metrics.sessions_refused.inc();
            return;
        }
    }

    let port = match decode_port_header(header) {
        Ok(port) => port,
        Err(e) => {
            tracing::warn!("Session from {} sent invalid header: {}", peer, e);
            state.metrics.sessions_refused.inc();
            return;
        }
    };

    if !state.table.contains(port).await {
        tracing::debug!(
            "Session from {} declared unbound port {}, closing",
            peer,
            port
        );
        state.metrics.sessions_refused.inc();
        return;
    }

    let session = Arc::new(Session::new(state.session_ids.next(), port));
    session.set_state(SessionState::Idle).await;
    let session_id = session.id();

    if !state
        .pool
        .enqueue_idle(port, IdleSession { session, stream })
        .await
    {
        // The binding vanished between the lookup and the enqueue.
        state.metrics.sessions_refused.inc();
        return;
    }

    state.metrics.sessions_opened.inc();
    tracing::debug!(
        "Session {} from {} parked idle on port {}",
        session_id,
        peer,
        port
    );

    dispatcher::service_pairs(&state, port).await;
}

fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    sock.set_tcp_keepalive(&keepalive)
}
