use super::manager::SessionEvent;
use super::{AgentState, MappingStatus};
use crate::config::{PortMapping, Protocol};
use crate::fabric::frame::{
    encode_port_header, looks_like_envelope, EnvelopeCodec, FrameError, UdpEnvelope,
    MAX_UDP_PAYLOAD,
};
use crate::fabric::session::{
    SessionWriter, WriteError, DRAIN_TIMEOUT, WRITE_QUEUE_WATERMARK,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

const FIRST_READ_BUFFER: usize = 8192;
const SESSION_READ_BUFFER: usize = 64 * 1024;
const FLOW_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Why a session stopped serving. The maintainer only cares about the
/// local-dial case, which gates replacements behind the backoff.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Local service dial failed: {0}")]
    LocalDial(#[source] std::io::Error),

    #[error("Session transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Framing violation: {0}")]
    Framing(#[from] FrameError),
}

/// One data-plane session, dialed by the agent: write the header, park
/// until the gateway uses us, then serve in TCP or UDP mode.
pub async fn run_session(
    state: Arc<AgentState>,
    mapping: PortMapping,
    public_port: u16,
    status: Arc<MappingStatus>,
    events: mpsc::Sender<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let host = state.server.host.clone();
    let refused = |status: &MappingStatus| {
        status.idle_sessions.fetch_sub(1, Ordering::Relaxed);
    };

    let mut stream = match TcpStream::connect((host.as_str(), state.server.port)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("Data-plane dial for '{}' failed: {}", mapping.name, e);
            refused(&status);
            let _ = events.send(SessionEvent::Refused).await;
            return;
        }
    };
    if let Err(e) = set_keepalive(&stream) {
        tracing::debug!("Failed to set keepalive: {}", e);
    }

    if stream
        .write_all(&encode_port_header(public_port))
        .await
        .is_err()
    {
        refused(&status);
        let _ = events.send(SessionEvent::Refused).await;
        return;
    }

    // Park idle. No response is expected until the gateway pairs or
    // multiplexes onto us; a close before any data is a refusal.
    let mut first = vec![0u8; FIRST_READ_BUFFER];
    let n = tokio::select! {
        result = stream.read(&mut first) => match result {
            Ok(0) | Err(_) => {
                refused(&status);
                let _ = events.send(SessionEvent::Refused).await;
                return;
            }
            Ok(n) => n,
        },
        _ = shutdown.changed() => {
            refused(&status);
            return;
        }
    };

    status.idle_sessions.fetch_sub(1, Ordering::Relaxed);
    status.active_sessions.fetch_add(1, Ordering::Relaxed);
    let _ = events.send(SessionEvent::Used).await;

    let udp_mode = match mapping.protocol {
        Protocol::Udp => true,
        Protocol::Tcp => false,
        Protocol::Both => looks_like_envelope(&first[..n]),
    };

    let result = if udp_mode {
        serve_udp(&state, &mapping, stream, &first[..n], shutdown).await
    } else {
        serve_tcp(&state, &mapping, &status, stream, &first[..n], shutdown).await
    };

    status.active_sessions.fetch_sub(1, Ordering::Relaxed);
    match result {
        Ok(()) => {
            let _ = events.send(SessionEvent::Served).await;
        }
        Err(ServeError::LocalDial(e)) => {
            tracing::debug!(
                "Session for mapping '{}' ended: local dial failed: {}",
                mapping.name,
                e
            );
            let _ = events.send(SessionEvent::DialFailed).await;
        }
        Err(e) => {
            tracing::debug!("Session for mapping '{}' ended: {}", mapping.name, e);
        }
    }
}

/// TCP mode: dial the local service once the first bytes arrive, replay
/// them, then pump until either side closes.
async fn serve_tcp(
    state: &Arc<AgentState>,
    mapping: &PortMapping,
    status: &Arc<MappingStatus>,
    mut tunnel: TcpStream,
    first: &[u8],
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServeError> {
    let mut local =
        match TcpStream::connect((mapping.local_host.as_str(), mapping.local_port)).await {
            Ok(stream) => stream,
            Err(e) => {
                state.metrics.local_dial_failures.inc();
                status.dial_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Mapping '{}' failed to dial {}:{}: {}",
                    mapping.name,
                    mapping.local_host,
                    mapping.local_port,
                    e
                );
                // A reset tells the end user the service is gone.
                let _ = tunnel.set_linger(Some(Duration::ZERO));
                return Err(ServeError::LocalDial(e));
            }
        };

    local.write_all(first).await?;

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut tunnel, &mut local) => {
            result?;
        }
        _ = shutdown.changed() => {
            let _ = timeout(
                DRAIN_TIMEOUT,
                tokio::io::copy_bidirectional(&mut tunnel, &mut local),
            )
            .await;
        }
    }
    Ok(())
}

/// A per-client local UDP socket plus its reply pump.
struct FlowSocket {
    socket: Arc<UdpSocket>,
    last_seen_ms: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

/// UDP mode: decode envelopes from the session, relay each payload via
/// a per-client socket, and wrap replies back onto the same session.
async fn serve_udp(
    state: &Arc<AgentState>,
    mapping: &PortMapping,
    tunnel: TcpStream,
    first: &[u8],
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServeError> {
    let target = tokio::net::lookup_host((mapping.local_host.as_str(), mapping.local_port))
        .await
        .map_err(|e| {
            state.metrics.local_dial_failures.inc();
            ServeError::LocalDial(e)
        })?
        .next()
        .ok_or_else(|| {
            state.metrics.local_dial_failures.inc();
            ServeError::LocalDial(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} did not resolve", mapping.local_host),
            ))
        })?;

    let (mut read_half, write_half) = tunnel.into_split();
    let (writer, queue) = SessionWriter::channel(WRITE_QUEUE_WATERMARK);
    let writer_task = tokio::spawn(queue.run(write_half));

    let epoch = Instant::now();
    let flow_idle_ms = mapping.udp_flow_idle().as_millis() as u64;
    let mut sockets: HashMap<SocketAddrV4, FlowSocket> = HashMap::new();
    let mut codec = EnvelopeCodec::new();
    codec.feed(first);

    let mut sweep = tokio::time::interval(FLOW_SWEEP_INTERVAL);
    let mut buf = vec![0u8; SESSION_READ_BUFFER];
    let mut result = Ok(());

    'outer: loop {
        // Drain everything decodable, including the initial chunk.
        loop {
            match codec.decode() {
                Ok(Some(envelope)) => {
                    relay_envelope(state, target, &mut sockets, &writer, epoch, envelope).await;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        "Framing violation from gateway on '{}': {}",
                        mapping.name,
                        e
                    );
                    result = Err(ServeError::Framing(e));
                    break 'outer;
                }
            }
        }

        tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => codec.feed(&buf[..n]),
                Err(e) => {
                    result = Err(ServeError::Transport(e));
                    break;
                }
            },
            _ = sweep.tick() => {
                let now_ms = epoch.elapsed().as_millis() as u64;
                sockets.retain(|client, flow| {
                    let idle = now_ms.saturating_sub(flow.last_seen_ms.load(Ordering::Relaxed));
                    if idle >= flow_idle_ms {
                        tracing::debug!("Expiring idle UDP flow for {}", client);
                        flow.task.abort();
                        false
                    } else {
                        true
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }

    // Expiry closed sockets along the way; closing the session closes
    // the rest.
    for (_, flow) in sockets.drain() {
        flow.task.abort();
    }
    writer_task.abort();
    result
}

async fn relay_envelope(
    state: &Arc<AgentState>,
    target: SocketAddr,
    sockets: &mut HashMap<SocketAddrV4, FlowSocket>,
    writer: &SessionWriter,
    epoch: Instant,
    envelope: UdpEnvelope,
) {
    // The zero form is reserved for control traffic.
    let Some(client) = envelope.client() else {
        tracing::debug!("Ignoring control envelope");
        return;
    };
    let now_ms = epoch.elapsed().as_millis() as u64;

    if !sockets.contains_key(&client) {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                state.metrics.local_dial_failures.inc();
                tracing::warn!("Failed to open local UDP socket for {}: {}", client, e);
                return;
            }
        };
        let last_seen_ms = Arc::new(AtomicU64::new(now_ms));
        let task = tokio::spawn(flow_reply_loop(
            socket.clone(),
            client,
            writer.clone(),
            last_seen_ms.clone(),
            epoch,
        ));
        sockets.insert(
            client,
            FlowSocket {
                socket,
                last_seen_ms,
                task,
            },
        );
    }

    let Some(flow) = sockets.get(&client) else {
        return;
    };
    flow.last_seen_ms.store(now_ms, Ordering::Relaxed);
    if let Err(e) = flow.socket.send_to(envelope.payload(), target).await {
        tracing::debug!("Failed to relay datagram to {}: {}", target, e);
        state.metrics.local_dial_failures.inc();
    }
}

/// Pump replies from one local socket back through the session, echoing
/// the original client address so the gateway routes unambiguously.
async fn flow_reply_loop(
    socket: Arc<UdpSocket>,
    client: SocketAddrV4,
    writer: SessionWriter,
    last_seen_ms: Arc<AtomicU64>,
    epoch: Instant,
) {
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, _)) => {
                last_seen_ms.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
                let envelope = match UdpEnvelope::new(client, Bytes::copy_from_slice(&buf[..n])) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::debug!("Unencodable reply for {}: {}", client, e);
                        continue;
                    }
                };
                match writer.try_enqueue(envelope.encode()) {
                    Ok(()) => {}
                    Err(WriteError::Backpressure) => {
                        tracing::debug!("Reply for {} dropped at write watermark", client);
                    }
                    Err(WriteError::Closed) => break,
                }
            }
            Err(e) => {
                tracing::debug!("Reply socket for {} closed: {}", client, e);
                break;
            }
        }
    }
}

fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    sock.set_tcp_keepalive(&keepalive)
}
