use super::pool::{IdleSession, MuxPick, MuxSession, PendingConn};
use super::GatewayState;
use crate::fabric::frame::{EnvelopeCodec, UdpEnvelope, MAX_UDP_PAYLOAD};
use crate::fabric::session::{
    SessionState, SessionWriter, WriteError, DRAIN_TIMEOUT, WRITE_QUEUE_WATERMARK,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Duration};

/// Routing state for a UDP peer expires after this much inactivity.
pub const UDP_FLOW_TTL: Duration = Duration::from_secs(30);

const FLOW_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const MUX_READ_BUFFER: usize = 64 * 1024;

struct UdpFlow {
    session_id: u64,
    last_seen: Instant,
}

type FlowTable = Arc<Mutex<HashMap<SocketAddr, UdpFlow>>>;

/// Accept loop for one public TCP port: every connection becomes a
/// pending entry and pairing is kicked immediately.
pub async fn run_tcp_listener(
    state: Arc<GatewayState>,
    listener: TcpListener,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        state.metrics.pending_accepted.inc();
                        match state.pool.enqueue_pending(port, stream, peer).await {
                            Ok(id) => {
                                tracing::debug!(
                                    "Accepted {} on public port {} as pending {}",
                                    peer, port, id
                                );
                                service_pairs(&state, port).await;
                            }
                            Err(stream) => drop(stream),
                        }
                    }
                    Err(e) => {
                        tracing::error!("Accept error on public port {}: {}", port, e);
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("Public TCP listener on port {} shut down", port);
}

/// Drain ready pairs and start a pump for each. Called whenever either
/// queue gains an entry.
pub async fn service_pairs(state: &Arc<GatewayState>, port: u16) {
    for (pending, idle) in state.pool.take_pairs(port).await {
        tokio::spawn(pump_pair(state.clone(), port, pending, idle));
    }
}

async fn pump_pair(
    state: Arc<GatewayState>,
    port: u16,
    pending: PendingConn,
    idle: IdleSession,
) {
    let session = idle.session.clone();
    session.set_state(SessionState::Active).await;
    state.metrics.pairs_started.inc();
    state.metrics.active_pairs.inc();
    tracing::debug!(
        "Paired pending {} with session {} on port {}",
        pending.id,
        session.id(),
        port
    );

    let mut client = pending.stream;
    let mut tunnel = idle.stream;
    let mut shutdown = state.shutdown.subscribe();

    let result = tokio::select! {
        r = tokio::io::copy_bidirectional(&mut client, &mut tunnel) => r,
        _ = shutdown.changed() => {
            session.set_state(SessionState::Draining).await;
            match timeout(
                DRAIN_TIMEOUT,
                tokio::io::copy_bidirectional(&mut client, &mut tunnel),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Ok((0, 0)),
            }
        }
    };

    match result {
        Ok((up, down)) => tracing::debug!(
            "Pair on port {} finished: {} bytes up, {} bytes down",
            port,
            up,
            down
        ),
        Err(e) => tracing::debug!("Pair on port {} ended with error: {}", port, e),
    }

    session.close().await;
    state.metrics.active_pairs.dec();
    state.metrics.sessions_closed.inc();
}

/// Recv loop for one public UDP socket. Datagrams are wrapped in
/// envelopes and multiplexed onto the port's sessions; responses come
/// back through `mux_read_loop`.
pub async fn run_udp_listener(
    state: Arc<GatewayState>,
    socket: Arc<UdpSocket>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let flows: FlowTable = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    let mut sweep = tokio::time::interval(FLOW_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, peer)) => {
                        handle_datagram(&state, &socket, port, &flows, &buf[..len], peer).await;
                    }
                    Err(e) => {
                        tracing::error!("UDP recv error on public port {}: {}", port, e);
                    }
                }
            }
            _ = sweep.tick() => {
                let mut flows = flows.lock().await;
                flows.retain(|_, flow| flow.last_seen.elapsed() < UDP_FLOW_TTL);
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("Public UDP socket on port {} shut down", port);
}

async fn handle_datagram(
    state: &Arc<GatewayState>,
    socket: &Arc<UdpSocket>,
    port: u16,
    flows: &FlowTable,
    payload: &[u8],
    peer: SocketAddr,
) {
    state.metrics.udp_datagrams_in.inc();

    let SocketAddr::V4(peer_v4) = peer else {
        tracing::debug!("Dropping non-IPv4 datagram from {} on port {}", peer, port);
        return;
    };

    let pinned = flows.lock().await.get(&peer).map(|f| f.session_id);
    let mux = match state.pool.pick_mux(port, pinned).await {
        MuxPick::Existing(mux) => mux,
        MuxPick::Promote(idle) => promote_mux(state, socket.clone(), port, flows.clone(), idle).await,
        MuxPick::Empty => {
            state.metrics.udp_dropped_no_session.inc();
            tracing::warn!(
                "No session available for UDP datagram on port {}, dropping",
                port
            );
            return;
        }
    };

    let envelope = match UdpEnvelope::new(peer_v4, Bytes::copy_from_slice(payload)) {
        Ok(env) => env,
        Err(e) => {
            tracing::debug!("Unencodable datagram from {}: {}", peer, e);
            return;
        }
    };

    match mux.writer.try_enqueue(envelope.encode()) {
        Ok(()) => {
            let mut flows = flows.lock().await;
            flows.insert(
                peer,
                UdpFlow {
                    session_id: mux.session.id(),
                    last_seen: Instant::now(),
                },
            );
        }
        Err(WriteError::Backpressure) => {
            state.metrics.udp_dropped_backpressure.inc();
            tracing::debug!(
                "Session {} over write watermark, dropping datagram",
                mux.session.id()
            );
        }
        Err(WriteError::Closed) => {
            mux.close().await;
            state.pool.remove_mux(port, mux.session.id()).await;
            state.metrics.sessions_closed.inc();
        }
    }
}

/// Turn an idle session into a shared multiplexer: split the stream,
/// start the single writer task and the envelope reader. The session
/// stays in the pool for the port's flows to share.
async fn promote_mux(
    state: &Arc<GatewayState>,
    socket: Arc<UdpSocket>,
    port: u16,
    flows: FlowTable,
    idle: IdleSession,
) -> Arc<MuxSession> {
    let session = idle.session.clone();
    session.set_state(SessionState::Multiplex).await;

    let (read_half, write_half) = idle.stream.into_split();
    let (writer, queue) = SessionWriter::channel(WRITE_QUEUE_WATERMARK);
    let mux = Arc::new(MuxSession::new(session, writer));

    let writer_task = tokio::spawn(queue.run(write_half));
    let reader_task = tokio::spawn(mux_read_loop(
        state.clone(),
        socket,
        port,
        flows,
        mux.clone(),
        read_half,
    ));
    mux.register_task(writer_task).await;
    mux.register_task(reader_task).await;

    state.pool.add_mux(port, mux.clone()).await;
    tracing::debug!(
        "Session {} promoted to UDP multiplexer on port {}",
        mux.session.id(),
        port
    );
    mux
}

/// The one reader a UDP session gets: decode response envelopes and
/// emit them on the public socket. A framing violation or EOF closes
/// the session.
async fn mux_read_loop(
    state: Arc<GatewayState>,
    socket: Arc<UdpSocket>,
    port: u16,
    flows: FlowTable,
    mux: Arc<MuxSession>,
    mut read_half: OwnedReadHalf,
) {
    let mut codec = EnvelopeCodec::new();
    let mut buf = vec![0u8; MUX_READ_BUFFER];

    'outer: loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                codec.feed(&buf[..n]);
                loop {
                    match codec.decode() {
                        Ok(Some(envelope)) => {
                            emit_response(&state, &socket, &flows, envelope).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(
                                "Framing violation on session {}: {}",
                                mux.session.id(),
                                e
                            );
                            break 'outer;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!("Session {} read error: {}", mux.session.id(), e);
                break;
            }
        }
    }

    state.pool.remove_mux(port, mux.session.id()).await;
    if mux.close().await {
        state.metrics.sessions_closed.inc();
    }
}

async fn emit_response(
    state: &Arc<GatewayState>,
    socket: &Arc<UdpSocket>,
    flows: &FlowTable,
    envelope: UdpEnvelope,
) {
    // The all-zero form is reserved for control; never user data.
    let Some(client) = envelope.client() else {
        tracing::debug!("Ignoring control envelope from agent");
        return;
    };
    let addr = SocketAddr::V4(client);

    let known = {
        let mut flows = flows.lock().await;
        match flows.get_mut(&addr) {
            Some(flow) => {
                flow.last_seen = Instant::now();
                true
            }
            None => false,
        }
    };
    if !known {
        state.metrics.udp_dropped_unknown_flow.inc();
        tracing::debug!("Response for unknown flow {}, dropping", addr);
        return;
    }

    match socket.send_to(envelope.payload(), addr).await {
        Ok(_) => state.metrics.udp_datagrams_out.inc(),
        Err(e) => tracing::debug!("Failed to emit datagram to {}: {}", addr, e),
    }
}
