//! Full-fabric tests: a real gateway and a real agent on loopback,
//! with end-user clients on the public side and echo services on the
//! private side.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use burrow::agent::AgentContainer;
use burrow::config::{
    AgentConfig, AgentServerConfig, ConnectionTuning, GatewayConfig, GatewayServerConfig,
    PortMapping, Protocol, SpecificPortSpec,
};
use burrow::fabric::frame::encode_port_header;
use burrow::gateway::{release_by_local, GatewayContainer};

async fn free_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

async fn spawn_tcp_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

async fn spawn_udp_echo() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    port
}

struct Fabric {
    gateway: Arc<GatewayContainer>,
    agent: Arc<AgentContainer>,
    public_port: u16,
    agent_config_path: PathBuf,
    dir: PathBuf,
}

impl Fabric {
    async fn shutdown(self) {
        self.agent.stop().await;
        self.gateway.stop().await;
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

async fn agent_config(
    data_port: u16,
    web_port: u16,
    protocol: Protocol,
    local_port: u16,
    public_port: u16,
    min_idle: usize,
    max_total: usize,
) -> AgentConfig {
    AgentConfig {
        server: AgentServerConfig {
            host: "127.0.0.1".to_string(),
            port: data_port,
            web_port,
            local_api_port: free_tcp_port().await,
        },
        port_mappings: vec![PortMapping {
            id: 1,
            name: "test-service".to_string(),
            local_host: "127.0.0.1".to_string(),
            local_port,
            protocol,
            preferred_port: Some(public_port),
            assigned_public_port: None,
            enabled: true,
            description: None,
            auto_reconnect: true,
            udp_flow_idle_ms: None,
        }],
        connection: ConnectionTuning {
            min_idle,
            max_total,
            check_interval_ms: 100,
            reconnect_delay_ms: 200,
        },
    }
}

/// Bring up a gateway and an agent wired to each other, with one
/// mapping toward `local_port`, and wait for the first idle session.
async fn start_fabric(
    tag: &str,
    protocol: Protocol,
    local_port: u16,
    public_port: u16,
    min_idle: usize,
    max_total: usize,
) -> Fabric {
    let dir = std::env::temp_dir().join(format!("burrow-e2e-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let web_port = free_tcp_port().await;
    let data_port = free_tcp_port().await;

    let gateway_config = GatewayConfig {
        server: GatewayServerConfig {
            web_port,
            data_plane_port: data_port,
            bind_ip: "127.0.0.1".to_string(),
        },
        port_ranges: vec![],
        specific_ports: vec![SpecificPortSpec {
            port: public_port,
            enabled: true,
            name: None,
        }],
    };
    let gateway =
        Arc::new(GatewayContainer::new(gateway_config, dir.join("gateway.json")).unwrap());
    gateway.start().await.unwrap();
    let gateway_run = gateway.clone();
    tokio::spawn(async move {
        let _ = gateway_run.run().await;
    });

    let agent_config_path = dir.join("agent.json");
    let config = agent_config(
        data_port, web_port, protocol, local_port, public_port, min_idle, max_total,
    )
    .await;
    let agent = Arc::new(AgentContainer::new(config, agent_config_path.clone()).unwrap());
    agent.start().await.unwrap();

    wait_for_sessions(&gateway, public_port, 1).await;

    Fabric {
        gateway,
        agent,
        public_port,
        agent_config_path,
        dir,
    }
}

async fn wait_for_sessions(gateway: &Arc<GatewayContainer>, port: u16, want: usize) {
    let state = gateway.state();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(counts) = state.pool.counts(port).await {
            if counts.idle + counts.mux >= want {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "fabric did not produce {} session(s) on port {} in time",
            want,
            port
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn echo_roundtrip(public_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(("127.0.0.1", public_port))
        .await
        .expect("public port should accept");
    client.write_all(payload).await.unwrap();

    let mut got = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), client.read_exact(&mut got))
        .await
        .expect("echo should arrive in time")
        .unwrap();
    got
}

#[tokio::test]
async fn test_single_client_tcp_echo() {
    let echo_port = spawn_tcp_echo().await;
    let public_port = free_tcp_port().await;
    let fabric = start_fabric("tcp-echo", Protocol::Tcp, echo_port, public_port, 2, 10).await;

    let got = echo_roundtrip(fabric.public_port, b"ping").await;
    assert_eq!(&got, b"ping");

    // The pair winds down once the client is gone.
    let state = fabric.gateway.state();
    let deadline = Instant::now() + Duration::from_secs(5);
    while state.metrics.active_pairs.get() != 0 {
        assert!(Instant::now() < deadline, "active pair count did not drain");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fabric.shutdown().await;
}

#[tokio::test]
async fn test_three_concurrent_clients_no_crosstalk() {
    let echo_port = spawn_tcp_echo().await;
    let public_port = free_tcp_port().await;
    let fabric = start_fabric("tcp-three", Protocol::Tcp, echo_port, public_port, 2, 10).await;

    let mut tasks = Vec::new();
    for i in 0..3u8 {
        let port = fabric.public_port;
        tasks.push(tokio::spawn(async move {
            let payload = vec![b'a' + i; 64];
            let got = echo_roundtrip(port, &payload).await;
            assert_eq!(got, payload, "client {} saw someone else's bytes", i);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // At quiescence the idle pool is back at its floor.
    wait_for_sessions(&fabric.gateway, fabric.public_port, 2).await;

    fabric.shutdown().await;
}

#[tokio::test]
async fn test_udp_fanout_two_clients() {
    let echo_port = spawn_udp_echo().await;
    let public_port = free_udp_port().await;
    let fabric = start_fabric("udp-fanout", Protocol::Udp, echo_port, public_port, 2, 10).await;

    let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = ("127.0.0.1", fabric.public_port);
    client_a.connect(target).await.unwrap();
    client_b.connect(target).await.unwrap();

    for i in 0..10u8 {
        client_a.send(format!("A{}", i).as_bytes()).await.unwrap();
        client_b.send(format!("B{}", i).as_bytes()).await.unwrap();
    }

    let collect = |socket: UdpSocket, prefix: u8| async move {
        let mut seen = std::collections::HashSet::new();
        let mut buf = [0u8; 1500];
        while seen.len() < 10 {
            let n = timeout(Duration::from_secs(5), socket.recv(&mut buf))
                .await
                .expect("replies should arrive")
                .unwrap();
            assert_eq!(buf[0], prefix, "client received another client's datagram");
            seen.insert(buf[..n].to_vec());
        }
        seen
    };

    let seen_a = collect(client_a, b'A').await;
    let seen_b = collect(client_b, b'B').await;
    assert_eq!(seen_a.len(), 10);
    assert_eq!(seen_b.len(), 10);

    fabric.shutdown().await;
}

#[tokio::test]
async fn test_preferred_port_unavailable_falls_back() {
    // Two mappings compete for the same preferred public port; the
    // loser still succeeds, on a different port from the enabled set.
    let echo_port = spawn_tcp_echo().await;
    let public_port = free_tcp_port().await;
    let fabric = start_fabric("fallback", Protocol::Tcp, echo_port, public_port, 1, 4).await;

    let state = fabric.gateway.state();
    let fallback_port = free_tcp_port().await;
    {
        let mut config = state.config.write().await;
        config.specific_ports.push(SpecificPortSpec {
            port: fallback_port,
            enabled: true,
            name: None,
        });
    }
    state
        .registry
        .replace_specs(vec![], state.config.read().await.specific_ports.clone())
        .await;

    let binding = burrow::gateway::activate_mapping(
        &state,
        echo_port.wrapping_add(1),
        Some(fabric.public_port),
        Protocol::Tcp,
    )
    .await
    .expect("fallback allocation should succeed");
    assert_ne!(binding.public_port, fabric.public_port);
    assert_eq!(binding.public_port, fallback_port);

    fabric.shutdown().await;
}

#[tokio::test]
async fn test_agent_restart_recovers_same_public_port() {
    let echo_port = spawn_tcp_echo().await;
    let public_port = free_tcp_port().await;
    let fabric = start_fabric("restart", Protocol::Tcp, echo_port, public_port, 1, 4).await;

    // A client mid-conversation when the agent dies...
    let mut client = TcpStream::connect(("127.0.0.1", fabric.public_port))
        .await
        .unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut got = [0u8; 5];
    timeout(Duration::from_secs(2), client.read_exact(&mut got))
        .await
        .unwrap()
        .unwrap();

    fabric.agent.stop().await;

    // ...sees its socket close within the drain window.
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(7), client.read(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))), "client socket should close");

    // A restarted agent reclaims the sticky public port.
    let config = burrow::load_agent_config(&fabric.agent_config_path).unwrap();
    assert_eq!(config.port_mappings[0].assigned_public_port, Some(public_port));
    let agent = Arc::new(AgentContainer::new(config, fabric.agent_config_path.clone()).unwrap());
    agent.start().await.unwrap();
    wait_for_sessions(&fabric.gateway, public_port, 1).await;

    let got = echo_roundtrip(public_port, b"again").await;
    assert_eq!(&got, b"again");

    agent.stop().await;
    fabric.shutdown().await;
}

#[tokio::test]
async fn test_invalid_header_closes_session_quickly() {
    let echo_port = spawn_tcp_echo().await;
    let public_port = free_tcp_port().await;
    let fabric = start_fabric("badheader", Protocol::Tcp, echo_port, public_port, 1, 4).await;
    let data_port = fabric.gateway.state().data_plane_port;

    // Port 99999 does not fit in u16: the gateway closes with no reply.
    let mut rogue = TcpStream::connect(("127.0.0.1", data_port)).await.unwrap();
    rogue.write_all(&99999u32.to_be_bytes()).await.unwrap();

    let started = Instant::now();
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(1), rogue.read(&mut buf))
        .await
        .expect("close should be prompt")
        .unwrap_or(0);
    assert_eq!(n, 0, "no bytes may be delivered on a refused session");
    assert!(started.elapsed() < Duration::from_millis(500));

    // A well-formed header for an unbound port is refused the same way.
    let unbound = free_tcp_port().await;
    let mut rogue = TcpStream::connect(("127.0.0.1", data_port)).await.unwrap();
    rogue.write_all(&encode_port_header(unbound)).await.unwrap();
    let n = timeout(Duration::from_secs(1), rogue.read(&mut buf))
        .await
        .expect("close should be prompt")
        .unwrap_or(0);
    assert_eq!(n, 0);

    fabric.shutdown().await;
}

#[tokio::test]
async fn test_release_stops_public_accepts() {
    let echo_port = spawn_tcp_echo().await;
    let public_port = free_tcp_port().await;
    let fabric = start_fabric("release", Protocol::Tcp, echo_port, public_port, 1, 4).await;

    let got = echo_roundtrip(fabric.public_port, b"up").await;
    assert_eq!(&got, b"up");

    let state = fabric.gateway.state();
    assert!(release_by_local(&state, echo_port).await);

    // The listener is gone; new connections are refused until the port
    // is rented again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let result = TcpStream::connect(("127.0.0.1", fabric.public_port)).await;
    assert!(result.is_err(), "released port must not accept");

    fabric.shutdown().await;
}
