use crate::fabric::session::{Session, SessionWriter};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// How long an accepted end-user connection may wait for a session.
pub const PAIR_TIMEOUT: Duration = Duration::from_secs(60);

/// An accepted end-user TCP connection waiting to be paired.
pub struct PendingConn {
    pub id: u64,
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub enqueued_at: Instant,
}

impl PendingConn {
    fn is_alive(&self) -> bool {
        self.stream.peer_addr().is_ok()
    }
}

/// An agent session parked in the pool, ready to serve.
pub struct IdleSession {
    pub session: Arc<Session>,
    pub stream: TcpStream,
}

impl IdleSession {
    fn is_alive(&self) -> bool {
        !self.session.is_closed() && self.stream.peer_addr().is_ok()
    }
}

/// A session promoted to UDP multiplexing: it stays in the pool and is
/// shared by many flows. Owns its reader and writer tasks.
pub struct MuxSession {
    pub session: Arc<Session>,
    pub writer: SessionWriter,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MuxSession {
    pub fn new(session: Arc<Session>, writer: SessionWriter) -> Self {
        Self {
            session,
            writer,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn register_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }

    /// Idempotent: the first caller aborts the pump tasks.
    pub async fn close(&self) -> bool {
        if self.session.close().await {
            for task in self.tasks.lock().await.drain(..) {
                task.abort();
            }
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct PortPool {
    pending: VecDeque<PendingConn>,
    idle: VecDeque<IdleSession>,
    mux: Vec<Arc<MuxSession>>,
    mux_rr: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolCounts {
    pub pending: usize,
    pub idle: usize,
    pub mux: usize,
}

/// Outcome of asking for a session to carry a UDP datagram.
pub enum MuxPick {
    /// An established multiplexer (flow pin or round-robin).
    Existing(Arc<MuxSession>),
    /// A fresh idle session; the dispatcher promotes it.
    Promote(IdleSession),
    /// Nothing available: the datagram is dropped.
    Empty,
}

/// Per-public-port queues of pending end-user connections and parked
/// agent sessions. One mutex per port; nothing network-blocking runs
/// under it.
pub struct SessionPool {
    pools: RwLock<HashMap<u16, Arc<Mutex<PortPool>>>>,
    pending_ids: AtomicU64,
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            pending_ids: AtomicU64::new(1),
        }
    }

    pub async fn create(&self, port: u16) {
        let mut pools = self.pools.write().await;
        pools.entry(port).or_default();
    }

    /// Remove the pool and hand back its multiplexers so the caller can
    /// close them outside the map lock. Pending and idle entries are
    /// dropped here, which closes their sockets.
    pub async fn destroy(&self, port: u16) -> Vec<Arc<MuxSession>> {
        let pool = {
            let mut pools = self.pools.write().await;
            pools.remove(&port)
        };
        match pool {
            Some(pool) => {
                let mut pool = pool.lock().await;
                pool.pending.clear();
                pool.idle.clear();
                pool.mux_rr = 0;
                std::mem::take(&mut pool.mux)
            }
            None => Vec::new(),
        }
    }

    async fn port_pool(&self, port: u16) -> Option<Arc<Mutex<PortPool>>> {
        self.pools.read().await.get(&port).cloned()
    }

    /// Enqueue an accepted end-user connection. Returns its pending id,
    /// or the connection back if the port has no pool anymore.
    pub async fn enqueue_pending(
        &self,
        port: u16,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<u64, TcpStream> {
        let Some(pool) = self.port_pool(port).await else {
            return Err(stream);
        };
        let id = self.pending_ids.fetch_add(1, Ordering::Relaxed);
        let mut pool = pool.lock().await;
        pool.pending.push_back(PendingConn {
            id,
            stream,
            peer,
            enqueued_at: Instant::now(),
        });
        Ok(id)
    }

    /// Park a freshly handshaken session. Returns false if the port's
    /// binding disappeared while the handshake ran.
    pub async fn enqueue_idle(&self, port: u16, idle: IdleSession) -> bool {
        match self.port_pool(port).await {
            Some(pool) => {
                pool.lock().await.idle.push_back(idle);
                true
            }
            None => false,
        }
    }

    /// Drain as many (pending, idle) pairs as both queues allow. Dead
    /// entries on either side are discarded silently. Idle sessions pop
    /// LIFO so the warmest socket serves first; pendings strictly FIFO.
    pub async fn take_pairs(&self, port: u16) -> Vec<(PendingConn, IdleSession)> {
        let Some(pool) = self.port_pool(port).await else {
            return Vec::new();
        };
        let mut pool = pool.lock().await;
        let mut pairs = Vec::new();

        loop {
            let pending = loop {
                match pool.pending.pop_front() {
                    Some(p) if p.is_alive() => break Some(p),
                    Some(_) => continue,
                    None => break None,
                }
            };
            let Some(pending) = pending else {
                break;
            };

            let idle = loop {
                match pool.idle.pop_back() {
                    Some(s) if s.is_alive() => break Some(s),
                    Some(_) => continue,
                    None => break None,
                }
            };
            match idle {
                Some(idle) => pairs.push((pending, idle)),
                None => {
                    // No session right now; the connection keeps waiting.
                    pool.pending.push_front(pending);
                    break;
                }
            }
        }

        pairs
    }

    /// Pick a session for a UDP datagram. A pinned session wins while it
    /// lives; new flows promote a fresh idle session when one exists,
    /// else share an established multiplexer round-robin.
    pub async fn pick_mux(&self, port: u16, pinned: Option<u64>) -> MuxPick {
        let Some(pool) = self.port_pool(port).await else {
            return MuxPick::Empty;
        };
        let mut pool = pool.lock().await;

        pool.mux.retain(|m| !m.session.is_closed());

        if let Some(id) = pinned {
            if let Some(mux) = pool.mux.iter().find(|m| m.session.id() == id) {
                return MuxPick::Existing(mux.clone());
            }
        }

        loop {
            match pool.idle.pop_back() {
                Some(s) if s.is_alive() => return MuxPick::Promote(s),
                Some(_) => continue,
                None => break,
            }
        }

        if pool.mux.is_empty() {
            return MuxPick::Empty;
        }
        let len = pool.mux.len();
        pool.mux_rr = (pool.mux_rr + 1) % len;
        MuxPick::Existing(pool.mux[pool.mux_rr].clone())
    }

    pub async fn add_mux(&self, port: u16, mux: Arc<MuxSession>) {
        if let Some(pool) = self.port_pool(port).await {
            pool.lock().await.mux.push(mux);
        }
    }

    pub async fn remove_mux(&self, port: u16, session_id: u64) {
        if let Some(pool) = self.port_pool(port).await {
            let mut pool = pool.lock().await;
            pool.mux.retain(|m| m.session.id() != session_id);
        }
    }

    /// Remove pendings that waited past `timeout`; the caller drops
    /// them, which closes the sockets gracefully.
    pub async fn sweep_pending(&self, timeout: Duration) -> Vec<PendingConn> {
        let pools: Vec<Arc<Mutex<PortPool>>> =
            self.pools.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for pool in pools {
            let mut pool = pool.lock().await;
            let mut keep = VecDeque::with_capacity(pool.pending.len());
            for conn in pool.pending.drain(..) {
                if conn.enqueued_at.elapsed() >= timeout {
                    expired.push(conn);
                } else {
                    keep.push_back(conn);
                }
            }
            pool.pending = keep;
        }
        expired
    }

    pub async fn counts(&self, port: u16) -> Option<PoolCounts> {
        let pool = self.port_pool(port).await?;
        let pool = pool.lock().await;
        Some(PoolCounts {
            pending: pool.pending.len(),
            idle: pool.idle.len(),
            mux: pool.mux.len(),
        })
    }

    pub async fn ports(&self) -> Vec<u16> {
        self.pools.read().await.keys().copied().collect()
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::session::SessionIds;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn idle_session(ids: &SessionIds, port: u16) -> (IdleSession, TcpStream) {
        let (near, far) = socket_pair().await;
        let session = Arc::new(Session::new(ids.next(), port));
        (
            IdleSession {
                session,
                stream: near,
            },
            far,
        )
    }

    #[tokio::test]
    async fn test_pairing_fifo_order() {
        let pool = SessionPool::new();
        pool.create(25565).await;
        let ids = SessionIds::new();

        let (c1, _k1) = socket_pair().await;
        let (c2, _k2) = socket_pair().await;
        let peer = c1.peer_addr().unwrap();
        let first = pool.enqueue_pending(25565, c1, peer).await.unwrap();
        let second = pool.enqueue_pending(25565, c2, peer).await.unwrap();
        assert!(first < second);

        let (s1, _f1) = idle_session(&ids, 25565).await;
        let (s2, _f2) = idle_session(&ids, 25565).await;
        pool.enqueue_idle(25565, s1).await;
        pool.enqueue_idle(25565, s2).await;

        let pairs = pool.take_pairs(25565).await;
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0.id, first);
        assert_eq!(pairs[1].0.id, second);
    }

    #[tokio::test]
    async fn test_pending_waits_without_sessions() {
        let pool = SessionPool::new();
        pool.create(25565).await;

        let (c1, _k1) = socket_pair().await;
        let peer = c1.peer_addr().unwrap();
        pool.enqueue_pending(25565, c1, peer).await.unwrap();

        assert!(pool.take_pairs(25565).await.is_empty());
        let counts = pool.counts(25565).await.unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn test_closed_session_discarded() {
        let pool = SessionPool::new();
        pool.create(25565).await;
        let ids = SessionIds::new();

        let (dead, _fd) = idle_session(&ids, 25565).await;
        dead.session.close().await;
        pool.enqueue_idle(25565, dead).await;
        let (live, _fl) = idle_session(&ids, 25565).await;
        let live_id = live.session.id();
        pool.enqueue_idle(25565, live).await;

        let (c1, _k1) = socket_pair().await;
        let peer = c1.peer_addr().unwrap();
        pool.enqueue_pending(25565, c1, peer).await.unwrap();

        let pairs = pool.take_pairs(25565).await;
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1.session.id(), live_id);
    }

    #[tokio::test]
    async fn test_sweep_expired_pending() {
        let pool = SessionPool::new();
        pool.create(25565).await;

        let (c1, _k1) = socket_pair().await;
        let peer = c1.peer_addr().unwrap();
        pool.enqueue_pending(25565, c1, peer).await.unwrap();

        assert!(pool.sweep_pending(Duration::from_secs(60)).await.is_empty());
        let expired = pool.sweep_pending(Duration::ZERO).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(pool.counts(25565).await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_destroy_fails() {
        let pool = SessionPool::new();
        pool.create(25565).await;
        pool.destroy(25565).await;

        let (c1, _k1) = socket_pair().await;
        let peer = c1.peer_addr().unwrap();
        assert!(pool.enqueue_pending(25565, c1, peer).await.is_err());

        let ids = SessionIds::new();
        let (idle, _f) = idle_session(&ids, 25565).await;
        assert!(!pool.enqueue_idle(25565, idle).await);
    }

    #[tokio::test]
    async fn test_pick_mux_promotes_then_pins() {
        let pool = SessionPool::new();
        pool.create(27015).await;
        let ids = SessionIds::new();

        let (idle, _far) = idle_session(&ids, 27015).await;
        let sid = idle.session.id();
        pool.enqueue_idle(27015, idle).await;

        // First flow promotes the idle session.
        let promoted = match pool.pick_mux(27015, None).await {
            MuxPick::Promote(s) => s,
            _ => panic!("expected promotion"),
        };
        assert_eq!(promoted.session.id(), sid);

        let (writer, _queue) = SessionWriter::channel(1024);
        pool.add_mux(27015, Arc::new(MuxSession::new(promoted.session.clone(), writer)))
            .await;

        // The pinned lookup finds it again.
        match pool.pick_mux(27015, Some(sid)).await {
            MuxPick::Existing(m) => assert_eq!(m.session.id(), sid),
            _ => panic!("expected existing multiplexer"),
        }

        // A flow pinned to a vanished session falls back to round-robin.
        match pool.pick_mux(27015, Some(9999)).await {
            MuxPick::Existing(m) => assert_eq!(m.session.id(), sid),
            _ => panic!("expected fallback to round-robin"),
        }
    }

    #[tokio::test]
    async fn test_pick_mux_empty() {
        let pool = SessionPool::new();
        pool.create(27015).await;
        assert!(matches!(pool.pick_mux(27015, None).await, MuxPick::Empty));
    }
}
