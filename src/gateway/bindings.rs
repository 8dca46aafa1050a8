use crate::config::Protocol;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock};

/// A rented public port: the runtime association between a public port,
/// the protocols it listens on, and the agent-side local port it serves.
/// Owns the shutdown signal for its listener tasks.
pub struct PortBinding {
    pub public_port: u16,
    pub local_port: u16,
    pub protocol: Protocol,
    pub preferred_port: Option<u16>,
    pub created_at: Instant,
    shutdown: watch::Sender<bool>,
}

impl PortBinding {
    pub fn new(
        public_port: u16,
        local_port: u16,
        protocol: Protocol,
        preferred_port: Option<u16>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            public_port,
            local_port,
            protocol,
            preferred_port,
            created_at: Instant::now(),
            shutdown,
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

struct TableInner {
    by_public: HashMap<u16, Arc<PortBinding>>,
    by_local: HashMap<u16, u16>,
}

/// Live bindings, indexed both ways. 1:1 with listening sockets on the
/// public side: a port appears here exactly while its listeners run.
pub struct MappingTable {
    inner: RwLock<TableInner>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                by_public: HashMap::new(),
                by_local: HashMap::new(),
            }),
        }
    }

    pub async fn insert(&self, binding: Arc<PortBinding>) {
        let mut inner = self.inner.write().await;
        inner.by_local.insert(binding.local_port, binding.public_port);
        inner.by_public.insert(binding.public_port, binding);
    }

    pub async fn get(&self, public_port: u16) -> Option<Arc<PortBinding>> {
        self.inner.read().await.by_public.get(&public_port).cloned()
    }

    pub async fn get_by_local(&self, local_port: u16) -> Option<Arc<PortBinding>> {
        let inner = self.inner.read().await;
        let public = inner.by_local.get(&local_port)?;
        inner.by_public.get(public).cloned()
    }

    pub async fn contains(&self, public_port: u16) -> bool {
        self.inner.read().await.by_public.contains_key(&public_port)
    }

    pub async fn remove(&self, public_port: u16) -> Option<Arc<PortBinding>> {
        let mut inner = self.inner.write().await;
        let binding = inner.by_public.remove(&public_port)?;
        inner.by_local.remove(&binding.local_port);
        Some(binding)
    }

    pub async fn list(&self) -> Vec<Arc<PortBinding>> {
        self.inner.read().await.by_public.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_public.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_public.is_empty()
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::new()
    }
}
