use crate::config::{PortRangeSpec, SpecificPortSpec};
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No public port available")]
    NoPortAvailable,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AvailablePort {
    pub port: u16,
    pub kind: &'static str,
    pub source: String,
}

/// Owns the configured port specs and tracks which public ports are
/// rented out. Selection is deterministic: a viable preferred port wins,
/// otherwise the numerically smallest available port.
pub struct PortRegistry {
    inner: RwLock<RegistryInner>,
}

struct RegistryInner {
    ranges: Vec<PortRangeSpec>,
    singles: Vec<SpecificPortSpec>,
    /// Ports the process itself occupies (web port, data-plane port).
    reserved: BTreeSet<u16>,
    bound: BTreeSet<u16>,
}

impl RegistryInner {
    fn covered(&self, port: u16) -> bool {
        self.ranges
            .iter()
            .any(|r| r.enabled && port >= r.start && port <= r.end)
            || self.singles.iter().any(|s| s.enabled && s.port == port)
    }

    fn free(&self, port: u16) -> bool {
        self.covered(port) && !self.bound.contains(&port) && !self.reserved.contains(&port)
    }

    fn enabled_ports(&self) -> BTreeSet<u16> {
        let mut set = BTreeSet::new();
        for range in self.ranges.iter().filter(|r| r.enabled) {
            set.extend(range.start..=range.end);
        }
        for single in self.singles.iter().filter(|s| s.enabled) {
            set.insert(single.port);
        }
        set
    }
}

impl PortRegistry {
    pub fn new(
        ranges: Vec<PortRangeSpec>,
        singles: Vec<SpecificPortSpec>,
        reserved: impl IntoIterator<Item = u16>,
    ) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                ranges,
                singles,
                reserved: reserved.into_iter().collect(),
                bound: BTreeSet::new(),
            }),
        }
    }

    /// Swap in a new spec set after a config edit. Already-bound ports
    /// stay bound; the caller decides whether their bindings survive.
    pub async fn replace_specs(
        &self,
        ranges: Vec<PortRangeSpec>,
        singles: Vec<SpecificPortSpec>,
    ) {
        let mut inner = self.inner.write().await;
        inner.ranges = ranges;
        inner.singles = singles;
    }

    /// Every port of every enabled spec, minus bound and
    /// process-reserved ports. Ascending, overlaps collapsed.
    pub async fn list_available(&self) -> Vec<AvailablePort> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for port in inner.enabled_ports() {
            if inner.bound.contains(&port) || inner.reserved.contains(&port) {
                continue;
            }
            let (kind, source) = describe(&inner, port);
            out.push(AvailablePort { port, kind, source });
        }
        out
    }

    pub async fn allocate(&self, preferred: Option<u16>) -> Result<u16, RegistryError> {
        let mut inner = self.inner.write().await;

        if let Some(port) = preferred {
            if inner.free(port) {
                inner.bound.insert(port);
                return Ok(port);
            }
        }

        let port = inner
            .enabled_ports()
            .into_iter()
            .find(|p| !inner.bound.contains(p) && !inner.reserved.contains(p))
            .ok_or(RegistryError::NoPortAvailable)?;
        inner.bound.insert(port);
        Ok(port)
    }

    /// Idempotent.
    pub async fn release(&self, port: u16) {
        let mut inner = self.inner.write().await;
        inner.bound.remove(&port);
    }

    pub async fn is_bound(&self, port: u16) -> bool {
        self.inner.read().await.bound.contains(&port)
    }

    /// Whether any enabled spec still covers this port. Bindings on
    /// ports that fall out of coverage after a config edit get torn
    /// down by the caller.
    pub async fn is_covered(&self, port: u16) -> bool {
        self.inner.read().await.covered(port)
    }

    pub async fn bound_count(&self) -> usize {
        self.inner.read().await.bound.len()
    }
}

fn describe(inner: &RegistryInner, port: u16) -> (&'static str, String) {
    for range in inner.ranges.iter().filter(|r| r.enabled) {
        if port >= range.start && port <= range.end {
            let source = range
                .name
                .clone()
                .unwrap_or_else(|| format!("range {}-{}", range.start, range.end));
            return ("range", source);
        }
    }
    for single in inner.singles.iter().filter(|s| s.enabled) {
        if single.port == port {
            let source = single
                .name
                .clone()
                .unwrap_or_else(|| format!("port {}", single.port));
            return ("specific", source);
        }
    }
    ("specific", String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u16, end: u16, enabled: bool) -> PortRangeSpec {
        PortRangeSpec {
            start,
            end,
            enabled,
            name: None,
        }
    }

    fn single(port: u16) -> SpecificPortSpec {
        SpecificPortSpec {
            port,
            enabled: true,
            name: None,
        }
    }

    #[tokio::test]
    async fn test_allocate_smallest_first() {
        let registry = PortRegistry::new(vec![range(30000, 30002, true)], vec![], []);
        assert_eq!(registry.allocate(None).await.unwrap(), 30000);
        assert_eq!(registry.allocate(None).await.unwrap(), 30001);
        assert_eq!(registry.allocate(None).await.unwrap(), 30002);
        assert_eq!(
            registry.allocate(None).await,
            Err(RegistryError::NoPortAvailable)
        );
    }

    #[tokio::test]
    async fn test_preferred_wins_when_free() {
        let registry =
            PortRegistry::new(vec![range(30000, 30010, true)], vec![single(25565)], []);
        assert_eq!(registry.allocate(Some(25565)).await.unwrap(), 25565);
    }

    #[tokio::test]
    async fn test_preferred_taken_falls_back() {
        let registry = PortRegistry::new(vec![range(30000, 30010, true)], vec![], []);
        assert_eq!(registry.allocate(Some(30005)).await.unwrap(), 30005);
        // Same preference again: falls back to the smallest free port.
        let port = registry.allocate(Some(30005)).await.unwrap();
        assert_eq!(port, 30000);
    }

    #[tokio::test]
    async fn test_preferred_outside_specs_falls_back() {
        let registry = PortRegistry::new(vec![range(30000, 30010, true)], vec![], []);
        assert_eq!(registry.allocate(Some(40000)).await.unwrap(), 30000);
    }

    #[tokio::test]
    async fn test_release_then_reallocate_same_port() {
        let registry = PortRegistry::new(vec![], vec![single(25565)], []);
        assert_eq!(registry.allocate(Some(25565)).await.unwrap(), 25565);
        registry.release(25565).await;
        assert_eq!(registry.allocate(Some(25565)).await.unwrap(), 25565);
    }

    #[tokio::test]
    async fn test_release_idempotent() {
        let registry = PortRegistry::new(vec![], vec![single(25565)], []);
        registry.release(25565).await;
        registry.release(25565).await;
        assert_eq!(registry.allocate(None).await.unwrap(), 25565);
    }

    #[tokio::test]
    async fn test_disabled_specs_excluded() {
        let registry = PortRegistry::new(vec![range(30000, 30010, false)], vec![], []);
        assert_eq!(
            registry.allocate(None).await,
            Err(RegistryError::NoPortAvailable)
        );
        assert!(registry.list_available().await.is_empty());
    }

    #[tokio::test]
    async fn test_reserved_ports_excluded() {
        let registry = PortRegistry::new(vec![range(9000, 9002, true)], vec![], [9000, 9001]);
        assert_eq!(registry.allocate(None).await.unwrap(), 9002);
    }

    #[tokio::test]
    async fn test_overlapping_specs_union() {
        let registry = PortRegistry::new(
            vec![range(30000, 30005, true), range(30003, 30008, true)],
            vec![single(30004)],
            [],
        );
        let available = registry.list_available().await;
        let ports: Vec<u16> = available.iter().map(|a| a.port).collect();
        assert_eq!(ports, (30000..=30008).collect::<Vec<u16>>());
    }

    #[tokio::test]
    async fn test_available_sources() {
        let registry = PortRegistry::new(
            vec![PortRangeSpec {
                start: 30000,
                end: 30000,
                enabled: true,
                name: Some("bulk".to_string()),
            }],
            vec![single(25565)],
            [],
        );
        let available = registry.list_available().await;
        assert_eq!(available[0].port, 25565);
        assert_eq!(available[0].kind, "specific");
        assert_eq!(available[1].port, 30000);
        assert_eq!(available[1].kind, "range");
        assert_eq!(available[1].source, "bulk");
    }
}
