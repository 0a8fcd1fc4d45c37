//! Backend registry
//!
//! Providers, the health checker and the proxy report what they see as
//! [`DiscoveryEvent`]s. The registry owns the backend set: it deduplicates
//! events by backend id, coalesces changes that arrive within the debounce
//! window, and publishes only net changes as [`RegistryEvent`]s together with
//! a fresh snapshot of the backend set.

use crate::config::RegistryConfig;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Health of a backend as far as routing is concerned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendHealth {
    /// Nothing reported yet; routable
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl BackendHealth {
    pub fn is_routable(self) -> bool {
        self != BackendHealth::Unhealthy
    }
}

/// A routable backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    /// Unique id (container id for Docker backends)
    pub id: String,
    /// Human readable name (container or static entry name)
    pub name: String,
    /// Provider that discovered this backend
    pub provider: String,
    pub address: SocketAddr,
    pub health: BackendHealth,
    pub labels: BTreeMap<String, String>,
    /// Discovery order, assigned by the registry
    pub seq: u64,
}

impl Backend {
    pub fn new(id: &str, name: &str, provider: &str, address: SocketAddr) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            provider: provider.to_string(),
            address,
            health: BackendHealth::Unknown,
            labels: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Set labels (builder pattern)
    pub fn with_labels<K, V, I>(mut self, labels: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Set health (builder pattern)
    pub fn with_health(mut self, health: BackendHealth) -> Self {
        self.health = health;
        self
    }
}

/// Committed backends keyed by id
pub type BackendSet = BTreeMap<String, Backend>;

/// Net change published by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(Backend),
    Removed(Backend),
    Updated(Backend),
}

impl RegistryEvent {
    pub fn backend(&self) -> &Backend {
        match self {
            RegistryEvent::Added(b) | RegistryEvent::Removed(b) | RegistryEvent::Updated(b) => b,
        }
    }
}

/// Input to the registry
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A backend appeared or changed
    Upsert(Backend),
    /// A backend went away
    Remove { provider: String, id: String },
    /// Complete view from one provider; anything of that provider not listed is removed
    Snapshot {
        provider: String,
        backends: Vec<Backend>,
    },
    /// Health transition from the health checker or the proxy
    Health { id: String, health: BackendHealth },
    /// The provider's feed cannot be reached; keep what we have
    Unavailable { provider: String, reason: String },
}

/// The registry's bookkeeping, free of any I/O so it can be driven directly
#[derive(Debug, Default)]
pub struct RegistryState {
    committed: BackendSet,
    /// Latest desired state per id since the last flush (`None` = removed)
    pending: HashMap<String, Option<Backend>>,
    next_seq: u64,
    degraded: BTreeSet<String>,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> &BackendSet {
        &self.committed
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    /// Current view of a backend, pending changes included
    fn current(&self, id: &str) -> Option<&Backend> {
        match self.pending.get(id) {
            Some(change) => change.as_ref(),
            None => self.committed.get(id),
        }
    }

    /// Record an event. Returns true when a change is now pending.
    pub fn apply(&mut self, event: DiscoveryEvent) -> bool {
        match event {
            DiscoveryEvent::Upsert(backend) => {
                self.upsert(backend);
                true
            }
            DiscoveryEvent::Remove { provider, id } => {
                if self.current(&id).is_some() {
                    debug!(provider = %provider, id = %id, "Backend removal pending");
                    self.pending.insert(id, None);
                    true
                } else {
                    false
                }
            }
            DiscoveryEvent::Snapshot { provider, backends } => {
                if self.degraded.remove(&provider) {
                    info!(provider = %provider, "Discovery feed recovered");
                }
                let listed: BTreeSet<String> = backends.iter().map(|b| b.id.clone()).collect();
                let stale: Vec<String> = self
                    .committed
                    .values()
                    .chain(self.pending.values().flatten())
                    .filter(|b| b.provider == provider && !listed.contains(&b.id))
                    .map(|b| b.id.clone())
                    .collect();
                for id in stale {
                    self.pending.insert(id, None);
                }
                for backend in backends {
                    self.upsert(backend);
                }
                true
            }
            DiscoveryEvent::Health { id, health } => {
                let Some(current) = self.current(&id) else {
                    return false;
                };
                if current.health == health {
                    return false;
                }
                let mut updated = current.clone();
                updated.health = health;
                self.pending.insert(id, Some(updated));
                true
            }
            DiscoveryEvent::Unavailable { provider, reason } => {
                if self.degraded.insert(provider.clone()) {
                    warn!(
                        provider = %provider,
                        reason = %reason,
                        backends = self.committed.len(),
                        "Discovery feed unavailable, keeping last known backends"
                    );
                }
                false
            }
        }
    }

    fn upsert(&mut self, mut backend: Backend) {
        match self.current(&backend.id) {
            Some(existing) => {
                backend.seq = existing.seq;
                if backend.health == BackendHealth::Unknown {
                    backend.health = existing.health;
                }
            }
            None => {
                // a committed backend with a pending removal keeps its place
                backend.seq = match self.committed.get(&backend.id) {
                    Some(old) => old.seq,
                    None => {
                        self.next_seq += 1;
                        self.next_seq
                    }
                };
            }
        }
        self.pending.insert(backend.id.clone(), Some(backend));
    }

    /// Commit pending changes, returning only the net ones
    pub fn flush(&mut self) -> Vec<RegistryEvent> {
        let mut events = Vec::new();

        for (id, change) in self.pending.drain() {
            match (change, self.committed.get(&id)) {
                (None, None) => {}
                (None, Some(_)) => {
                    if let Some(old) = self.committed.remove(&id) {
                        events.push(RegistryEvent::Removed(old));
                    }
                }
                (Some(new), None) => {
                    self.committed.insert(id, new.clone());
                    events.push(RegistryEvent::Added(new));
                }
                (Some(new), Some(old)) => {
                    if &new != old {
                        self.committed.insert(id, new.clone());
                        events.push(RegistryEvent::Updated(new));
                    }
                }
            }
        }

        events.sort_by(|a, b| {
            (a.backend().seq, &a.backend().id).cmp(&(b.backend().seq, &b.backend().id))
        });
        events
    }
}

/// Handle to the running registry
pub struct BackendRegistry {
    tx: mpsc::Sender<DiscoveryEvent>,
    events: broadcast::Sender<RegistryEvent>,
    backends_rx: watch::Receiver<Arc<BackendSet>>,
    degraded_rx: watch::Receiver<bool>,
}

impl BackendRegistry {
    /// Start the registry task
    pub fn spawn(
        config: &RegistryConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.event_buffer.max(1));
        let (events, _) = broadcast::channel(config.event_buffer.max(16));
        let (backends_tx, backends_rx) = watch::channel(Arc::new(BackendSet::new()));
        let (degraded_tx, degraded_rx) = watch::channel(false);

        let worker = RegistryWorker {
            rx,
            state: RegistryState::new(),
            debounce: config.debounce(),
            events: events.clone(),
            backends_tx,
            degraded_tx,
            shutdown_rx,
        };
        let handle = tokio::spawn(worker.run());

        let registry = Arc::new(Self {
            tx,
            events,
            backends_rx,
            degraded_rx,
        });
        (registry, handle)
    }

    /// Channel providers and health reporters send into
    pub fn sender(&self) -> mpsc::Sender<DiscoveryEvent> {
        self.tx.clone()
    }

    /// Stream of net changes
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the committed backend set, updated on every net change
    pub fn watch_backends(&self) -> watch::Receiver<Arc<BackendSet>> {
        self.backends_rx.clone()
    }

    pub fn backends(&self) -> Arc<BackendSet> {
        Arc::clone(&self.backends_rx.borrow())
    }

    /// True while any provider's feed is unreachable
    pub fn watch_degraded(&self) -> watch::Receiver<bool> {
        self.degraded_rx.clone()
    }

    pub fn is_degraded(&self) -> bool {
        *self.degraded_rx.borrow()
    }
}

struct RegistryWorker {
    rx: mpsc::Receiver<DiscoveryEvent>,
    state: RegistryState,
    debounce: Duration,
    events: broadcast::Sender<RegistryEvent>,
    backends_tx: watch::Sender<Arc<BackendSet>>,
    degraded_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RegistryWorker {
    async fn run(mut self) {
        info!(debounce_ms = self.debounce.as_millis() as u64, "Backend registry started");
        let mut deadline: Option<Instant> = None;

        loop {
            let flush_at = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = self.rx.recv() => {
                    let Some(event) = event else {
                        debug!("All discovery senders dropped");
                        break;
                    };
                    if self.state.apply(event) && deadline.is_none() {
                        deadline = Some(Instant::now() + self.debounce);
                    }
                    let degraded = self.state.is_degraded();
                    self.degraded_tx.send_if_modified(|d| {
                        let changed = *d != degraded;
                        *d = degraded;
                        changed
                    });
                }
                _ = flush_at => {
                    deadline = None;
                    self.publish();
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Backend registry shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn publish(&mut self) {
        let events = self.state.flush();
        if events.is_empty() {
            debug!("Pending backend changes cancelled out");
            return;
        }

        for event in &events {
            let backend = event.backend();
            match event {
                RegistryEvent::Added(_) => info!(
                    id = %backend.id,
                    name = %backend.name,
                    address = %backend.address,
                    provider = %backend.provider,
                    "Backend added"
                ),
                RegistryEvent::Removed(_) => info!(id = %backend.id, name = %backend.name, "Backend removed"),
                RegistryEvent::Updated(_) => info!(
                    id = %backend.id,
                    name = %backend.name,
                    health = ?backend.health,
                    "Backend updated"
                ),
            }
            // no subscribers is fine
            let _ = self.events.send(event.clone());
        }

        self.backends_tx
            .send_replace(Arc::new(self.state.committed().clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(id: &str, port: u16) -> Backend {
        Backend::new(id, id, "static", format!("127.0.0.1:{}", port).parse().unwrap())
    }

    #[test]
    fn test_add_then_remove_is_noop() {
        let mut state = RegistryState::new();
        state.apply(DiscoveryEvent::Upsert(backend("a", 3000)));
        state.apply(DiscoveryEvent::Remove {
            provider: "static".to_string(),
            id: "a".to_string(),
        });
        assert!(state.flush().is_empty());
        assert!(state.committed().is_empty());
    }

    #[test]
    fn test_duplicate_upserts_coalesce() {
        let mut state = RegistryState::new();
        state.apply(DiscoveryEvent::Upsert(backend("a", 3000)));
        state.apply(DiscoveryEvent::Upsert(backend("a", 3001)));
        let events = state.flush();
        assert_eq!(events.len(), 1);
        match &events[0] {
            RegistryEvent::Added(b) => assert_eq!(b.address.port(), 3001),
            other => panic!("unexpected event {:?}", other),
        }

        // same state again produces nothing
        state.apply(DiscoveryEvent::Upsert(backend("a", 3001)));
        assert!(state.flush().is_empty());
    }

    #[test]
    fn test_remove_then_readd_keeps_seq() {
        let mut state = RegistryState::new();
        state.apply(DiscoveryEvent::Upsert(backend("a", 3000)));
        state.apply(DiscoveryEvent::Upsert(backend("b", 3001)));
        state.flush();
        let seq_a = state.committed()["a"].seq;

        state.apply(DiscoveryEvent::Remove {
            provider: "static".to_string(),
            id: "a".to_string(),
        });
        state.apply(DiscoveryEvent::Upsert(backend("a", 3000)));
        assert!(state.flush().is_empty());
        assert_eq!(state.committed()["a"].seq, seq_a);
        assert!(state.committed()["a"].seq < state.committed()["b"].seq);
    }

    #[test]
    fn test_unknown_health_keeps_committed_health() {
        let mut state = RegistryState::new();
        state.apply(DiscoveryEvent::Upsert(backend("a", 3000)));
        state.flush();
        state.apply(DiscoveryEvent::Health {
            id: "a".to_string(),
            health: BackendHealth::Unhealthy,
        });
        let events = state.flush();
        assert!(matches!(&events[0], RegistryEvent::Updated(b) if b.health == BackendHealth::Unhealthy));

        // provider re-announces without an opinion on health
        state.apply(DiscoveryEvent::Upsert(backend("a", 3000)));
        assert!(state.flush().is_empty());
        assert_eq!(state.committed()["a"].health, BackendHealth::Unhealthy);
    }

    #[test]
    fn test_health_for_unknown_backend_ignored() {
        let mut state = RegistryState::new();
        assert!(!state.apply(DiscoveryEvent::Health {
            id: "ghost".to_string(),
            health: BackendHealth::Healthy,
        }));
        assert!(!state.has_pending());
    }

    #[test]
    fn test_snapshot_removes_unlisted_backends_of_that_provider() {
        let mut state = RegistryState::new();
        state.apply(DiscoveryEvent::Upsert(backend("a", 3000)));
        state.apply(DiscoveryEvent::Upsert(backend("b", 3001)));
        let mut other = backend("c", 3002);
        other.provider = "docker".to_string();
        state.apply(DiscoveryEvent::Upsert(other));
        state.flush();

        state.apply(DiscoveryEvent::Snapshot {
            provider: "static".to_string(),
            backends: vec![backend("b", 3001)],
        });
        let events = state.flush();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RegistryEvent::Removed(b) if b.id == "a"));
        assert!(state.committed().contains_key("c"));
    }

    #[test]
    fn test_unavailable_keeps_backends_and_marks_degraded() {
        let mut state = RegistryState::new();
        state.apply(DiscoveryEvent::Upsert(backend("a", 3000)));
        state.flush();

        assert!(!state.apply(DiscoveryEvent::Unavailable {
            provider: "static".to_string(),
            reason: "connection refused".to_string(),
        }));
        assert!(state.is_degraded());
        assert!(state.flush().is_empty());
        assert_eq!(state.committed().len(), 1);

        state.apply(DiscoveryEvent::Snapshot {
            provider: "static".to_string(),
            backends: vec![backend("a", 3000)],
        });
        assert!(!state.is_degraded());
        assert!(state.flush().is_empty());
    }

    #[test]
    fn test_events_ordered_by_discovery() {
        let mut state = RegistryState::new();
        state.apply(DiscoveryEvent::Upsert(backend("zeta", 3000)));
        state.apply(DiscoveryEvent::Upsert(backend("alpha", 3001)));
        let ids: Vec<String> = state
            .flush()
            .iter()
            .map(|e| e.backend().id.clone())
            .collect();
        assert_eq!(ids, vec!["zeta", "alpha"]);
    }

    #[tokio::test]
    async fn test_registry_debounces_add_remove() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = RegistryConfig {
            debounce_ms: 100,
            event_buffer: 16,
        };
        let (registry, _handle) = BackendRegistry::spawn(&config, shutdown_rx);
        let mut events = registry.subscribe();
        let mut backends = registry.watch_backends();
        let tx = registry.sender();

        tx.send(DiscoveryEvent::Upsert(backend("a", 3000))).await.unwrap();
        tx.send(DiscoveryEvent::Remove {
            provider: "static".to_string(),
            id: "a".to_string(),
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!backends.has_changed().unwrap());
        assert!(events.try_recv().is_err());

        tx.send(DiscoveryEvent::Upsert(backend("b", 3001))).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, RegistryEvent::Added(b) if b.id == "b"));
        backends.changed().await.unwrap();
        assert!(registry.backends().contains_key("b"));
    }

    #[tokio::test]
    async fn test_registry_reports_degraded() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (registry, _handle) = BackendRegistry::spawn(&RegistryConfig::default(), shutdown_rx);
        let mut degraded = registry.watch_degraded();

        registry
            .sender()
            .send(DiscoveryEvent::Unavailable {
                provider: "docker".to_string(),
                reason: "socket missing".to_string(),
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), degraded.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(registry.is_degraded());
    }
}
