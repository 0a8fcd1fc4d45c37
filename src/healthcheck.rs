//! Active health checks for discovered backends
//!
//! Periodically opens a TCP connection to every backend in the registry and
//! reports health transitions back to it.
//!
//! With active checks disabled the checker still runs in recovery mode: it
//! only checks backends the edge listener reported unreachable, and only ever
//! reports them healthy again.

use crate::config::HealthCheckConfig;
use crate::registry::{BackendHealth, BackendSet, DiscoveryEvent};
use futures::future::join_all;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Consecutive results for one backend
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ProbeState {
    consecutive_failures: u32,
    consecutive_successes: u32,
}

/// Health checker feeding the backend registry
pub struct HealthChecker {
    config: HealthCheckConfig,
    backends_rx: watch::Receiver<Arc<BackendSet>>,
    tx: mpsc::Sender<DiscoveryEvent>,
    states: HashMap<String, ProbeState>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        backends_rx: watch::Receiver<Arc<BackendSet>>,
        tx: mpsc::Sender<DiscoveryEvent>,
    ) -> Self {
        Self {
            config,
            backends_rx,
            tx,
            states: HashMap::new(),
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs.max(1))
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms.max(1))
    }

    fn recovery_only(&self) -> bool {
        !self.config.enabled
    }

    /// Run the health checker
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval().as_secs(),
            timeout_ms = self.timeout().as_millis() as u64,
            recovery_only = self.recovery_only(),
            "Health checker started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval()) => {
                    self.check_all().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Check every backend once (only unhealthy ones in recovery mode) and
    /// report transitions
    pub async fn check_all(&mut self) {
        let backends = Arc::clone(&self.backends_rx.borrow());
        let timeout = self.timeout();
        let recovery_only = self.recovery_only();

        let probes = backends
            .values()
            .filter(|b| !recovery_only || b.health == BackendHealth::Unhealthy)
            .map(|b| async move { (b, probe(b.address, timeout).await) });
        let results = join_all(probes).await;

        for (backend, reachable) in results {
            let state = self.states.entry(backend.id.clone()).or_default();
            if let Some(health) = record(state, backend.health, reachable, &self.config) {
                match health {
                    BackendHealth::Unhealthy => warn!(
                        backend = %backend.id,
                        address = %backend.address,
                        failures = state.consecutive_failures,
                        "Backend is now unhealthy"
                    ),
                    _ => info!(backend = %backend.id, address = %backend.address, "Backend is now healthy"),
                }
                let event = DiscoveryEvent::Health {
                    id: backend.id.clone(),
                    health,
                };
                if self.tx.send(event).await.is_err() {
                    debug!("Registry gone, dropping health report");
                }
            }
        }

        // forget backends that no longer exist
        self.states.retain(|id, _| backends.contains_key(id));
    }
}

/// Update the counters; returns the health to report, if it changed
fn record(
    state: &mut ProbeState,
    current: BackendHealth,
    reachable: bool,
    config: &HealthCheckConfig,
) -> Option<BackendHealth> {
    if reachable {
        state.consecutive_successes += 1;
        state.consecutive_failures = 0;
        (current != BackendHealth::Healthy
            && state.consecutive_successes >= config.success_threshold.max(1))
        .then_some(BackendHealth::Healthy)
    } else {
        state.consecutive_failures += 1;
        state.consecutive_successes = 0;
        (current != BackendHealth::Unhealthy
            && state.consecutive_failures >= config.failure_threshold.max(1))
        .then_some(BackendHealth::Unhealthy)
    }
}

/// Check a backend by opening a TCP connection
async fn probe(addr: SocketAddr, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => {
            debug!(%addr, "Health check passed (TCP connect)");
            true
        }
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "Health check failed (connection error)");
            false
        }
        Err(_) => {
            debug!(%addr, "Health check failed (timeout)");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Backend;
    use tokio::net::TcpListener;

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_secs: 1,
            timeout_ms: 500,
            failure_threshold: 3,
            success_threshold: 2,
        }
    }

    #[test]
    fn test_failure_threshold() {
        let mut state = ProbeState::default();
        let c = config();
        assert_eq!(record(&mut state, BackendHealth::Unknown, false, &c), None);
        assert_eq!(record(&mut state, BackendHealth::Unknown, false, &c), None);
        assert_eq!(
            record(&mut state, BackendHealth::Unknown, false, &c),
            Some(BackendHealth::Unhealthy)
        );
        // already unhealthy: no repeat
        assert_eq!(record(&mut state, BackendHealth::Unhealthy, false, &c), None);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut state = ProbeState::default();
        let c = config();
        record(&mut state, BackendHealth::Healthy, false, &c);
        record(&mut state, BackendHealth::Healthy, false, &c);
        assert_eq!(record(&mut state, BackendHealth::Healthy, true, &c), None);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_recovery_needs_success_threshold() {
        let mut state = ProbeState::default();
        let c = config();
        assert_eq!(record(&mut state, BackendHealth::Unhealthy, true, &c), None);
        assert_eq!(
            record(&mut state, BackendHealth::Unhealthy, true, &c),
            Some(BackendHealth::Healthy)
        );
    }

    #[tokio::test]
    async fn test_check_all_reports_transitions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up = listener.local_addr().unwrap();
        // bind then drop to get a port nothing listens on
        let down = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let mut set = BackendSet::new();
        set.insert("up".to_string(), Backend::new("up", "up", "static", up));
        set.insert(
            "down".to_string(),
            Backend::new("down", "down", "static", down),
        );
        let (_backends_tx, backends_rx) = watch::channel(Arc::new(set));
        let (tx, mut rx) = mpsc::channel(16);

        let mut c = config();
        c.failure_threshold = 1;
        c.success_threshold = 1;
        let mut checker = HealthChecker::new(c, backends_rx, tx);
        checker.check_all().await;

        let mut reports = HashMap::new();
        while let Ok(DiscoveryEvent::Health { id, health }) = rx.try_recv() {
            reports.insert(id, health);
        }
        assert_eq!(reports.get("up"), Some(&BackendHealth::Healthy));
        assert_eq!(reports.get("down"), Some(&BackendHealth::Unhealthy));
    }

    #[tokio::test]
    async fn test_recovery_mode_only_revives_unhealthy_backends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up = listener.local_addr().unwrap();
        let down = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let mut set = BackendSet::new();
        set.insert(
            "revived".to_string(),
            Backend::new("revived", "revived", "static", up).with_health(BackendHealth::Unhealthy),
        );
        set.insert(
            "fresh".to_string(),
            Backend::new("fresh", "fresh", "static", up),
        );
        set.insert(
            "down".to_string(),
            Backend::new("down", "down", "static", down),
        );
        let (_backends_tx, backends_rx) = watch::channel(Arc::new(set));
        let (tx, mut rx) = mpsc::channel(16);

        let mut c = config();
        c.enabled = false;
        c.failure_threshold = 1;
        c.success_threshold = 1;
        let mut checker = HealthChecker::new(c, backends_rx, tx);
        checker.check_all().await;

        let mut reports = HashMap::new();
        while let Ok(DiscoveryEvent::Health { id, health }) = rx.try_recv() {
            reports.insert(id, health);
        }
        assert_eq!(reports.len(), 1, "{:?}", reports);
        assert_eq!(reports.get("revived"), Some(&BackendHealth::Healthy));
    }
}
