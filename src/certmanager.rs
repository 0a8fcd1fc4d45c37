//! Certificate manager
//!
//! Keeps one certificate per routed TLS hostname. Each managed hostname moves
//! through [`CertificateState`]:
//!
//! ```text
//! Unrequested -> ChallengePending -> Validating -> Issued -> Renewing -> Issued
//!                        ^               |                     |
//!                        +-- transient --+                     +--> Expired
//! ```
//!
//! plus `Failed` once retries are exhausted. Issuance runs on background tasks;
//! the handshake path only ever reads the certificate cache, an `ArcSwap` that
//! is replaced wholesale whenever a certificate is installed. Until a host has
//! a valid certificate it is served a self-signed placeholder for that name.

use crate::acme::{
    placeholder_certificate, AuthorityError, CertificateAuthority, ChallengeStore,
    IssuanceProgress, IssuedCertificate, ACME_TLS_ALPN_NAME,
};
use crate::certstore::{CertStore, CertificateMap, StoredCertificate};
use crate::config::AcmeConfig;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Issuance state of one hostname
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateState {
    Unrequested,
    ChallengePending,
    Validating,
    Issued,
    Renewing,
    Expired,
    Failed,
}

impl CertificateState {
    /// An issuance task is working on the host
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            CertificateState::ChallengePending
                | CertificateState::Validating
                | CertificateState::Renewing
        )
    }
}

/// Timing knobs
#[derive(Debug, Clone)]
pub struct CertManagerOptions {
    pub renew_before: Duration,
    pub renew_check_interval: Duration,
    pub handshake_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl CertManagerOptions {
    pub fn from_config(config: &AcmeConfig) -> Self {
        Self {
            renew_before: config.renew_before(),
            renew_check_interval: config.renew_check_interval(),
            handshake_timeout: config.handshake_timeout(),
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
        }
    }
}

impl Default for CertManagerOptions {
    fn default() -> Self {
        Self::from_config(&AcmeConfig::default())
    }
}

/// Delay before retry `attempt` (1-based): exponential, capped, jittered into `[d/2, d]`
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let full = base.saturating_mul(factor).min(cap);
    let ms = full.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms))
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Clone)]
struct CachedCert {
    key: Arc<CertifiedKey>,
    not_after: i64,
    issuer: String,
}

struct HostEntry {
    state: CertificateState,
    attempts: u32,
    last_error: Option<String>,
    task: Option<AbortHandle>,
    /// Identifies the issuance run allowed to update this entry
    epoch: u64,
}

impl HostEntry {
    fn new(state: CertificateState) -> Self {
        Self {
            state,
            attempts: 0,
            last_error: None,
            task: None,
            epoch: 0,
        }
    }
}

/// Certificate status as reported by the status API
#[derive(Debug, Clone, Serialize)]
pub struct CertificateStatus {
    pub hostname: String,
    pub state: CertificateState,
    /// Referenced by a TLS route with a certificate resolver
    pub managed: bool,
    pub not_after: Option<String>,
    pub issuer: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

pub struct CertManager {
    options: CertManagerOptions,
    store: CertStore,
    authority: Option<Arc<dyn CertificateAuthority>>,
    challenges: ChallengeStore,
    /// Persisted material; the lock also serializes store writes
    stored: Mutex<CertificateMap>,
    cache: ArcSwap<HashMap<String, CachedCert>>,
    placeholders: DashMap<String, Arc<CertifiedKey>>,
    default_cert: Arc<CertifiedKey>,
    hosts: DashMap<String, HostEntry>,
    next_epoch: AtomicU64,
    /// Bumped whenever an issuance run finishes
    changes: watch::Sender<u64>,
}

impl CertManager {
    /// Load the store and build the manager. An unparseable store is an error.
    pub fn new(
        options: CertManagerOptions,
        store: CertStore,
        authority: Option<Arc<dyn CertificateAuthority>>,
        challenges: ChallengeStore,
    ) -> anyhow::Result<Arc<Self>> {
        let stored = store.load()?;

        let mut cache = HashMap::new();
        for (host, cert) in &stored {
            // unusable key material is as fatal as unparseable JSON
            let key = cert.to_certified_key()?;
            cache.insert(
                host.clone(),
                CachedCert {
                    key,
                    not_after: cert.not_after,
                    issuer: cert.issuer.clone(),
                },
            );
        }
        info!(certificates = cache.len(), "Certificates loaded");

        let default_cert = placeholder_certificate("tidegate.invalid")?;
        let (changes, _) = watch::channel(0);

        Ok(Arc::new(Self {
            options,
            store,
            authority,
            challenges,
            stored: Mutex::new(stored),
            cache: ArcSwap::from_pointee(cache),
            placeholders: DashMap::new(),
            default_cert,
            hosts: DashMap::new(),
            next_epoch: AtomicU64::new(0),
            changes,
        }))
    }

    pub fn challenges(&self) -> &ChallengeStore {
        &self.challenges
    }

    /// Hand over the hostnames the routing table wants certificates for
    pub fn sync_hostnames(self: &Arc<Self>, hostnames: BTreeSet<String>) {
        let removed: Vec<String> = self
            .hosts
            .iter()
            .filter(|e| !hostnames.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for host in removed {
            let removed = {
                let _stored = self.stored.lock();
                self.hosts.remove(&host)
            };
            if let Some((_, entry)) = removed {
                if let Some(task) = entry.task.filter(|_| entry.state.is_in_flight()) {
                    task.abort();
                    info!(hostname = %host, "Cancelled certificate issuance for unrouted hostname");
                }
            }
            self.placeholders.remove(&host);
        }

        let now = now();
        for host in hostnames {
            if self.hosts.contains_key(&host) {
                continue;
            }
            let not_after = self.cache.load().get(&host).map(|c| c.not_after);
            let state = match not_after {
                Some(na) if na > now => CertificateState::Issued,
                Some(_) => CertificateState::Expired,
                None => CertificateState::Unrequested,
            };
            self.hosts.insert(host.clone(), HostEntry::new(state));
            debug!(hostname = %host, state = ?state, "Managing certificate");

            match (state, not_after) {
                (CertificateState::Issued, Some(na)) => {
                    if self.needs_renewal(na, now) {
                        self.start_issuance(&host, true);
                    }
                }
                _ => self.start_issuance(&host, false),
            }
        }
    }

    fn needs_renewal(&self, not_after: i64, now: i64) -> bool {
        not_after - now < self.options.renew_before.as_secs() as i64
    }

    fn start_issuance(self: &Arc<Self>, hostname: &str, renewing: bool) {
        let Some(authority) = self.authority.clone() else {
            warn!(hostname = %hostname, "No certificate authority configured, serving placeholder");
            return;
        };
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let Some(mut entry) = self.hosts.get_mut(hostname) else {
                return;
            };
            if entry.state.is_in_flight() {
                return;
            }
            entry.state = if renewing {
                CertificateState::Renewing
            } else {
                CertificateState::ChallengePending
            };
            entry.attempts = 0;
            entry.epoch = epoch;
        }
        info!(hostname = %hostname, renewing, authority = authority.name(), "Starting certificate issuance");

        let manager = Arc::clone(self);
        let host = hostname.to_string();
        let handle = tokio::spawn(async move { manager.run_issuance(authority, host, epoch, renewing).await });

        if let Some(mut entry) = self.hosts.get_mut(hostname) {
            if entry.epoch == epoch && entry.state.is_in_flight() {
                entry.task = Some(handle.abort_handle());
            }
        }
    }

    /// Apply `f` if the entry still belongs to issuance run `epoch`
    fn update(&self, hostname: &str, epoch: u64, f: impl FnOnce(&mut HostEntry)) -> bool {
        match self.hosts.get_mut(hostname) {
            Some(mut entry) if entry.epoch == epoch => {
                f(entry.value_mut());
                true
            }
            _ => false,
        }
    }

    async fn run_issuance(
        self: Arc<Self>,
        authority: Arc<dyn CertificateAuthority>,
        hostname: String,
        epoch: u64,
        renewing: bool,
    ) {
        let max_attempts = self.options.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let current = self.update(&hostname, epoch, |e| {
                e.attempts = attempt;
                if !renewing {
                    e.state = CertificateState::ChallengePending;
                }
            });
            if !current {
                return;
            }

            let progress = {
                let manager = Arc::clone(&self);
                let host = hostname.clone();
                IssuanceProgress::new(move || {
                    manager.update(&host, epoch, |e| {
                        if e.state == CertificateState::ChallengePending {
                            e.state = CertificateState::Validating;
                        }
                    });
                })
            };

            let result = match authority.issue(&hostname, &progress).await {
                Ok(issued) => self.install(&hostname, epoch, issued),
                Err(e) => Err(e),
            };

            match result {
                Ok(not_after) => {
                    info!(hostname = %hostname, attempt, not_after, "Certificate issued");
                    return;
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff_delay(attempt, self.options.backoff_base, self.options.backoff_cap);
                    warn!(
                        hostname = %hostname,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Certificate issuance attempt failed, retrying"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        self.fail(&hostname, epoch, renewing, last_error);
    }

    /// Persist, then publish. Returns the certificate's expiry.
    fn install(&self, hostname: &str, epoch: u64, issued: IssuedCertificate) -> Result<i64, AuthorityError> {
        let stored = StoredCertificate::from_pem(hostname, &issued.certificate, &issued.private_key)
            .map_err(|e| AuthorityError::Rejected(e.to_string()))?;
        let key = stored
            .to_certified_key()
            .map_err(|e| AuthorityError::Rejected(e.to_string()))?;
        let cached = CachedCert {
            key,
            not_after: stored.not_after,
            issuer: stored.issuer.clone(),
        };

        // Held through the cache swap; sync_hostnames takes it before
        // dropping hosts, so an unrouted host is never persisted or cached.
        let mut map = self.stored.lock();
        if !self.update(hostname, epoch, |_| {}) {
            return Err(AuthorityError::Rejected("hostname is no longer routed".to_string()));
        }
        let previous = map.insert(hostname.to_string(), stored);
        if let Err(e) = self.store.save(&map) {
            match previous {
                Some(p) => map.insert(hostname.to_string(), p),
                None => map.remove(hostname),
            };
            return Err(AuthorityError::Transient(format!("persisting certificate: {}", e)));
        }

        self.cache.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(hostname.to_string(), cached.clone());
            next
        });
        drop(map);
        self.placeholders.remove(hostname);

        self.update(hostname, epoch, |e| {
            e.state = CertificateState::Issued;
            e.last_error = None;
            e.task = None;
        });
        self.notify();
        Ok(cached.not_after)
    }

    fn fail(&self, hostname: &str, epoch: u64, renewing: bool, error: Option<AuthorityError>) {
        let now = now();
        let cached = self.cache.load().get(hostname).map(|c| c.not_after);
        let state = match cached {
            Some(na) if renewing && na > now => CertificateState::Issued,
            Some(_) => CertificateState::Expired,
            None => CertificateState::Failed,
        };
        let error = error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());

        let mut attempts = 0;
        let current = self.update(hostname, epoch, |e| {
            e.state = state;
            e.last_error = Some(error.clone());
            e.task = None;
            attempts = e.attempts;
        });
        if current {
            warn!(
                hostname = %hostname,
                attempts,
                state = ?state,
                error = %error,
                "Certificate issuance failed"
            );
        }
        self.notify();
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn valid_cert(&self, hostname: &str, now: i64) -> Option<Arc<CertifiedKey>> {
        self.cache
            .load()
            .get(hostname)
            .filter(|c| c.not_after > now)
            .map(|c| Arc::clone(&c.key))
    }

    fn state_of(&self, hostname: &str) -> Option<CertificateState> {
        self.hosts.get(hostname).map(|e| e.state)
    }

    /// Certificate to present for `sni`. Never blocks and never returns an
    /// expired certificate.
    pub fn certificate_for(self: &Arc<Self>, sni: Option<&str>) -> Arc<CertifiedKey> {
        let Some(host) = sni.map(normalize_sni) else {
            return Arc::clone(&self.default_cert);
        };
        if let Some(key) = self.valid_cert(&host, now()) {
            return key;
        }

        match self.state_of(&host) {
            None => Arc::clone(&self.default_cert),
            Some(state) => {
                if state == CertificateState::Issued {
                    // cached certificate ran out between renewal checks
                    self.mark_expired(&host);
                    if tokio::runtime::Handle::try_current().is_ok() {
                        self.start_issuance(&host, false);
                    }
                }
                self.placeholder(&host)
            }
        }
    }

    fn mark_expired(&self, hostname: &str) {
        if let Some(mut entry) = self.hosts.get_mut(hostname) {
            if entry.state == CertificateState::Issued {
                entry.state = CertificateState::Expired;
            }
        }
    }

    fn placeholder(&self, hostname: &str) -> Arc<CertifiedKey> {
        let entry = self
            .placeholders
            .entry(hostname.to_string())
            .or_try_insert_with(|| placeholder_certificate(hostname));
        match entry {
            Ok(key) => Arc::clone(key.value()),
            Err(e) => {
                warn!(hostname = %hostname, error = %e, "Cannot create placeholder certificate");
                Arc::clone(&self.default_cert)
            }
        }
    }

    /// Called after the ClientHello is read and before the certificate is
    /// chosen: gives a managed host without a certificate up to
    /// `handshake_timeout` for issuance to finish.
    pub async fn prepare_handshake(self: &Arc<Self>, sni: Option<&str>) {
        let Some(host) = sni.map(normalize_sni) else {
            return;
        };
        let mut changes = self.changes.subscribe();

        let Some(state) = self.state_of(&host) else {
            return;
        };
        if self.valid_cert(&host, now()).is_some() {
            return;
        }
        match state {
            CertificateState::Unrequested | CertificateState::Expired | CertificateState::Issued => {
                self.mark_expired(&host);
                self.start_issuance(&host, false);
            }
            CertificateState::Failed => return,
            _ => {}
        }

        let wait = async {
            loop {
                let in_flight = self.state_of(&host).map(|s| s.is_in_flight()).unwrap_or(false);
                if !in_flight || self.valid_cert(&host, now()).is_some() {
                    break;
                }
                if changes.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.options.handshake_timeout, wait).await.is_err() {
            debug!(hostname = %host, "Certificate not ready in time, using placeholder");
        }
    }

    /// One pass of the renewal timer
    pub fn check_renewals(self: &Arc<Self>) {
        let now = now();
        let hosts: Vec<(String, CertificateState)> = self
            .hosts
            .iter()
            .map(|e| (e.key().clone(), e.state))
            .collect();

        for (host, state) in hosts {
            match state {
                CertificateState::Issued => {
                    let not_after = self.cache.load().get(&host).map(|c| c.not_after);
                    match not_after {
                        Some(na) if na <= now => {
                            info!(hostname = %host, "Certificate expired, reissuing");
                            self.mark_expired(&host);
                            self.start_issuance(&host, false);
                        }
                        Some(na) if self.needs_renewal(na, now) => {
                            info!(
                                hostname = %host,
                                remaining_days = (na - now) / 86_400,
                                "Certificate renewal needed"
                            );
                            self.start_issuance(&host, true);
                        }
                        Some(_) => {}
                        None => self.start_issuance(&host, false),
                    }
                }
                CertificateState::Failed | CertificateState::Expired | CertificateState::Unrequested => {
                    self.start_issuance(&host, false);
                }
                _ => {}
            }
        }
    }

    /// Run the renewal timer until shutdown
    pub fn spawn_renewals(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let interval = manager.options.renew_check_interval;
            info!(interval_secs = interval.as_secs(), "Certificate renewal timer started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => manager.check_renewals(),
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Certificate manager shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn certificate_state(&self, hostname: &str) -> CertificateState {
        self.state_of(&normalize_sni(hostname))
            .unwrap_or(CertificateState::Unrequested)
    }

    /// Managed hosts and stored certificates, sorted by hostname
    pub fn statuses(&self) -> Vec<CertificateStatus> {
        let cache = self.cache.load();
        let mut out: BTreeMap<String, CertificateStatus> = BTreeMap::new();

        for (host, cert) in cache.iter() {
            out.insert(
                host.clone(),
                CertificateStatus {
                    hostname: host.clone(),
                    state: if cert.not_after > now() {
                        CertificateState::Issued
                    } else {
                        CertificateState::Expired
                    },
                    managed: false,
                    not_after: chrono::DateTime::from_timestamp(cert.not_after, 0).map(|t| t.to_rfc3339()),
                    issuer: Some(cert.issuer.clone()),
                    attempts: 0,
                    last_error: None,
                },
            );
        }

        for entry in self.hosts.iter() {
            let status = out
                .entry(entry.key().clone())
                .or_insert_with(|| CertificateStatus {
                    hostname: entry.key().clone(),
                    state: entry.state,
                    managed: true,
                    not_after: None,
                    issuer: None,
                    attempts: 0,
                    last_error: None,
                });
            status.state = entry.state;
            status.managed = true;
            status.attempts = entry.attempts;
            status.last_error = entry.last_error.clone();
        }

        out.into_values().collect()
    }

    /// rustls configuration for TLS entry points
    pub fn server_config(self: &Arc<Self>) -> anyhow::Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("Failed to configure TLS protocol versions: {}", e))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(CertResolver {
            manager: Arc::clone(self),
        }));
        config.alpn_protocols = vec![
            b"h2".to_vec(),
            b"http/1.1".to_vec(),
            ACME_TLS_ALPN_NAME.to_vec(),
        ];
        Ok(Arc::new(config))
    }
}

fn normalize_sni(sni: &str) -> String {
    sni.trim_end_matches('.').to_ascii_lowercase()
}

/// True when the client only wants the TLS-ALPN-01 challenge certificate
pub fn is_acme_challenge(hello: &ClientHello<'_>) -> bool {
    hello
        .alpn()
        .map(|mut alpn| alpn.any(|p| p == ACME_TLS_ALPN_NAME))
        .unwrap_or(false)
}

/// SNI certificate selection: challenge certificates first, then the cache,
/// then placeholders
pub struct CertResolver {
    manager: Arc<CertManager>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("hosts", &self.manager.hosts.len())
            .finish()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name();
        if is_acme_challenge(&client_hello) {
            return sni.and_then(|s| self.manager.challenges.tls_alpn01(s));
        }
        Some(self.manager.certificate_for(sni))
    }
}
