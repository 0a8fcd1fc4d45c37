use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the edge router
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Entry points keyed by name
    #[serde(default = "default_entrypoints")]
    pub entrypoints: BTreeMap<String, EntryPointConfig>,

    /// Request forwarding settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Discovery providers
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Active health checks
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// ACME certificate resolver
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Access log
    #[serde(default)]
    pub access_log: AccessLogConfig,

    /// Read-only status API
    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            entrypoints: default_entrypoints(),
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            providers: ProvidersConfig::default(),
            health_check: HealthCheckConfig::default(),
            acme: AcmeConfig::default(),
            access_log: AccessLogConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Default level for this crate when RUST_LOG does not say otherwise
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A bound listener
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EntryPointConfig {
    /// Socket address, e.g. "0.0.0.0:443"
    pub address: String,

    /// Terminate TLS on this entry point
    #[serde(default)]
    pub tls: bool,

    /// Redirect every request (except ACME HTTP-01 challenges) to this entry point
    pub redirect_to: Option<String>,
}

impl EntryPointConfig {
    pub fn plain(address: &str) -> Self {
        Self {
            address: address.to_string(),
            tls: false,
            redirect_to: None,
        }
    }

    pub fn tls(address: &str) -> Self {
        Self {
            address: address.to_string(),
            tls: true,
            redirect_to: None,
        }
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid entry point address '{}': {}", self.address, e))
    }

    /// Port part of the address, used when building redirect locations
    pub fn port(&self) -> Option<u16> {
        self.socket_addr().ok().map(|a| a.port())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Max time to wait for a backend response in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Grace period for in-flight work on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Window in which rapid changes for the same backend are coalesced
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Capacity of the discovery event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl RegistryConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    /// Label prefix shared by every provider (default: traefik)
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Backends exposed without an explicit `<prefix>.enable=true` label
    #[serde(default)]
    pub exposed_by_default: bool,

    /// Domain used to synthesise `Host(<name>.<domain>)` for backends without routers
    pub default_rule_domain: Option<String>,

    #[serde(default)]
    pub docker: DockerProviderConfig,

    /// Statically declared backends keyed by id
    #[serde(default, rename = "static")]
    pub static_backends: BTreeMap<String, StaticBackendConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            label_prefix: default_label_prefix(),
            exposed_by_default: false,
            default_rule_domain: None,
            docker: DockerProviderConfig::default(),
            static_backends: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerProviderConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Docker endpoint ("unix:///var/run/docker.sock" or "tcp://host:port")
    pub endpoint: Option<String>,

    /// Network whose container IP is used (default: first network found)
    pub network: Option<String>,

    /// Seconds between reconnection attempts when the engine is unreachable
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
}

impl Default for DockerProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            network: None,
            reconnect_interval_secs: default_reconnect_interval(),
        }
    }
}

/// A backend declared in the configuration file
#[derive(Debug, Deserialize, Clone)]
pub struct StaticBackendConfig {
    /// Backend address, e.g. "127.0.0.1:3000"
    pub address: String,

    /// Routing labels in the same format containers use
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,

    /// Consecutive failures before marking a backend unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before marking a backend healthy again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            timeout_ms: default_health_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Challenge type for ACME domain validation
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcmeChallengeType {
    /// HTTP-01: Serves challenge response at /.well-known/acme-challenge/ on a plaintext entry point
    #[serde(alias = "http01", alias = "HTTP-01")]
    #[serde(rename = "http-01")]
    Http01,
    /// TLS-ALPN-01: Serves challenge via TLS with the acme-tls/1 ALPN protocol
    #[default]
    #[serde(alias = "tls-alpn01", alias = "TLS-ALPN-01")]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

/// ACME configuration for automatic certificate provisioning
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// Enable ACME certificate provisioning
    #[serde(default)]
    pub enabled: bool,

    /// Contact email for the CA account (required when enabled)
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    /// Certificate store file
    #[serde(default = "default_acme_storage")]
    pub storage: String,

    #[serde(default)]
    pub challenge_type: AcmeChallengeType,

    /// Renew when fewer than this many days of validity remain
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,

    /// How often the renewal timer runs
    #[serde(default = "default_renew_check_interval")]
    pub renew_check_interval_secs: u64,

    /// Max time a TLS handshake waits for on-demand issuance
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Issuance attempts before a hostname is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

impl AcmeConfig {
    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_days * 24 * 60 * 60)
    }

    pub fn renew_check_interval(&self) -> Duration {
        Duration::from_secs(self.renew_check_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email: None,
            directory_url: None,
            storage: default_acme_storage(),
            challenge_type: AcmeChallengeType::default(),
            renew_before_days: default_renew_before_days(),
            renew_check_interval_secs: default_renew_check_interval(),
            handshake_timeout_ms: default_handshake_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

/// Access log line format
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessLogFormat {
    #[default]
    Json,
    Common,
}

/// What to do with a record when the access log queue is full
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Discard the record being logged
    #[default]
    DropNewest,
    /// Discard the oldest queued record to make room
    DropOldest,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccessLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Output file (appended); stdout when unset
    pub path: Option<String>,

    #[serde(default)]
    pub format: AccessLogFormat,

    /// Records held in memory while the writer catches up
    #[serde(default = "default_access_log_buffer")]
    pub buffer_size: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Seconds between attempts to reopen an unavailable sink
    #[serde(default = "default_reopen_interval")]
    pub reopen_interval_secs: u64,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            format: AccessLogFormat::default(),
            buffer_size: default_access_log_buffer(),
            overflow: OverflowPolicy::default(),
            reopen_interval_secs: default_reopen_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_api_address")]
    pub address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_api_address(),
        }
    }
}

fn default_entrypoints() -> BTreeMap<String, EntryPointConfig> {
    let mut entrypoints = BTreeMap::new();
    entrypoints.insert("web".to_string(), EntryPointConfig::plain("0.0.0.0:80"));
    entrypoints.insert("websecure".to_string(), EntryPointConfig::tls("0.0.0.0:443"));
    entrypoints
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_event_buffer() -> usize {
    1024
}

fn default_label_prefix() -> String {
    "traefik".to_string()
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    2000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    1
}

fn default_acme_storage() -> String {
    "./acme/certificates.json".to_string()
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_renew_check_interval() -> u64 {
    12 * 60 * 60
}

fn default_handshake_timeout() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_cap() -> u64 {
    300
}

fn default_access_log_buffer() -> usize {
    4096
}

fn default_reopen_interval() -> u64 {
    5
}

fn default_api_address() -> String {
    "127.0.0.1:8082".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Names of entry points that terminate TLS
    pub fn tls_entrypoints(&self) -> Vec<&str> {
        self.entrypoints
            .iter()
            .filter(|(_, ep)| ep.tls)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Validate all configuration, collecting every problem
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.entrypoints.is_empty() {
            errors.push("at least one entry point is required".to_string());
        }

        for (name, ep) in &self.entrypoints {
            if let Err(e) = ep.socket_addr() {
                errors.push(format!("entrypoint '{}': {}", name, e));
            }
            if let Some(target) = &ep.redirect_to {
                match self.entrypoints.get(target) {
                    Some(t) if t.tls => {}
                    Some(_) => errors.push(format!(
                        "entrypoint '{}': redirect target '{}' is not a TLS entry point",
                        name, target
                    )),
                    None => errors.push(format!(
                        "entrypoint '{}': redirect target '{}' does not exist",
                        name, target
                    )),
                }
            }
        }

        for (id, backend) in &self.providers.static_backends {
            if backend.address.parse::<SocketAddr>().is_err() {
                errors.push(format!(
                    "static backend '{}': invalid address '{}'",
                    id, backend.address
                ));
            }
        }

        if self.providers.label_prefix.is_empty() || self.providers.label_prefix.contains(' ') {
            errors.push("providers.label_prefix must be a non-empty word".to_string());
        }

        if self.acme.enabled {
            if self.acme.email.is_none() {
                errors.push("acme.email is required when ACME is enabled".to_string());
            }
            if self.acme.max_attempts == 0 {
                errors.push("acme.max_attempts must be at least 1".to_string());
            }
            if self.acme.challenge_type == AcmeChallengeType::TlsAlpn01
                && self.tls_entrypoints().is_empty()
            {
                errors.push("tls-alpn-01 challenges need a TLS entry point".to_string());
            }
            if self.acme.challenge_type == AcmeChallengeType::Http01
                && self.entrypoints.values().all(|ep| ep.tls)
            {
                errors.push("http-01 challenges need a plaintext entry point".to_string());
            }
        }

        if self.access_log.buffer_size == 0 {
            errors.push("access_log.buffer_size must be at least 1".to_string());
        }

        if self.api.enabled && self.api.address.parse::<SocketAddr>().is_err() {
            errors.push(format!("api.address '{}' is invalid", self.api.address));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
