//! Docker discovery: running containers with routing labels become backends

use crate::config::DockerProviderConfig;
use crate::labels::{parse_labels, service_port};
use crate::provider::Provider;
use crate::registry::{Backend, BackendHealth, DiscoveryEvent};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, EndpointSettings, EventMessage, HealthStatusEnum,
};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Compose puts the service name here; preferred over the container name
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// How container attributes turn into a backend
#[derive(Debug, Clone)]
pub struct ContainerRules {
    pub label_prefix: String,
    pub exposed_by_default: bool,
    pub network: Option<String>,
}

/// What we need to know about a container, from either a list or an inspect
#[derive(Debug, Clone, Default)]
pub struct ContainerFacts {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// Network name to container IP
    pub networks: BTreeMap<String, String>,
    pub ports: Vec<u16>,
    pub health: BackendHealth,
}

impl ContainerFacts {
    pub fn from_summary(summary: &ContainerSummary) -> Option<Self> {
        let id = summary.id.clone()?;
        let name = summary
            .names
            .as_ref()
            .and_then(|n| n.first())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.chars().take(12).collect());
        let networks = summary
            .network_settings
            .as_ref()
            .and_then(|s| s.networks.as_ref())
            .map(network_ips)
            .unwrap_or_default();
        let mut ports: Vec<u16> = summary
            .ports
            .as_ref()
            .map(|ports| ports.iter().map(|p| p.private_port).collect())
            .unwrap_or_default();
        ports.sort_unstable();
        ports.dedup();

        // status looks like "Up 3 minutes (healthy)"
        let health = match summary.status.as_deref() {
            Some(s) if s.contains("(unhealthy)") => BackendHealth::Unhealthy,
            Some(s) if s.contains("(healthy)") => BackendHealth::Healthy,
            _ => BackendHealth::Unknown,
        };

        Some(Self {
            id,
            name,
            labels: summary.labels.clone().unwrap_or_default(),
            networks,
            ports,
            health,
        })
    }

    pub fn from_inspect(info: &ContainerInspectResponse) -> Option<Self> {
        let id = info.id.clone()?;
        let name = info
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.chars().take(12).collect());
        let config = info.config.as_ref();
        let labels = config.and_then(|c| c.labels.clone()).unwrap_or_default();
        let mut ports: Vec<u16> = config
            .and_then(|c| c.exposed_ports.as_ref())
            .map(|exposed| {
                exposed
                    .keys()
                    .filter_map(|k| k.split('/').next().and_then(|p| p.parse().ok()))
                    .collect()
            })
            .unwrap_or_default();
        ports.sort_unstable();
        let networks = info
            .network_settings
            .as_ref()
            .and_then(|s| s.networks.as_ref())
            .map(network_ips)
            .unwrap_or_default();
        let health = info
            .state
            .as_ref()
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status.as_ref())
            .map(|status| match status {
                HealthStatusEnum::HEALTHY => BackendHealth::Healthy,
                HealthStatusEnum::UNHEALTHY => BackendHealth::Unhealthy,
                _ => BackendHealth::Unknown,
            })
            .unwrap_or_default();

        Some(Self {
            id,
            name,
            labels,
            networks,
            ports,
            health,
        })
    }

    /// Build the backend this container represents, if it is routable
    pub fn to_backend(&self, rules: &ContainerRules) -> Option<Backend> {
        let routing = parse_labels(&self.labels, &rules.label_prefix);
        if !routing.is_enabled(rules.exposed_by_default) {
            debug!(container = %self.name, "Container not enabled for routing");
            return None;
        }

        let ip = rules
            .network
            .as_ref()
            .and_then(|n| self.networks.get(n))
            .or_else(|| self.networks.values().next())
            .and_then(|ip| ip.parse::<IpAddr>().ok());
        let Some(ip) = ip else {
            warn!(container = %self.name, network = ?rules.network, "Container has no reachable IP address");
            return None;
        };

        let port = service_port(&self.labels, &rules.label_prefix).or_else(|| self.ports.first().copied());
        let Some(port) = port else {
            warn!(container = %self.name, "Container exposes no port and declares none in labels");
            return None;
        };

        let name = self
            .labels
            .get(COMPOSE_SERVICE_LABEL)
            .cloned()
            .unwrap_or_else(|| self.name.clone());

        Some(
            Backend::new(&self.id, &name, DockerProvider::NAME, SocketAddr::new(ip, port))
                .with_labels(self.labels.clone())
                .with_health(self.health),
        )
    }
}

fn network_ips(networks: &HashMap<String, EndpointSettings>) -> BTreeMap<String, String> {
    networks
        .iter()
        .filter_map(|(name, settings)| {
            settings
                .ip_address
                .as_ref()
                .filter(|ip| !ip.is_empty())
                .map(|ip| (name.clone(), ip.clone()))
        })
        .collect()
}

/// What an engine event means for the backend set
#[derive(Debug, PartialEq, Eq)]
enum EventAction {
    /// Re-read the container
    Refresh(String),
    /// The container is gone or not serving
    Remove(String),
    Ignore,
}

fn classify_event(event: &EventMessage) -> EventAction {
    let Some(id) = event.actor.as_ref().and_then(|a| a.id.clone()) else {
        return EventAction::Ignore;
    };
    let action = event.action.as_deref().unwrap_or_default();
    // health events look like "health_status: healthy"
    let verb = action.split(':').next().unwrap_or_default().trim();

    match verb {
        "start" | "unpause" | "health_status" | "rename" | "update" => EventAction::Refresh(id),
        "die" | "stop" | "kill" | "pause" | "destroy" => EventAction::Remove(id),
        _ => EventAction::Ignore,
    }
}

/// Watches the Docker engine for containers
pub struct DockerProvider {
    config: DockerProviderConfig,
    rules: ContainerRules,
}

impl DockerProvider {
    pub const NAME: &'static str = "docker";

    pub fn new(config: DockerProviderConfig, label_prefix: &str, exposed_by_default: bool) -> Self {
        let rules = ContainerRules {
            label_prefix: label_prefix.to_string(),
            exposed_by_default,
            network: config.network.clone(),
        };
        Self { config, rules }
    }

    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Configured endpoint
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's platform defaults
    async fn connect(&self) -> anyhow::Result<Docker> {
        let client = if let Some(host) = &self.config.endpoint {
            connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            connect_to_host(&host)?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Docker daemon is not responding: {}", e))?;

        debug!("Connected to Docker daemon");
        Ok(client)
    }

    async fn list(&self, client: &Docker) -> anyhow::Result<Vec<Backend>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = client.list_containers(Some(options)).await?;

        Ok(containers
            .iter()
            .filter_map(ContainerFacts::from_summary)
            .filter_map(|facts| facts.to_backend(&self.rules))
            .collect())
    }

    async fn refresh(&self, client: &Docker, id: &str) -> anyhow::Result<Option<Backend>> {
        let info = match client.inspect_container(id, None).await {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Ok(None);
        }
        Ok(ContainerFacts::from_inspect(&info).and_then(|f| f.to_backend(&self.rules)))
    }

    /// Follow the event stream until it fails or shutdown is requested.
    /// Returns Ok(()) only on shutdown.
    async fn watch(
        &self,
        client: &Docker,
        tx: &mpsc::Sender<DiscoveryEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };
        // subscribe before listing so nothing falls between the two
        let mut events = Box::pin(client.events(Some(options)));

        let backends = self.list(client).await?;
        info!(count = backends.len(), "Docker containers discovered");
        send(tx, DiscoveryEvent::Snapshot {
            provider: Self::NAME.to_string(),
            backends,
        })
        .await?;

        loop {
            tokio::select! {
                event = events.next() => {
                    let event = match event {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => anyhow::bail!("Docker event stream error: {}", e),
                        None => anyhow::bail!("Docker event stream ended"),
                    };
                    match classify_event(&event) {
                        EventAction::Refresh(id) => match self.refresh(client, &id).await? {
                            Some(backend) => send(tx, DiscoveryEvent::Upsert(backend)).await?,
                            None => send(tx, remove(id)).await?,
                        },
                        EventAction::Remove(id) => send(tx, remove(id)).await?,
                        EventAction::Ignore => {}
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn remove(id: String) -> DiscoveryEvent {
    DiscoveryEvent::Remove {
        provider: DockerProvider::NAME.to_string(),
        id,
    }
}

async fn send(tx: &mpsc::Sender<DiscoveryEvent>, event: DiscoveryEvent) -> anyhow::Result<()> {
    tx.send(event)
        .await
        .map_err(|_| anyhow::anyhow!("Registry is gone"))
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker endpoint format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &self,
        tx: mpsc::Sender<DiscoveryEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let retry = Duration::from_secs(self.config.reconnect_interval_secs.max(1));

        loop {
            let outcome = match self.connect().await {
                Ok(client) => self.watch(&client, &tx, &mut shutdown_rx).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, retry_secs = retry.as_secs(), "Docker discovery unavailable");
                    send(&tx, DiscoveryEvent::Unavailable {
                        provider: Self::NAME.to_string(),
                        reason: e.to_string(),
                    })
                    .await?;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Docker provider shutting down");
        Ok(())
    }
}
