//! Discovery providers feed backends into the registry

use crate::config::StaticBackendConfig;
use crate::registry::{Backend, DiscoveryEvent};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A source of backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name used as the `provider` of every backend it reports
    fn name(&self) -> &str;

    /// Report backends until shutdown. Feed outages should be reported as
    /// [`DiscoveryEvent::Unavailable`] rather than returned as errors.
    async fn run(
        &self,
        tx: mpsc::Sender<DiscoveryEvent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()>;
}

/// Run a provider on its own task
pub fn spawn_provider(
    provider: Arc<dyn Provider>,
    tx: mpsc::Sender<DiscoveryEvent>,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = provider.name().to_string();
        info!(provider = %name, "Provider started");
        if let Err(e) = provider.run(tx, shutdown_rx).await {
            error!(provider = %name, error = %e, "Provider stopped with error");
        }
    })
}

/// Backends declared in the configuration file
pub struct StaticProvider {
    backends: Vec<Backend>,
}

impl StaticProvider {
    pub const NAME: &'static str = "static";

    pub fn new(backends: Vec<Backend>) -> Self {
        Self { backends }
    }

    pub fn from_config(entries: &BTreeMap<String, StaticBackendConfig>) -> anyhow::Result<Self> {
        let backends = entries
            .iter()
            .map(|(id, entry)| {
                let address: SocketAddr = entry.address.parse().map_err(|e| {
                    anyhow::anyhow!("Invalid address '{}' for backend '{}': {}", entry.address, id, e)
                })?;
                Ok(Backend::new(id, id, Self::NAME, address).with_labels(entry.labels.clone()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { backends })
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &self,
        tx: mpsc::Sender<DiscoveryEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tx.send(DiscoveryEvent::Snapshot {
            provider: Self::NAME.to_string(),
            backends: self.backends.clone(),
        })
        .await
        .map_err(|_| anyhow::anyhow!("Registry is gone"))?;

        info!(count = self.backends.len(), "Static backends registered");

        while shutdown_rx.changed().await.is_ok() {
            if *shutdown_rx.borrow() {
                break;
            }
        }
        Ok(())
    }
}
