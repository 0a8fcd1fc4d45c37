use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tidegate::access_log::{AccessLogger, LogTarget};
use tidegate::acme::{AcmeAuthority, CertificateAuthority, ChallengeStore};
use tidegate::admin::{StatusServer, StatusState, PKG_NAME, VERSION};
use tidegate::certmanager::{CertManager, CertManagerOptions};
use tidegate::certstore::CertStore;
use tidegate::config::Config;
use tidegate::docker::DockerProvider;
use tidegate::healthcheck::HealthChecker;
use tidegate::pool::{ConnectionPool, PoolConfig};
use tidegate::provider::{spawn_provider, Provider, StaticProvider};
use tidegate::proxy::{EdgeServer, EdgeState};
use tidegate::registry::BackendRegistry;
use tidegate::routing::{CompileOptions, RouteCompiler, SharedRoutes};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tidegate.toml"));

    let loaded = Config::load(&config_path);
    let level = loaded
        .as_ref()
        .map(|c| c.log.level.clone())
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("tidegate={}", level).parse()?),
        )
        .init();

    let config = loaded.map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    let (registry, registry_handle) = BackendRegistry::spawn(&config.registry, shutdown_rx.clone());
    handles.push(registry_handle);

    // Certificates load before anything binds so a broken store stops startup
    let challenges = ChallengeStore::new();
    let store = CertStore::new(&config.acme.storage)?;
    let authority: Option<Arc<dyn CertificateAuthority>> = if config.acme.enabled {
        Some(Arc::new(AcmeAuthority::new(
            config.acme.clone(),
            store.account_path(),
            challenges.clone(),
        )))
    } else {
        None
    };
    let certs = CertManager::new(
        CertManagerOptions::from_config(&config.acme),
        store,
        authority,
        challenges.clone(),
    )
    .map_err(|e| {
        error!(path = %config.acme.storage, error = %e, "Failed to load certificate store");
        e
    })?;
    if config.acme.enabled {
        handles.push(certs.spawn_renewals(shutdown_rx.clone()));
    }

    let routes = SharedRoutes::new();
    let compiler = RouteCompiler::new(
        CompileOptions::from_config(&config),
        routes.clone(),
        registry.watch_backends(),
        Some(Arc::clone(&certs)),
    );
    handles.push(compiler.spawn(shutdown_rx.clone()));

    let static_provider = StaticProvider::from_config(&config.providers.static_backends)?;
    if !static_provider.is_empty() {
        handles.push(spawn_provider(
            Arc::new(static_provider) as Arc<dyn Provider>,
            registry.sender(),
            shutdown_rx.clone(),
        ));
    }
    if config.providers.docker.enabled {
        let docker = DockerProvider::new(
            config.providers.docker.clone(),
            &config.providers.label_prefix,
            config.providers.exposed_by_default,
        );
        handles.push(spawn_provider(
            Arc::new(docker) as Arc<dyn Provider>,
            registry.sender(),
            shutdown_rx.clone(),
        ));
    }

    // runs even when disabled, to bring back backends the proxy found unreachable
    let checker = HealthChecker::new(
        config.health_check.clone(),
        registry.watch_backends(),
        registry.sender(),
    );
    handles.push(tokio::spawn(checker.run(shutdown_rx.clone())));

    let access_log = AccessLogger::new(&config.access_log);
    let access_log_handle = if config.access_log.enabled {
        Some(access_log.spawn_writer(
            LogTarget::from_config(&config.access_log),
            config.access_log.format,
            Duration::from_secs(config.access_log.reopen_interval_secs.max(1)),
            shutdown_rx.clone(),
        ))
    } else {
        None
    };

    let pool = Arc::new(ConnectionPool::new(PoolConfig::from_server(&config.server)));
    let pool_stats = pool.stats();

    let edge = EdgeServer::bind(
        &config.entrypoints,
        EdgeState {
            routes: routes.clone(),
            pool,
            access_log: Arc::clone(&access_log),
            challenges,
            registry_tx: registry.sender(),
            certs: Some(Arc::clone(&certs)),
            request_timeout: config.server.request_timeout(),
        },
    )
    .await?;
    let connections = edge.connections();
    let edge_handles = edge.spawn(shutdown_rx.clone());

    if config.api.enabled {
        let addr = config
            .api
            .address
            .parse()
            .with_context(|| format!("Invalid status API address '{}'", config.api.address))?;
        let status = StatusServer::bind(
            addr,
            StatusState {
                routes,
                backends_rx: registry.watch_backends(),
                degraded_rx: registry.watch_degraded(),
                certs: Some(certs),
                access_log,
                pool_stats,
            },
        )
        .await?;
        handles.push(tokio::spawn(status.run(shutdown_rx.clone())));
    }

    info!("Tidegate ready");

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in edge_handles {
            let _ = handle.await;
        }
    })
    .await;

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    if !connections.wait_idle(grace).await {
        warn!(
            active = connections.active(),
            grace_secs = grace.as_secs(),
            "Connections still open after grace period"
        );
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = access_log_handle {
            let _ = handle.await;
        }
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting edge router");
    for (name, ep) in &config.entrypoints {
        info!(
            entrypoint = %name,
            address = %ep.address,
            tls = ep.tls,
            redirect_to = ?ep.redirect_to,
            "Entry point configured"
        );
    }
    info!(
        docker = config.providers.docker.enabled,
        static_backends = config.providers.static_backends.len(),
        label_prefix = %config.providers.label_prefix,
        health_checks = config.health_check.enabled,
        "Discovery settings"
    );
    info!(
        acme = config.acme.enabled,
        challenge = ?config.acme.challenge_type,
        storage = %config.acme.storage,
        "Certificate settings"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Connection pool settings"
    );
}
