use clustergate::command::Manager;
use clustergate::config::Config;
use clustergate::health::{HealthBridge, TcpProber};
use clustergate::registry::Registry;
use clustergate::server::{McmpServer, PKG_NAME, VERSION};
use clustergate::stats::StatsBlock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("clustergate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("clustergate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let registry = Arc::new(Registry::open(&config.manager).map_err(|e| {
        error!(dir = %config.manager.mem_manager_file, error = %e, "Failed to open registry");
        e
    })?);

    let stats = Arc::new(StatsBlock::new());
    let health = HealthBridge::new(Arc::new(TcpProber), Arc::clone(&stats));
    let manager = Arc::new(Manager::new(Arc::clone(&registry), health, &config));
    info!(epoch = manager.restart_epoch(), "Manager ready");
    if config.manager.allow_cmd {
        debug!(nonce = manager.nonce(), "Management nonce");
    }

    let tls_acceptor = if config.server.tls_enabled() {
        let (Some(cert_path), Some(key_path)) = (&config.server.tls_cert, &config.server.tls_key) else {
            anyhow::bail!("server.tls_cert and server.tls_key must be set together");
        };
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let mut server = McmpServer::new(
        addr,
        Arc::clone(&manager),
        &config.server.manager_path,
        shutdown_rx.clone(),
    );
    if let Some(acceptor) = tls_acceptor {
        server = server.with_tls(acceptor);
    }

    // Spawn tombstone cleanup task
    let cleanup_registry = Arc::clone(&registry);
    let cleanup_stats = Arc::clone(&stats);
    let cleanup_interval = config.server.cleanup_interval();
    let node_timeout = config.server.node_timeout();
    let cleanup_shutdown_rx = shutdown_rx.clone();
    let cleanup_handle = tokio::spawn(async move {
        cleanup_loop(
            cleanup_registry,
            cleanup_stats,
            cleanup_interval,
            node_timeout,
            cleanup_shutdown_rx,
        )
        .await;
    });

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "MCMP server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = cleanup_handle.await;
    })
    .await;

    let persist_registry = Arc::clone(&registry);
    match tokio::task::spawn_blocking(move || persist_registry.persist()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to persist registry"),
        Err(e) => warn!(error = %e, "Persist task failed"),
    }

    info!("Shutdown complete");
    Ok(())
}

async fn cleanup_loop(
    registry: Arc<Registry>,
    stats: Arc<StatsBlock>,
    interval: Duration,
    node_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let registry = Arc::clone(&registry);
                let stats = Arc::clone(&stats);
                let result = tokio::task::spawn_blocking(move || {
                    registry.purge_removed_nodes(node_timeout, &stats)
                })
                .await;
                match result {
                    Ok(Ok(freed)) if !freed.is_empty() => {
                        info!(nodes = ?freed, "Purged removed nodes");
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Node purge failed"),
                    Err(e) => warn!(error = %e, "Node purge task failed"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting cluster manager");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        manager_path = %config.server.manager_path,
        tls = config.server.tls_enabled(),
        "Server configuration"
    );
    info!(
        max_node = config.manager.max_node,
        max_host = config.manager.max_host,
        max_context = config.manager.max_context,
        max_sessionid = config.manager.max_sessionid,
        max_mess_size = config.manager.message_limit(),
        "Table sizes"
    );
    info!(
        persist = config.manager.persist_slots,
        dir = %config.manager.mem_manager_file,
        balancer = %config.manager.default_balancer(),
        receive = config.manager.enable_mcpm_receive,
        ws_tunnel = config.manager.enable_ws_tunnel,
        "Manager settings"
    );
    info!(
        cleanup_interval_secs = config.server.cleanup_interval_secs,
        node_timeout_secs = config.server.node_timeout_secs,
        "Tombstone cleanup settings"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    while let Some(item) = rustls_pemfile::read_one(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
    {
        match item {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(key.into()),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(key.into()),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(key.into()),
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}
