use hatchery::acme::AcmeManager;
use hatchery::admin::AdminServer;
use hatchery::config::Config;
use hatchery::process::Supervisor;
use hatchery::proxy::{ProxyContext, ProxyServer};
use hatchery::registry::Registry;
use hatchery::tls::{CertStore, SniResolver};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hatchery=info".parse().expect("valid log directive")),
        )
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path).map_err(|err| {
                error!(path = %path.display(), error = %err, "failed to load configuration");
                err
            })?;
            info!(path = %path.display(), "configuration loaded");
            config
        }
        None => Config::default(),
    };

    let registry = Arc::new(Registry::new());
    let supervisor = Arc::new(Supervisor::new());
    let certs = Arc::new(CertStore::new());
    let acme = AcmeManager::new(PathBuf::from(&config.server.acme_cache))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = Arc::new(ProxyContext {
        registry: Arc::clone(&registry),
        supervisor: Arc::clone(&supervisor),
        acme: Some(Arc::clone(&acme)),
    });

    // Plain HTTP front-end: 80, falling back to 8000.
    let http_listener = bind_first(&config.server.bind, &config.server.http_ports).await?;
    let http_proxy = ProxyServer::new(http_listener, Arc::clone(&ctx), shutdown_rx.clone());
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http_proxy.run().await {
            error!(error = %err, "http proxy error");
        }
    });

    // TLS front-end: 443, falling back to 4443. Losing both ports only
    // disables TLS; the server keeps running.
    let https_handle = match bind_first(&config.server.bind, &config.server.tls_ports).await {
        Ok(listener) => {
            let resolver = SniResolver::new(Arc::clone(&certs), Some(Arc::clone(&acme)));
            let tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(resolver));
            let acceptor = TlsAcceptor::from(Arc::new(tls_config));
            let https_proxy = ProxyServer::new(listener, Arc::clone(&ctx), shutdown_rx.clone())
                .with_tls(acceptor);
            Some(tokio::spawn(async move {
                if let Err(err) = https_proxy.run().await {
                    error!(error = %err, "https proxy error");
                }
            }))
        }
        Err(err) => {
            warn!(error = %err, "tls listener disabled");
            None
        }
    };

    // Admin uploads bind loopback only, with no fallback port.
    let admin_listener =
        TcpListener::bind(("127.0.0.1", config.server.admin_port)).await.map_err(|err| {
            error!(port = config.server.admin_port, error = %err, "admin bind failed");
            anyhow::anyhow!("admin bind failed: {}", err)
        })?;
    let admin = AdminServer::new(
        admin_listener,
        Arc::clone(&registry),
        Arc::clone(&certs),
        Some(Arc::clone(&acme)),
        shutdown_rx.clone(),
    );
    let admin_handle = tokio::spawn(async move {
        if let Err(err) = admin.run().await {
            error!(error = %err, "admin server error");
        }
    });

    tokio::spawn(Arc::clone(&acme).run(shutdown_rx.clone()));

    wait_for_shutdown().await;

    let _ = shutdown_tx.send(true);

    // Bleed out and kill every backend before exiting.
    info!("stopping all apps");
    supervisor.stop_all(&registry.latest_sites());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_handle.await;
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
        let _ = admin_handle.await;
    })
    .await;

    info!("shutdown complete");
    Ok(())
}

/// Bind the first port in the preference list that is available.
async fn bind_first(bind: &str, ports: &[u16]) -> anyhow::Result<TcpListener> {
    let mut last_err = None;
    for &port in ports {
        match TcpListener::bind((bind, port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                warn!(bind, port, error = %err, "bind failed");
                last_err = Some(err);
            }
        }
    }
    match last_err {
        Some(err) => Err(anyhow::anyhow!("no port available in {:?}: {}", ports, err)),
        None => Err(anyhow::anyhow!("empty port list")),
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("listen for ctrl-c");
        info!("received ctrl-c, shutting down");
    }
}
