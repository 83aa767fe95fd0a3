//! Main daemon command - boots the lifecycle engine and serves the API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use tracing::{info, warn};

use zephyr_daemon::config::Config;
use zephyr_daemon::docker::{ensure_network, DockerService};
use zephyr_daemon::events::EventBus;
use zephyr_daemon::router::{self, AppState};
use zephyr_daemon::server::Manager;
use zephyr_daemon::templates::{test_template, TemplateStore};

/// Run the daemon.
pub async fn run(config_path: &str, debug: bool, test_mode: bool) -> Result<()> {
    let mut config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            info!(path = config_path, "config not found or invalid ({}), creating default", e);
            let config = Config::default_config(config_path);
            config.save().context("failed to write default config")?;
            config
        }
    };
    config.debug = debug;

    if test_mode {
        info!("running in testing mode");
        config.system.data = "test/data".into();
        config.system.volumes = "test/volumes".into();
    }

    init_directories(&config).context("failed to create daemon directories")?;

    let docker = DockerService::shared().context("failed to create docker client")?;
    if let Err(e) = docker.ping().await {
        warn!("container runtime not reachable yet: {}", e);
    }

    if let Err(e) = ensure_network(&docker, &mut config).await {
        warn!("failed to ensure container network: {}", e);
    }

    let config = Arc::new(config);
    let events = EventBus::new();

    let templates = Arc::new(TemplateStore::new(&config));
    if test_mode {
        templates.add(test_template()).ok();
    }
    match templates.load() {
        Ok(count) => info!("loaded {} templates", count),
        Err(e) => warn!("failed to load templates: {}", e),
    }

    let manager = Arc::new(Manager::new(
        config.clone(),
        events.clone(),
        docker.clone(),
        templates,
    ));
    manager.load().await.context("failed to load servers")?;

    let state = AppState {
        manager: manager.clone(),
        config: config.clone(),
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("invalid bind address")?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let shutdown_manager = manager.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("received shutdown signal, stopping servers");
        shutdown_manager.shutdown().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    if config.server.tls.enabled {
        info!("server started on https://{}", bind_addr);

        let tls_config = RustlsConfig::from_pem_file(&config.server.tls.cert, &config.server.tls.key)
            .await
            .context("failed to load TLS certificate")?;

        axum_server::bind_rustls(bind_addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        info!("server started on http://{}", bind_addr);

        axum_server::bind(bind_addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    }

    info!("daemon stopped");
    Ok(())
}

fn init_directories(config: &Config) -> std::io::Result<()> {
    for dir in [
        config.data_dir(),
        config.servers_dir(),
        config.templates_dir(),
        config.volumes_dir(),
        config.temp_dir(),
        zephyr_daemon::system::normalize(&config.system.log),
        zephyr_daemon::system::normalize(&config.system.backup),
    ] {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}
