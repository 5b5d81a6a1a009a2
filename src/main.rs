//! dockployment - watch Docker for new tagged images and deploy them
//!
//! Usage:
//!   dockployment --config ./dockployment.json
//!   dockployment --once --dry-run
//!
//! Stops on Ctrl+C or SIGTERM after letting running deployments finish.
//!
//! Environment:
//!   DOCKPLOY_CONFIG   - Config file path
//!   DOCKPLOY_API_KEY  - Required X-API-Key for the status API
//!   RUST_LOG          - Log filter (default: dockployment=info,tower_http=info)

use clap::Parser;
use dockployment::api::{create_router, AppState};
use dockployment::core::Deployer;
use dockployment::history::DeploymentHistory;
use dockployment::models::DaemonConfig;
use dockployment::providers::{DockerCli, DockerEngine, WebhookNotifier};
use dockployment::utils::constants::{APP_VERSION, DEFAULT_CONFIG_PATH, SHUTDOWN_DRAIN_TIMEOUT_SECS};
use dockployment::watcher::DeployWatcher;

use eyre::{Result, WrapErr};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Parser)]
#[command(name = "dockployment", version, about = "Watch Docker for new tagged images and deploy them")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, env = "DOCKPLOY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log what would be deployed without touching containers
    #[arg(long)]
    dry_run: bool,

    /// Reconcile every rule once and exit
    #[arg(long)]
    once: bool,

    /// Do not start the status API
    #[arg(long)]
    no_api: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dockployment=info,tower_http=info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    info!("🐳 dockployment v{}", APP_VERSION);

    let config = load_config(&args)?;
    if config.dry_run {
        warn!("🧪 Dry run: no container will be changed");
    }

    let engine: Arc<dyn DockerEngine> = Arc::new(DockerCli::new(config.docker_bin.clone(), config.command_timeout()));
    let history = Arc::new(DeploymentHistory::new(config.history_capacity));

    let mut deployer = Deployer::new(engine, history.clone(), &config);
    if let Some(ref url) = config.webhook_url {
        info!("📨 Webhook notifications enabled");
        deployer = deployer.with_notifier(Arc::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(config.webhook_timeout_secs),
        )));
    }

    let watcher = Arc::new(DeployWatcher::new(Arc::new(deployer), &config)?);

    if args.once {
        let records = watcher.reconcile_once().await?;
        info!("Reconciled {} rule(s)", records.len());
        export_history(&config, &history);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = if args.no_api {
        None
    } else {
        let addr: SocketAddr = format!("{}:{}", config.api_host, config.api_port)
            .parse()
            .wrap_err("Invalid API address")?;
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("Failed to bind {}", addr))?;
        let app = create_router(Arc::new(AppState::new(watcher.clone(), config.api_key.clone())));
        if config.api_key.is_none() {
            warn!("🔓 Status API has no API key configured");
        }
        info!("🌐 Status API listening on http://{}", addr);

        let mut api_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = api_shutdown.changed().await;
                })
                .await
        }))
    };

    info!("Press Ctrl+C for graceful shutdown");

    // Run until the watcher gives up or a shutdown signal arrives
    let run = watcher.run(shutdown_rx);
    tokio::pin!(run);
    let outcome = tokio::select! {
        result = &mut run => result,
        () = shutdown_signal() => {
            info!("🛑 Shutting down gracefully...");
            let _ = shutdown_tx.send(true);
            run.await
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => error!("API server error: {}", e),
            Err(e) => error!("API server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    // A deployment cut short leaves the service parked under its backup name
    if watcher.in_flight() > 0 {
        info!("⏳ Waiting for {} deployment(s) to finish", watcher.in_flight());
        if !watcher.drain(Duration::from_secs(SHUTDOWN_DRAIN_TIMEOUT_SECS)).await {
            warn!("{} deployment(s) still running at shutdown", watcher.in_flight());
        }
    }
    watcher.log_stats();
    export_history(&config, &history);

    outcome.wrap_err("Watcher stopped")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}

fn load_config(args: &Args) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::load(&args.config)
        .wrap_err_with(|| format!("Could not load {}", args.config.display()))?;
    config.apply_env_overrides()?;
    if args.dry_run {
        config.dry_run = true;
    }
    config.validate()?;
    Ok(config)
}

fn export_history(config: &DaemonConfig, history: &DeploymentHistory) {
    let Some(ref dir) = config.history_dir else {
        return;
    };
    match history.export_json(Path::new(dir)) {
        Ok(path) => info!("📈 History exported to {}", path.display()),
        Err(e) => error!("History export failed: {}", e),
    }
}
