use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use taskpod::cli::{format_dry_run, Args};
use taskpod::cluster::{create_client, KubeGateway};
use taskpod::config::{default_config_path, load_config_file, ServiceConfig};
use taskpod::server::{create_router, AppState};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

/// Explicit config path, else the default one when it exists
fn resolve_config(args: &Args) -> anyhow::Result<(ServiceConfig, Option<PathBuf>)> {
    let path = match &args.config {
        Some(path) => Some(path.clone()),
        None => Some(default_config_path()).filter(|p| p.exists()),
    };
    let config = match &path {
        Some(path) => load_config_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    let config = args.apply_overrides(config);
    config.validate().context("Invalid configuration")?;
    Ok((config, path))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let (config, source) = resolve_config(&args)?;

    // Dry-run mode: print effective settings and exit
    if args.dry_run {
        println!("{}", format_dry_run(&config, source.as_deref()));
        return Ok(());
    }

    let kubeconfig = config.kubeconfig_path()?;
    let client = create_client(kubeconfig.as_deref())
        .await
        .context("Failed to connect to the cluster")?;
    let gateway = Arc::new(KubeGateway::new(
        client,
        config.namespace.clone(),
        config.gpu_resource.clone(),
    ));

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let shutdown = CancellationToken::new();
    info!(namespace = %config.namespace, "Managing tasks");
    let state = AppState::new(gateway, config).with_shutdown(shutdown.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET    /health               - Health check");
    info!("  POST   /create-pod           - Create a task");
    info!("  GET    /available-resources  - Free and used CPU/GPU");
    info!("  POST   /add-resources        - Resize a task");
    info!("  DELETE /delete-task/:name    - Delete a task");
    info!("  GET    /tasks, /list-tasks   - List tasks");
    info!("  POST   /access-jupyter       - Port-forward and recover token");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            shutdown.cancel();
        })
        .await
        .context("Server error")
}
