use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use llmfleet::cli::{
    format_resources, format_scan_report, format_validation_result, prepare_join_config,
    validate_config, Cli, Commands, JoinArgs, ResourcesArgs, ScanArgs,
};
use llmfleet::cluster::{CommandDispatcher, ConnectorError, NodeCapabilities, NodeConnector};
use llmfleet::config::{default_config_path, load_config};
use llmfleet::metrics::{ResourceSampler, DEFAULT_SAMPLE_INTERVAL};
use llmfleet::runtime::models::scan_dirs;
use llmfleet::runtime::{LocalModelManager, LocalProcessSupervisor, ProcessSupervisor};
use llmfleet::server::{create_router, AppState};

/// Runtimes this agent can drive
const SUPPORTED_RUNTIMES: &[&str] = &["llama.cpp"];

#[tokio::main]
async fn main() -> Result<()> {
    // A .env in the working directory feeds clap's env fallbacks
    dotenvy::dotenv().ok();
    let mut cli = Cli::parse();
    if let Some(env_file) = cli.env_file.clone() {
        dotenvy::from_path(&env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
        cli = Cli::parse();
    }

    // Initialize logging
    let filter = match cli.verbose {
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

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Join(ref args) => join(config_path, args).await,
        Commands::Resources(ref args) => resources(config_path, args).await,
        Commands::Scan(ref args) => scan(config_path, args).await,
        Commands::Validate => {
            let shown = config_path
                .map(Path::to_path_buf)
                .unwrap_or_else(default_config_path);
            let result = validate_config(config_path);
            print!("{}", format_validation_result(&result, &shown.display().to_string()));
            if !result.valid {
                process::exit(1);
            }
            Ok(())
        }
    }
}

async fn join(config_path: Option<&Path>, args: &JoinArgs) -> Result<()> {
    let config = prepare_join_config(config_path, args).context("Invalid configuration")?;

    let sampler = Arc::new(ResourceSampler::with_disk_path(
        config.sample_interval(),
        config.disk_path(),
    ));
    let first = sampler.sample_once().await;
    sampler.start();

    let supervisor: Arc<dyn ProcessSupervisor> =
        Arc::new(LocalProcessSupervisor::with_stop_grace(config.stop_grace()));
    let models = Arc::new(LocalModelManager::new(
        config.model_manager_config(),
        Arc::clone(&supervisor),
    ));
    let dispatcher = Arc::new(CommandDispatcher::new(models, Arc::clone(&supervisor)));

    let runtimes = SUPPORTED_RUNTIMES.iter().map(|r| r.to_string()).collect();
    let node = config.build_node(NodeCapabilities::detect(&first, runtimes));
    let connector = NodeConnector::builder()
        .node(node)
        .config(config.connector_config())
        .sampler(Arc::clone(&sampler))
        .handler(dispatcher)
        .build()?;

    // Node API
    let addr = format!("{}:{}", args.bind_addr, config.node.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind node API to {}", addr))?;
    let app = create_router(AppState::new(
        connector.clone(),
        Arc::clone(&sampler),
        Arc::clone(&supervisor),
    ));
    let server_stop = CancellationToken::new();
    let server = {
        let stop = server_stop.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        })
    };
    info!("Node API listening on {}", addr);

    let node_id = connector.node_info().id;
    info!(
        "Joining {} as {} ({})",
        config.coordinator.url,
        node_id,
        connector.node_info().full_address()
    );

    let connecting = connector.connect();
    tokio::pin!(connecting);
    let connected = tokio::select! {
        connected = &mut connecting => connected,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while registering");
            // disconnect() waits for the pending connect() to settle
            let (disconnected, connected) = tokio::join!(connector.disconnect(), &mut connecting);
            disconnected?;
            connected
        }
    };

    let outcome = match connected {
        Ok(()) => {
            println!("Node {} joined {}", node_id, config.coordinator.url);
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            Ok(())
        }
        Err(ConnectorError::Cancelled) => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context("Failed to join coordinator")),
    };

    if let Err(e) = connector.disconnect().await {
        error!("Disconnect failed: {}", e);
    }
    server_stop.cancel();
    match server.await {
        Ok(Err(e)) => error!("Node API error: {}", e),
        Err(e) => error!("Node API task failed: {}", e),
        Ok(Ok(())) => {}
    }
    supervisor.shutdown_all().await;
    sampler.stop().await;

    outcome
}

async fn resources(config_path: Option<&Path>, args: &ResourcesArgs) -> Result<()> {
    let disk_path = match &args.disk_path {
        Some(path) => path.clone(),
        None => load_config(config_path)
            .map(|c| c.disk_path())
            .unwrap_or_else(|_| "/".into()),
    };

    let sampler = ResourceSampler::with_disk_path(DEFAULT_SAMPLE_INTERVAL, disk_path);
    let snapshot = sampler.sample_once().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", format_resources(&snapshot));
    }
    Ok(())
}

async fn scan(config_path: Option<&Path>, args: &ScanArgs) -> Result<()> {
    let paths = if args.paths.is_empty() {
        load_config(config_path)?.model_manager_config().model_dirs
    } else {
        args.paths.clone()
    };
    if paths.is_empty() {
        bail!("No directories given and runtime.model_dirs is empty");
    }

    let report = tokio::task::spawn_blocking(move || scan_dirs(&paths)).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_scan_report(&report));
    }
    Ok(())
}
