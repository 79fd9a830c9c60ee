use anyhow::{Context, Result};
use clap::Parser;
use expense_core::Dispatcher;
use mcp_protocol::McpServer;
use mcp_server::{
    config::OAuthProviderKind,
    initialize_app, init_telemetry,
    setup::{spawn_pending_purge, PENDING_PURGE_INTERVAL},
    telemetry::{log_startup_info, report_error},
    Config, StdioMcpServer, Transport,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "expense-mcp")]
#[command(about = "Expense report MCP server with service and user authentication")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Transport to serve MCP on
    #[arg(long, value_enum)]
    transport: Option<Transport>,

    /// Listen address override (`host` or `host:port`)
    #[arg(long, env = "LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// OAuth provider override (none, microsoft, google)
    #[arg(long)]
    oauth_provider: Option<OAuthProviderKind>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(config_file) => Config::from_file(config_file)?,
        None => Config::from_env()?,
    };

    if let Some(transport) = cli.transport {
        config.server.transport = transport;
    }
    if let Some(ref listen_addr) = cli.listen_addr {
        config.set_listen_addr(listen_addr);
    }
    if let Some(ref log_level) = cli.log_level {
        config.logging.level = log_level.clone();
    }
    if let Some(provider) = cli.oauth_provider {
        config.oauth.provider = provider;
    }

    Ok(config)
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

async fn run_http(config: &Config, dispatcher: Arc<Dispatcher>) -> Result<()> {
    McpServer::new(dispatcher)
        .serve_with_shutdown(&config.server_address(), shutdown_signal())
        .await
}

async fn run_stdio(config: &Config, dispatcher: Arc<Dispatcher>) -> Result<()> {
    // The provider redirects the browser here, so the listener must run
    // alongside stdio whenever user login is possible
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let callback_listener = if dispatcher.flow().is_configured() {
        let server = McpServer::callback_only(dispatcher.clone());
        let addr = config.server_address();
        info!(addr = %addr, redirect_uri = %config.redirect_uri(), "Starting OAuth callback listener");
        Some(tokio::spawn(async move {
            let stopped = async {
                let _ = stop_rx.await;
            };
            if let Err(e) = server.serve_with_shutdown(&addr, stopped).await {
                report_error(&e, "OAuth callback listener");
            }
        }))
    } else {
        None
    };

    let result = tokio::select! {
        result = StdioMcpServer::new(dispatcher).serve() => result,
        _ = shutdown_signal() => Ok(()),
    };

    let _ = stop_tx.send(());
    if let Some(handle) = callback_listener {
        if let Err(e) = handle.await {
            warn!(error = %e, "OAuth callback listener task failed");
        }
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = load_config(&cli).context("Failed to load configuration")?;

    init_telemetry(&config.logging).context("Failed to initialize telemetry")?;

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }

    log_startup_info(&config);

    let dispatcher = initialize_app(&config)
        .await
        .context("Failed to initialize application")?;

    let purge = dispatcher
        .flow()
        .is_configured()
        .then(|| spawn_pending_purge(dispatcher.clone(), PENDING_PURGE_INTERVAL));

    let result = match config.server.transport {
        Transport::Http => run_http(&config, dispatcher).await,
        Transport::Stdio => run_stdio(&config, dispatcher).await,
    };
    if let Some(purge) = purge {
        purge.abort();
    }

    match result {
        Ok(()) => {
            info!("Expense MCP server shut down cleanly");
            Ok(())
        }
        Err(e) => {
            report_error(&e, "MCP server");
            std::process::exit(3);
        }
    }
}
