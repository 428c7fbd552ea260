//! MSSQL query service entry point.
//!
//! Serves JSON-RPC over stdio for an editor front-end.
//!
//! Features:
//! - Graceful shutdown with query draining
//! - Signal handling (SIGTERM, SIGINT, SIGHUP)
//! - Result buffer cleanup on exit

use anyhow::Result;
use mssql_query_service::database::{server_message_layer, SqlServerConnectionProvider};
use mssql_query_service::execution::event_channel;
use mssql_query_service::export::DefaultWriterFactory;
use mssql_query_service::rpc::RpcHost;
use mssql_query_service::shutdown::{
    install_signal_handlers, new_shutdown_controller_with_timeouts, ShutdownConfig,
};
use mssql_query_service::workspace::Workspace;
use mssql_query_service::{Config, QueryExecutionService};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries JSON-RPC frames
    init_logging();

    std::panic::set_hook(Box::new(|info| {
        eprintln!("[PANIC] {}", info);
    }));

    info!(
        "MSSQL query service v{} starting on stdio",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_env()?;
    let shutdown_config = ShutdownConfig::from_env();

    let shutdown_controller = new_shutdown_controller_with_timeouts(
        shutdown_config.drain_timeout,
        shutdown_config.force_timeout,
    );
    info!(
        "Shutdown timeouts: drain {:?}, force {:?}",
        shutdown_controller.drain_timeout(),
        shutdown_controller.force_timeout()
    );
    install_signal_handlers(shutdown_controller.clone()).await;

    let (events, event_receiver) = event_channel();
    let workspace = Arc::new(Workspace::new());
    let connections = Arc::new(SqlServerConnectionProvider::new(config.connection.clone()));
    let service = Arc::new(QueryExecutionService::new(
        connections,
        workspace.clone(),
        Arc::new(DefaultWriterFactory),
        config,
        events,
    ));

    let host = RpcHost::new(service.clone(), workspace, shutdown_controller.clone());
    info!("Ready to accept requests");

    let served = host
        .serve(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            event_receiver,
        )
        .await;
    if let Err(e) = &served {
        error!("RPC stream failed: {}", e);
    }
    if !host.shutdown_requested() {
        info!("Stream ended without a shutdown request");
    }

    shutdown_controller.graceful_shutdown(&service).await;
    info!("Server shutdown complete");

    served.map_err(Into::into)
}

/// Initialize tracing with stderr output plus the server message capture.
///
/// Logs MUST go to stderr because stdout is used for JSON-RPC communication.
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new("warn,mssql_query_service=info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_filter(filter),
        )
        .with(server_message_layer())
        .init();
}
