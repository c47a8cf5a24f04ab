//! Process Supervisor (C8): the binary entry point.
//!
//! Reads startup options, binds an ephemeral loopback port, initializes
//! the embedded engine, reports readiness to its parent, and installs
//! `SIGTERM`/`SIGINT` handlers that call graceful stop. Shaped after the
//! teacher's `GqlServer::start` convenience entry point, but this
//! supervisor owns argv parsing and readiness reporting too since there
//! is no separate process host in this design.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;

use crate::engine::{DuckDbAdapter, EngineAdapter};
use crate::resolver::SourceResolver;
use crate::rpc::RpcServer;

/// The binary's own flags, layered on top of the positional JSON startup
/// options (`--log-level` is ours; the JSON blob is the protocol's).
#[derive(Debug, Parser)]
#[command(name = "gdx-query-server", about = "GDX query server")]
struct Cli {
    /// Tracing filter directive, e.g. `info` or `gdx_query_server=debug`.
    #[arg(long, env = "GDX_QUERY_SERVER_LOG", default_value = "info")]
    log_level: String,

    /// Positional arguments: either `[optionsJson]` (the modern,
    /// single-argument shape) or `[extensionPath, optionsJson]` (the
    /// legacy two-argument shape, kept for wire compatibility with
    /// existing spawners — see Decision 1).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    positional: Vec<String>,
}

/// `{allowRemoteSourceLoading, globalStoragePath?}`, parsed from the
/// positional JSON options argument (§6).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartupOptions {
    #[serde(default)]
    allow_remote_source_loading: bool,
    #[serde(default)]
    global_storage_path: Option<PathBuf>,
}

/// Parse argv per Decision 1: prefer treating a lone positional as the
/// options JSON; fall back to the legacy two-argument shape when the
/// first positional does not parse as JSON and a second is present.
fn parse_startup_options(positional: &[String]) -> Result<StartupOptions, String> {
    match positional {
        [only] => serde_json::from_str(only).map_err(|e| e.to_string()),
        [first, second, ..] => match serde_json::from_str::<StartupOptions>(first) {
            Ok(options) => Ok(options),
            Err(_) => {
                tracing::warn!(
                    "falling back to legacy two-argument startup shape (argv[1] is not JSON)"
                );
                serde_json::from_str(second).map_err(|e| e.to_string())
            }
        },
        [] => Err("missing startup options argument".to_owned()),
    }
}

/// Run the server to completion: parse argv, initialize the engine, bind
/// the loopback listener, report readiness, and serve until a shutdown
/// signal arrives.
///
/// # Errors
///
/// Returns an error if argv cannot be parsed, the engine fails to
/// initialize, or the listener cannot be bound.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    install_tracing(&cli.log_level);

    let options = parse_startup_options(&cli.positional)?;
    let storage_dir = options
        .global_storage_path
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    tokio::fs::create_dir_all(&storage_dir).await.ok();

    let db_path = options
        .global_storage_path
        .as_ref()
        .map(|dir| dir.join(format!("gdx-viewer-{}.duckdb", uuid::Uuid::new_v4())));

    let engine: Arc<dyn EngineAdapter> = Arc::new(DuckDbAdapter::new(storage_dir.clone()));
    engine
        .initialize(db_path.as_deref().and_then(|p| p.to_str()))
        .await?;

    let resolver = SourceResolver::new(options.allow_remote_source_loading, storage_dir);
    let server = RpcServer::new(engine.clone(), resolver.clone(), db_path);
    let bound = server.bind("127.0.0.1:0".parse()?).await?;
    let port = bound.local_addr()?.port();

    report_ready(port);

    bound
        .serve(async {
            let reason = wait_for_shutdown_signal().await;
            tracing::info!(?reason, "shutdown signal received");
        })
        .await;

    if let Err(err) = engine.dispose().await {
        tracing::warn!(%err, "error disposing engine during shutdown");
    }
    resolver.dispose().await;

    Ok(())
}

/// Write the `{type:"ready", port}` message the parent process waits for
/// (§4.8, §6). Emitted on stdout as a single line, exactly once.
fn report_ready(port: u16) {
    let message = serde_json::json!({"type": "ready", "port": port});
    println!("{message}");
}

#[derive(Debug, Clone, Copy)]
enum ShutdownReason {
    Term,
    Int,
}

async fn wait_for_shutdown_signal() -> ShutdownReason {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = term.recv() => ShutdownReason::Term,
            _ = int.recv() => ShutdownReason::Int,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ShutdownReason::Int
    }
}

fn install_tracing(filter: &str) {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();
}
