//! Main entry point for the collab-sync server.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

use collab_sync::server::{AppState, create_router};
use collab_sync::{
    Config, FileStore, MemoryStore, SnapshotStore, StaticAccessControl, SyncEngine, TokenVerifier,
    UserId,
};

#[derive(Parser)]
#[command(name = "collab-sync", version, about = "Real-time document sync server")]
struct Cli {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override server.bind_addr
    #[arg(long)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default)
    Serve,
    /// Print a session token for a user
    IssueToken { user: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("collab_sync=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    config.validate()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::IssueToken { user } => {
            let tokens = TokenVerifier::new(&config.auth.token_secret);
            println!("{}", tokens.issue(&UserId::new(user)));
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Starting collab-sync server...");

    let store: Arc<dyn SnapshotStore> = match &config.persistence.data_dir {
        Some(dir) => {
            let store = FileStore::open(dir)
                .await
                .with_context(|| format!("opening data directory {}", dir.display()))?;
            info!("Storing snapshots in {}", store.root().display());
            Arc::new(store)
        }
        None => {
            warn!("No persistence.data_dir configured; documents are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let access = StaticAccessControl::from_workspaces(&config.workspaces);
    info!("Loaded {} workspaces", access.workspaces().len());

    let engine = SyncEngine::new(&config, store, Arc::new(access));
    if tracing::enabled!(Level::DEBUG) {
        spawn_change_log(&engine);
    }

    let state = AppState::new(Arc::clone(&engine), TokenVerifier::new(&config.auth.token_secret));
    let app = create_router(state);

    let listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;

    info!("Server listening on http://{}", listener.local_addr()?);
    info!("Available endpoints:");
    info!("  GET  /health                      - Health check");
    info!("  GET  /ws/:document_id?token=...   - Sync session (WebSocket)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let written = engine.shutdown().await;
    info!("Flushed {written} documents, bye");
    Ok(())
}

fn spawn_change_log(engine: &Arc<SyncEngine>) {
    let mut changes = engine.subscribe_changes();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => debug!(
                    "{} is now at version {} ({} characters, {})",
                    change.document_id,
                    change.version,
                    change.content.chars().count(),
                    change.changed_at.to_rfc3339()
                ),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Change log skipped {skipped} notifications")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
