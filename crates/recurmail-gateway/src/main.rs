use clap::Parser;
use recurmail_core::config::RecurmailConfig;
use recurmail_google::{GmailTransport, GoogleIdentity};
use recurmail_scheduler::{CredentialBroker, Dispatcher, JobStore, Scheduler, SchedulerOptions, SqliteStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

mod app;
mod http;

#[derive(Debug, Parser)]
#[command(name = "recurmail-gateway", version, about = "Recurring email scheduler")]
struct Args {
    /// Path to recurmail.toml. Falls back to RECURMAIL_CONFIG, then ~/.recurmail/recurmail.toml.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "recurmail_gateway=info,recurmail_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let args = Args::parse();

    // load config: explicit path > RECURMAIL_CONFIG env > ~/.recurmail/recurmail.toml
    let config_path = args.config.or_else(|| std::env::var("RECURMAIL_CONFIG").ok());
    let config = RecurmailConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        RecurmailConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store: Arc<dyn JobStore> = Arc::new(SqliteStore::open(db_path)?);
    info!("database migrations complete");

    if config.google.client_id.is_empty() {
        tracing::warn!("google.client_id is not set; expired credentials cannot be refreshed");
    }
    let identity = Arc::new(GoogleIdentity::new(&config.google));
    let transport = Arc::new(GmailTransport::new(&config.google));
    let broker = Arc::new(CredentialBroker::new(
        store.clone(),
        identity,
        chrono::Duration::seconds(config.scheduler.credential_skew_secs),
    ));
    let dispatcher = Arc::new(Dispatcher::new(broker, transport));
    let scheduler = Scheduler::new(
        store.clone(),
        dispatcher,
        SchedulerOptions::from(&config.scheduler),
    );

    if config.scheduler.enabled {
        scheduler.start();
    } else {
        info!("scheduler disabled by config; jobs only run via send-now");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = Arc::new(app::AppState::new(config, store, scheduler.clone()));
    let router = app::build_router(state);

    info!("Recurmail gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // let an in-flight tick finish before exiting
    scheduler.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
