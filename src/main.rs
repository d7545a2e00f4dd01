use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use doodle_listener::bsky::BlueskyClient;
use doodle_listener::config;
use doodle_listener::cursor::CursorOptions;
use doodle_listener::db::{self, SqliteStore, Store};
use doodle_listener::scheduler::{PollScheduler, Poller};
use doodle_listener::session::{Credentials, SessionManager, StdinCodePrompt, StoreSessionSink};

#[derive(Debug, Parser)]
#[command(author, version, about = "Poll the hashtag search and fan doodles out to filters")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));

    let filters = db::load_filters(store.as_ref(), &cfg.ingest.default_filter).await?;
    info!("filter configuration:");
    for filter in &filters {
        info!(
            "  {}: {}",
            filter.name,
            filter.handle.as_deref().unwrap_or("all users (no filter)")
        );
    }

    let client = Arc::new(
        BlueskyClient::new(&cfg.bluesky.service)?
            .with_session_sink(Arc::new(StoreSessionSink::new(store.clone()))),
    );
    let session = SessionManager::new(
        client.clone(),
        store.clone(),
        Arc::new(StdinCodePrompt),
        Credentials {
            identifier: cfg.bluesky.identifier.clone(),
            password: cfg.bluesky.password.clone(),
        },
    );
    let poller = Poller::new(
        client,
        store,
        cfg.ingest_rules(),
        CursorOptions {
            hashtag: cfg.ingest.hashtag.clone(),
            batch_size: cfg.ingest.batch_size,
            max_pages: cfg.ingest.max_pages,
        },
        cfg.ingest.default_filter.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = wait_for_signal().await {
            warn!(?err, "failed to install signal handlers");
            return;
        }
        let _ = shutdown_tx.send(true);
    });

    info!(
        interval_secs = cfg.app.poll_interval_seconds,
        hashtag = %cfg.ingest.hashtag,
        "starting doodle listener"
    );
    let mut scheduler = PollScheduler::new(
        session,
        poller,
        Duration::from_secs(cfg.app.poll_interval_seconds),
    );
    scheduler.run(shutdown_rx).await
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let name = tokio::select! {
        _ = int.recv() => "SIGINT",
        _ = term.recv() => "SIGTERM",
        _ = hup.recv() => "SIGHUP",
    };
    info!(signal = name, "termination signal received");
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("termination signal received");
    Ok(())
}
