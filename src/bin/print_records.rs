use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use doodle_listener::config;
use doodle_listener::db::{self, keys, SqliteStore, Store};

#[derive(Debug, Parser)]
#[command(author, version, about = "Print the records stored for a filter")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Filter name (defaults to the configured unbound filter)
    #[arg(long)]
    filter: Option<String>,

    /// Only print the newest N records
    #[arg(long)]
    last: Option<i64>,

    /// Emit JSON lines instead of a text summary
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool);

    let filter = args
        .filter
        .unwrap_or_else(|| cfg.ingest.default_filter.clone());
    let start = match args.last {
        Some(n) if n > 0 => -n,
        _ => 0,
    };
    let records = db::read_records(&store, &filter, start, -1).await?;

    for rec in &records {
        if args.json {
            println!("{}", serde_json::to_string(rec)?);
        } else {
            println!(
                "{}  @{}  {}  {}",
                rec.created_at,
                rec.author_handle,
                rec.image_urls.first().map(String::as_str).unwrap_or("-"),
                rec.post_url
            );
        }
    }

    if !args.json {
        let total = store.list_len(&keys::records(&filter)).await?;
        let seen = store.set_size(&keys::dedup(&filter)).await?;
        let marker = store.get(keys::CURSOR_LAST_SEEN).await?;
        eprintln!(
            "filter={} printed={} stored={} seen_uris={} last_seen={}",
            filter,
            records.len(),
            total,
            seen,
            marker.as_deref().unwrap_or("none")
        );
    }
    Ok(())
}
