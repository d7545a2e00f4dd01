use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use doodle_listener::config;
use doodle_listener::db::{self, keys, SqliteStore, Store};

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage the filters the listener fans doodles out to")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List configured filters with their record and dedup counts
    List,
    /// Create a filter, optionally bound to one author handle
    Add {
        name: String,
        /// Author handle to restrict the filter to
        #[arg(long)]
        handle: Option<String>,
    },
    /// Remove a filter's configuration (stored records are kept)
    Remove { name: String },
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
    let store = SqliteStore::new(pool);
    let default_filter = cfg.ingest.default_filter.as_str();

    match args.command {
        Command::List => {
            for filter in db::load_filters(&store, default_filter).await? {
                let records = store.list_len(&keys::records(&filter.name)).await?;
                let dedup = store.set_size(&keys::dedup(&filter.name)).await?;
                println!(
                    "{}\t{}\trecords={}\tseen={}",
                    filter.name,
                    filter.handle.as_deref().unwrap_or("*"),
                    records,
                    dedup
                );
            }
        }
        Command::Add { name, handle } => {
            let filter = db::bind_filter(&store, default_filter, &name, handle.as_deref()).await?;
            info!(name = %filter.name, handle = ?filter.handle, "filter configured");
        }
        Command::Remove { name } => {
            if db::unbind_filter(&store, &name).await? {
                info!(%name, "filter removed");
            } else {
                info!(%name, "no such filter");
            }
        }
    }

    Ok(())
}
