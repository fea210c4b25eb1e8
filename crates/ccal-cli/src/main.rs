use anyhow::{Context, Result};
use ccal_core::ContestKind;
use ccal_storage::{ContestSink, SnapshotStore};
use ccal_sync::{SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "ccal")]
#[command(about = "Contest calendar crawler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl listings and store fresh snapshots.
    Sync {
        #[arg(long, value_enum, default_value_t = KindArg::All)]
        kind: KindArg,
    },
    /// Serve the read API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the stored snapshot of one listing as JSON.
    Show { kind: ContestKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Upcoming,
    Archive,
    All,
}

fn init_logging() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { kind: KindArg::All }) {
        Commands::Sync { kind } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let kinds = match kind {
                KindArg::Upcoming => vec![ContestKind::Upcoming],
                KindArg::Archive => vec![ContestKind::Archive],
                KindArg::All => pipeline.enabled_kinds(),
            };
            for kind in kinds {
                let summary = pipeline
                    .run_once(kind)
                    .await
                    .with_context(|| format!("syncing {kind} contests"))?;
                println!(
                    "sync complete: kind={} run_id={} pages={}/{} contests={} skipped_rows={} failed={} persisted={}",
                    summary.kind,
                    summary.run_id,
                    summary.pages_fetched,
                    summary.pages_planned,
                    summary.contests,
                    summary.skipped_rows,
                    summary.failed_records,
                    summary.persisted
                );
            }
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(ccal_web::web_port_from_env);
            ccal_web::serve(config, port).await?;
        }
        Commands::Show { kind } => {
            let store = SnapshotStore::new(config.snapshot_dir());
            match store.load(kind).await? {
                Some(snapshot) => {
                    let json = serde_json::to_string_pretty(&snapshot.contests)
                        .context("encoding contests")?;
                    println!("{json}");
                }
                None => warn!(%kind, "no snapshot stored yet"),
            }
        }
    }

    Ok(())
}
