use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use lbt_provider::CamaraClient;
use lbt_store::{wait_for_store, PgStore};
use lbt_sync::{
    run_backfill, run_poll_loop, run_recent_window, CycleSummary, PageRange, RecentWindow,
    SyncConfig, STARTUP_MAX_ATTEMPTS, STARTUP_RETRY_DELAY,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lbt-cli")]
#[command(about = "Legislative bill tracker sync interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending database migrations and exit.
    Migrate,
    /// One-off historical import over an explicit listing page range.
    Backfill {
        #[arg(long, default_value_t = 1)]
        start_page: u32,
        /// Defaults to the last page the source advertises.
        #[arg(long)]
        end_page: Option<u32>,
    },
    /// Single sync pass over a date window or year filter, no notifications.
    Recent {
        #[arg(long = "year")]
        years: Vec<i32>,
        #[arg(long)]
        since: Option<NaiveDate>,
        #[arg(long)]
        until: Option<NaiveDate>,
    },
    /// Continuous poll loop with notification fan-out.
    Watch {
        /// Override LBT_POLL_INTERVAL_SECS for this run.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_summary(summary: &CycleSummary) {
    println!(
        "{} complete: run_id={} pages={} abandoned={} new={} updated={} failed={} steps={} notified={}",
        summary.mode,
        summary.run_id,
        summary.pages_fetched,
        summary.pages_abandoned,
        summary.bills_new,
        summary.bills_updated,
        summary.bills_failed,
        summary.steps_inserted,
        summary.notifications_sent
    );
}

async fn ready_store(config: &SyncConfig) -> Result<PgStore> {
    let store = PgStore::connect_lazy(&config.database_url).context("building connection pool")?;
    wait_for_store(&store, STARTUP_MAX_ATTEMPTS, STARTUP_RETRY_DELAY)
        .await
        .context("database never became reachable")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = ready_store(&config).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Backfill {
            start_page,
            end_page,
        } => {
            let store = ready_store(&config).await?;
            store.migrate().await.context("running migrations")?;
            let source = CamaraClient::new(config.client_config())?;
            let range = PageRange {
                start: start_page,
                end: end_page,
            };
            let summary = run_backfill(&source, &store, &config, range).await?;
            print_summary(&summary);
        }
        Commands::Recent {
            years,
            since,
            until,
        } => {
            let store = ready_store(&config).await?;
            store.migrate().await.context("running migrations")?;
            let source = CamaraClient::new(config.client_config())?;
            let window = RecentWindow {
                years,
                since,
                until,
            };
            let summary = run_recent_window(&source, &store, &config, &window).await?;
            print_summary(&summary);
        }
        Commands::Watch { interval_secs } => {
            if let Some(secs) = interval_secs {
                config.poll_interval = std::time::Duration::from_secs(secs);
            }
            let store = ready_store(&config).await?;
            store.migrate().await.context("running migrations")?;
            let source = CamaraClient::new(config.client_config())?;
            run_poll_loop(&source, &store, &config).await?;
        }
    }

    Ok(())
}
