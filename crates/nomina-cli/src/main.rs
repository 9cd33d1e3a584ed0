use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use nomina_core::Period;
use nomina_sync::{PeriodStatus, SyncRequest};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "nomina-cli")]
#[command(about = "Loads the published public-payroll tables into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest pending periods (the default).
    Sync(SyncArgs),
    /// Apply the embedded schema migrations.
    Migrate,
    /// List archives recorded as successfully ingested.
    Ledger,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Period to ingest as YYYY-MM; repeatable.
    #[arg(long = "period", value_name = "YYYY-MM", conflicts_with_all = ["from", "to"])]
    periods: Vec<Period>,
    /// First period of an inclusive range.
    #[arg(long, value_name = "YYYY-MM")]
    from: Option<Period>,
    /// Last period of an inclusive range; defaults to the current month.
    #[arg(long, value_name = "YYYY-MM", requires = "from")]
    to: Option<Period>,
    /// Re-ingest periods the ledger already lists.
    #[arg(long)]
    force: bool,
    /// Run the whole pipeline against an in-memory store.
    #[arg(long)]
    dry_run: bool,
}

impl SyncArgs {
    fn into_request(self) -> Result<SyncRequest> {
        let periods = match self.from {
            Some(from) => {
                let to = self.to.unwrap_or_else(Period::current);
                if to < from {
                    bail!("--to {to} is before --from {from}");
                }
                Period::range(from, to)
            }
            None => self.periods,
        };
        Ok(SyncRequest {
            periods,
            force: self.force,
            dry_run: self.dry_run,
        })
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("NOMINA_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).try_init()?;
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed arguments");

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let summary = nomina_sync::run_sync_from_env(args.into_request()?).await?;
            for report in &summary.periods {
                if report.status != PeriodStatus::Completed {
                    eprintln!(
                        "{} {:?}: {}",
                        report.period,
                        report.status,
                        report.error.as_deref().unwrap_or("-")
                    );
                }
            }
            println!(
                "sync complete: run_id={} requested={} already_ingested={} completed={} skipped={} failed={}",
                summary.run_id,
                summary.requested,
                summary.already_ingested,
                summary.completed,
                summary.skipped,
                summary.failed
            );
        }
        Commands::Migrate => {
            nomina_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Ledger => {
            for locator in nomina_sync::list_completed_from_env().await? {
                println!("{locator}");
            }
        }
    }

    Ok(())
}
