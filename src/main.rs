//! RidgeRadar entry point.
//!
//! `run` starts the full periodic pipeline; the other subcommands trigger a
//! single task against the configured database, which is handy for ops and
//! for backfills.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ridgeradar::closing::ClosingService;
use ridgeradar::config::{ScoringConfig, Settings, ShadowTradingConfig};
use ridgeradar::exchange::{ExchangeClient, MemoryTokenStore, RateLimiter, SessionManager};
use ridgeradar::ingestion::{DiscoveryService, SnapshotService};
use ridgeradar::profiling::ProfilingService;
use ridgeradar::results::ResultsService;
use ridgeradar::scheduler::Scheduler;
use ridgeradar::scoring::ScoringService;
use ridgeradar::shadow::{current_phase, PAPER_TRADING_DISCLAIMER};
use ridgeradar::stats::CompetitionStatsService;
use ridgeradar::storage::Database;

#[derive(Parser)]
#[command(name = "ridgeradar", about = "Betting-exchange market observation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full periodic pipeline.
    Run,
    /// One discovery pass.
    Discover,
    /// One snapshot capture pass.
    Snapshot,
    /// Compute profiles for a date (YYYY-MM-DD, default today).
    Profile {
        #[arg(long)]
        date: Option<String>,
    },
    /// One scoring pass for today.
    Score,
    /// Aggregate competition stats for today.
    CompetitionStats,
    /// One closing-odds capture pass.
    ClosingOdds,
    /// One settlement capture pass.
    Settle,
    /// One event-results pass (including the correct-score enhancement).
    Results,
    /// Print the current phase and its inputs.
    Phase,
    /// Check exchange connectivity.
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let db = Database::open(&settings.database_path)?;
    db.seed_default_hypotheses()?;

    let auth = Arc::new(SessionManager::new(
        &settings,
        Arc::new(MemoryTokenStore::default()),
    ));
    let limiter = Arc::new(RateLimiter::default());
    let client = Arc::new(ExchangeClient::new(auth, limiter));

    let scoring_config = ScoringConfig::default();
    let shadow_config = ShadowTradingConfig::default();

    match cli.command {
        Command::Run => {
            info!(disclaimer = PAPER_TRADING_DISCLAIMER, "starting_pipeline");
            let scheduler = Arc::new(Scheduler::new(
                db,
                client,
                &settings,
                scoring_config,
                shadow_config,
            )?);
            scheduler.run().await?;
        }
        Command::Discover => {
            let service = DiscoveryService::new(client, db, &settings);
            let stats = service.discover_all().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Snapshot => {
            let service = SnapshotService::new(
                client,
                db,
                settings.ladder_depth,
                settings.snapshot_batch_size,
            );
            let stats = service.capture_snapshots().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Profile { date } => {
            let date = match date {
                Some(s) => chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")?,
                None => chrono::Utc::now().date_naive(),
            };
            let stats = ProfilingService::new(db).compute_profiles_for_date(date)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Score => {
            let service = ScoringService::new(db, scoring_config)?;
            let stats = service.score_markets(chrono::Utc::now().date_naive())?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::CompetitionStats => {
            let stats = CompetitionStatsService::new(db)
                .aggregate_for_date(chrono::Utc::now().date_naive())?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::ClosingOdds => {
            let stats = ClosingService::new(client, db).capture_closing_data()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Settle => {
            let stats = ClosingService::new(client, db).capture_settlements().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Results => {
            let service = ResultsService::new(db);
            let captured = service.capture_event_results()?;
            let updated = service.update_results_from_correct_score()?;
            println!("{}", serde_json::to_string_pretty(&captured)?);
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }
        Command::Phase => {
            let readings = ridgeradar::shadow::read_phase_inputs(&db)?;
            let phase = current_phase(&db, &shadow_config)?;
            println!("phase: {}", phase.as_str());
            println!("{}", serde_json::to_string_pretty(&readings)?);
            println!("{PAPER_TRADING_DISCLAIMER}");
        }
        Command::Health => {
            let healthy = client.health_check().await;
            println!("exchange: {}", if healthy { "ok" } else { "unreachable" });
            if !healthy {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
