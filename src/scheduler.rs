//! Periodic task driver.
//!
//! One tokio loop per task, each run wrapped in a JobRun audit row
//! (running -> success/failed) and a hard time limit. Interval tasks drift
//! with execution time; hour-anchored tasks (profiling, stats, phase check)
//! fire at a fixed minute past each hour. All tasks are idempotent, so an
//! overlapping or retried run converges instead of duplicating rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use parking_lot::RwLock;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::closing::ClosingService;
use crate::config::{ScoringConfig, Settings, ShadowTradingConfig};
use crate::ingestion::{DiscoveryService, SnapshotService};
use crate::models::{JobStatus, TradingPhase};
use crate::profiling::ProfilingService;
use crate::results::ResultsService;
use crate::scoring::ScoringService;
use crate::shadow::{current_phase, HypothesisEngine, ShadowSettler};
use crate::stats::CompetitionStatsService;
use crate::storage::Database;

// Default cadences, in seconds unless anchored to a wall-clock minute.
const DISCOVERY_INTERVAL: u64 = 900;
const SCORE_INTERVAL: u64 = 300;
const CLOSING_ODDS_INTERVAL: u64 = 120;
const SETTLEMENT_INTERVAL: u64 = 900;
const EVENT_RESULTS_INTERVAL: u64 = 1800;
const SHADOW_DECISIONS_INTERVAL: u64 = 120;
const CLOSING_MIDS_INTERVAL: u64 = 120;
const SHADOW_SETTLEMENT_INTERVAL: u64 = 900;

const PROFILE_MINUTE: u32 = 5;
const STATS_MINUTE: u32 = 30;
const PHASE_MINUTE: u32 = 0;
const RESULTS_ENHANCE_MINUTE: u32 = 45;

/// Hard per-run limit; a run that exceeds it is aborted and its JobRun
/// marked failed.
const HARD_TIME_LIMIT: Duration = Duration::from_secs(600);

pub struct Scheduler {
    db: Database,
    discovery: Arc<DiscoveryService>,
    snapshots: Arc<SnapshotService>,
    profiling: Arc<ProfilingService>,
    scoring: Arc<ScoringService>,
    stats: Arc<CompetitionStatsService>,
    closing: Arc<ClosingService>,
    results: Arc<ResultsService>,
    hypothesis: Arc<HypothesisEngine>,
    settler: Arc<ShadowSettler>,
    shadow_config: ShadowTradingConfig,
    snapshot_interval: u64,
    phase: Arc<RwLock<TradingPhase>>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        client: Arc<crate::exchange::ExchangeClient>,
        settings: &Settings,
        scoring_config: ScoringConfig,
        shadow_config: ShadowTradingConfig,
    ) -> anyhow::Result<Self> {
        let scoring = ScoringService::new(db.clone(), scoring_config)?;
        Ok(Self {
            discovery: Arc::new(DiscoveryService::new(client.clone(), db.clone(), settings)),
            snapshots: Arc::new(SnapshotService::new(
                client.clone(),
                db.clone(),
                settings.ladder_depth,
                settings.snapshot_batch_size,
            )),
            profiling: Arc::new(ProfilingService::new(db.clone())),
            scoring: Arc::new(scoring),
            stats: Arc::new(CompetitionStatsService::new(db.clone())),
            closing: Arc::new(ClosingService::new(client, db.clone())),
            results: Arc::new(ResultsService::new(db.clone())),
            hypothesis: Arc::new(HypothesisEngine::new(db.clone(), shadow_config.clone())),
            settler: Arc::new(ShadowSettler::new(
                db.clone(),
                shadow_config.stake.commission_rate,
            )),
            shadow_config,
            snapshot_interval: settings.snapshot_interval_secs,
            phase: Arc::new(RwLock::new(TradingPhase::Phase1Collecting)),
            db,
        })
    }

    /// Run every periodic task until the process is stopped.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        // Anything still "running" from a previous process is an orphan.
        let orphaned = self
            .db
            .fail_orphaned_job_runs(Utc::now() - chrono::Duration::from_std(HARD_TIME_LIMIT)?)?;
        if orphaned > 0 {
            warn!(orphaned, "orphaned_job_runs_failed");
        }

        // Evaluate the phase once at startup so shadow tasks don't have to
        // wait for the first top-of-hour check.
        self.check_phase().await;

        let mut handles = Vec::new();

        handles.push(self.clone().spawn_interval("discover_markets", DISCOVERY_INTERVAL, |s| async move {
            let stats = s.discovery.discover_all().await?;
            Ok(((stats.markets + stats.events) as i64, serde_json::to_value(&stats)?))
        }));
        let snapshot_interval = self.snapshot_interval;
        handles.push(self.clone().spawn_interval("capture_snapshots", snapshot_interval, |s| async move {
            let stats = s.snapshots.capture_snapshots().await?;
            Ok((stats.snapshots_stored as i64, serde_json::to_value(&stats)?))
        }));
        handles.push(self.clone().spawn_hourly("compute_profiles", PROFILE_MINUTE, |s| async move {
            let stats = s.profiling.compute_profiles_for_date(Utc::now().date_naive())?;
            Ok((stats.profiles_created as i64, serde_json::to_value(&stats)?))
        }));
        handles.push(self.clone().spawn_interval("score_markets", SCORE_INTERVAL, |s| async move {
            let stats = s.scoring.score_markets(Utc::now().date_naive())?;
            Ok((stats.scores_created as i64, serde_json::to_value(&stats)?))
        }));
        handles.push(self.clone().spawn_hourly("aggregate_competition_stats", STATS_MINUTE, |s| async move {
            let stats = s.stats.aggregate_for_date(Utc::now().date_naive())?;
            Ok((stats.competitions_with_scores as i64, serde_json::to_value(&stats)?))
        }));
        handles.push(self.clone().spawn_interval("capture_closing_data", CLOSING_ODDS_INTERVAL, |s| async move {
            let stats = s.closing.capture_closing_data()?;
            Ok((stats.closing_odds_captured as i64, serde_json::to_value(&stats)?))
        }));
        handles.push(self.clone().spawn_interval("capture_settlements", SETTLEMENT_INTERVAL, |s| async move {
            let stats = s.closing.capture_settlements().await?;
            Ok((stats.settled as i64, serde_json::to_value(&stats)?))
        }));
        handles.push(self.clone().spawn_interval("capture_event_results", EVENT_RESULTS_INTERVAL, |s| async move {
            let stats = s.results.capture_event_results()?;
            Ok((stats.results_captured as i64, serde_json::to_value(&stats)?))
        }));
        handles.push(self.clone().spawn_hourly("update_results_from_scores", RESULTS_ENHANCE_MINUTE, |s| async move {
            let stats = s.results.update_results_from_correct_score()?;
            Ok((stats.results_updated as i64, serde_json::to_value(&stats)?))
        }));
        handles.push(self.clone().spawn_hourly("check_phase", PHASE_MINUTE, |s| async move {
            s.check_phase().await;
            let phase = *s.phase.read();
            Ok((0, serde_json::json!({"phase": phase.as_str()})))
        }));
        handles.push(self.clone().spawn_interval("evaluate_hypotheses", SHADOW_DECISIONS_INTERVAL, |s| async move {
            if *s.phase.read() != TradingPhase::Phase2Shadow {
                return Ok((0, serde_json::json!({"skipped": "phase1_collecting"})));
            }
            let stats = s.hypothesis.evaluate_hypotheses()?;
            Ok((stats.decisions_created as i64, serde_json::to_value(&stats)?))
        }));
        handles.push(self.clone().spawn_interval("capture_closing_mids", CLOSING_MIDS_INTERVAL, |s| async move {
            if *s.phase.read() != TradingPhase::Phase2Shadow {
                return Ok((0, serde_json::json!({"skipped": "phase1_collecting"})));
            }
            let stats = s.settler.capture_closing_mids()?;
            Ok((stats.mids_captured as i64, serde_json::to_value(&stats)?))
        }));
        handles.push(self.clone().spawn_interval("settle_shadow_decisions", SHADOW_SETTLEMENT_INTERVAL, |s| async move {
            if *s.phase.read() != TradingPhase::Phase2Shadow {
                return Ok((0, serde_json::json!({"skipped": "phase1_collecting"})));
            }
            let stats = s.settler.settle_decisions()?;
            Ok(((stats.settled_wins + stats.settled_losses + stats.voided) as i64,
                serde_json::to_value(&stats)?))
        }));

        info!(tasks = handles.len(), "scheduler_started");
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Re-evaluate the phase and cache it for the shadow tasks.
    async fn check_phase(&self) {
        match current_phase(&self.db, &self.shadow_config) {
            Ok(phase) => {
                let mut cached = self.phase.write();
                if *cached != phase {
                    info!(from = cached.as_str(), to = phase.as_str(), "phase_transition");
                }
                *cached = phase;
            }
            Err(e) => error!(error = %e, "phase_check_failed"),
        }
    }

    fn spawn_interval<F, Fut>(
        self: Arc<Self>,
        name: &'static str,
        period_secs: u64,
        task: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<(i64, serde_json::Value)>> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(period_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.clone().run_once(name, &task).await;
            }
        })
    }

    fn spawn_hourly<F, Fut>(
        self: Arc<Self>,
        name: &'static str,
        minute: u32,
        task: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<(i64, serde_json::Value)>> + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                sleep(until_next_minute_mark(minute)).await;
                self.clone().run_once(name, &task).await;
            }
        })
    }

    /// Execute one task run under a JobRun audit row and the hard limit.
    async fn run_once<F, Fut>(self: Arc<Self>, name: &'static str, task: &F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = anyhow::Result<(i64, serde_json::Value)>> + Send,
    {
        let started_at = Utc::now();
        let job_id = match self.db.start_job_run(name, started_at) {
            Ok(id) => id,
            Err(e) => {
                error!(task = name, error = %e, "job_run_insert_failed");
                return;
            }
        };

        let outcome = timeout(HARD_TIME_LIMIT, task(self.clone())).await;
        let duration = (Utc::now() - started_at).num_milliseconds();

        let result = match outcome {
            Ok(Ok((records, mut metadata))) => {
                if let Some(map) = metadata.as_object_mut() {
                    map.insert("duration_ms".to_string(), serde_json::json!(duration));
                }
                self.db
                    .complete_job_run(job_id, JobStatus::Success, records, None, Some(&metadata))
            }
            Ok(Err(e)) => {
                error!(task = name, error = %e, "task_failed");
                self.db.complete_job_run(
                    job_id,
                    JobStatus::Failed,
                    0,
                    Some(&e.to_string()),
                    None,
                )
            }
            Err(_) => {
                error!(task = name, limit_secs = HARD_TIME_LIMIT.as_secs(), "task_hard_limit_exceeded");
                self.db.complete_job_run(
                    job_id,
                    JobStatus::Failed,
                    0,
                    Some("hard time limit exceeded"),
                    None,
                )
            }
        };
        if let Err(e) = result {
            error!(task = name, error = %e, "job_run_update_failed");
        }
    }
}

/// Duration until the next occurrence of `minute` past the hour.
fn until_next_minute_mark(minute: u32) -> Duration {
    let now = Utc::now();
    let current_minute = now.minute();
    let current_second = now.second();

    let minutes_ahead = if current_minute < minute {
        minute - current_minute
    } else {
        60 - current_minute + minute
    };
    let seconds = minutes_ahead as u64 * 60;
    Duration::from_secs(seconds.saturating_sub(current_second as u64).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_minute_mark_is_within_an_hour() {
        for minute in [0, 5, 30, 45] {
            let wait = until_next_minute_mark(minute);
            assert!(wait >= Duration::from_secs(1));
            assert!(wait <= Duration::from_secs(3600));
        }
    }
}
