//! Event results: post-event outcomes per event.
//!
//! Scores are first guessed from the match-odds winner (best effort, the
//! settlement data only says who won), then corrected by parsing the
//! settled CORRECT_SCORE runner name when that market exists. The corrected
//! row switches `source` so downstream consumers can tell the difference.

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::RunnerStatus;
use crate::storage::Database;

const RESULTS_WINDOW_HOURS: i64 = 48;
const RESULTS_MIN_AGE_HOURS: i64 = 2;

#[derive(Debug, Default, Serialize)]
pub struct ResultsStats {
    pub events_checked: usize,
    pub results_captured: usize,
    pub no_settlement: usize,
    pub errors: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct ScoreUpdateStats {
    pub results_checked: usize,
    pub results_updated: usize,
    pub no_correct_score: usize,
    pub errors: usize,
}

pub struct ResultsService {
    db: Database,
}

impl ResultsService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record results for events that finished recently and have none yet.
    /// The winner of the match-odds market decides the heuristic scoreline:
    /// home win 2-1, away win 1-2, draw 1-1.
    pub fn capture_event_results(&self) -> anyhow::Result<ResultsStats> {
        let mut stats = ResultsStats::default();
        let now = Utc::now();
        let events = self.db.events_without_results(
            now - Duration::hours(RESULTS_WINDOW_HOURS),
            now - Duration::hours(RESULTS_MIN_AGE_HOURS),
            100,
        )?;
        stats.events_checked = events.len();

        for event in events {
            let Some(market) = self.db.market_of_type_for_event(event.id, "MATCH_ODDS")? else {
                stats.no_settlement += 1;
                continue;
            };

            let runners = self.db.runners_for_market(market.id)?;
            let winner = runners.iter().find(|r| r.status == RunnerStatus::Winner);
            let Some(winner) = winner else {
                stats.no_settlement += 1;
                continue;
            };

            // Identify home/away/draw by position: the draw is named, the
            // first remaining runner is home, the next away.
            let draw = runners
                .iter()
                .find(|r| r.name.to_lowercase().contains("draw"));
            let mut sides = runners
                .iter()
                .filter(|r| draw.map(|d| d.id != r.id).unwrap_or(true));
            let home = sides.next();
            let away = sides.next();

            let (home_score, away_score) = if draw.map(|d| d.id) == Some(winner.id) {
                (Some(1), Some(1))
            } else if home.map(|h| h.id) == Some(winner.id) {
                (Some(2), Some(1))
            } else if away.map(|a| a.id) == Some(winner.id) {
                (Some(1), Some(2))
            } else {
                (None, None)
            };

            self.db
                .insert_event_result(event.id, home_score, away_score, "exchange")?;
            stats.results_captured += 1;
            debug!(
                event_id = event.id,
                winner = %winner.name,
                home = ?home_score,
                away = ?away_score,
                "event_result_captured"
            );
        }

        info!(
            checked = stats.events_checked,
            captured = stats.results_captured,
            unsettled = stats.no_settlement,
            "event_results_complete"
        );
        Ok(stats)
    }

    /// Replace heuristic scorelines with exact ones parsed from the settled
    /// CORRECT_SCORE runner ("2 - 1").
    pub fn update_results_from_correct_score(&self) -> anyhow::Result<ScoreUpdateStats> {
        let mut stats = ScoreUpdateStats::default();
        let heuristic = self.db.heuristic_results(50)?;
        stats.results_checked = heuristic.len();

        for (result_id, event_id) in heuristic {
            let Some(market) = self.db.market_of_type_for_event(event_id, "CORRECT_SCORE")? else {
                stats.no_correct_score += 1;
                continue;
            };
            let winner = self
                .db
                .runners_for_market(market.id)?
                .into_iter()
                .find(|r| r.status == RunnerStatus::Winner);
            let Some(winner) = winner else {
                stats.no_correct_score += 1;
                continue;
            };

            match parse_scoreline(&winner.name) {
                Some((home, away)) => {
                    self.db
                        .update_event_result_scores(result_id, home, away, "correct_score")?;
                    stats.results_updated += 1;
                    debug!(event_id, score = %winner.name, "result_updated_from_correct_score");
                }
                None => {
                    warn!(event_id, runner = %winner.name, "unparseable_correct_score_runner");
                    stats.errors += 1;
                }
            }
        }

        info!(
            checked = stats.results_checked,
            updated = stats.results_updated,
            missing = stats.no_correct_score,
            "results_score_update_complete"
        );
        Ok(stats)
    }
}

/// Parse "2 - 1" style runner names. "Any Other Home Win" and friends don't
/// parse, which is correct: they carry no exact scoreline.
fn parse_scoreline(name: &str) -> Option<(i64, i64)> {
    let mut parts = name.split('-');
    let home = parts.next()?.trim().parse().ok()?;
    let away = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((home, away))
}
