//! Closing capture: the last pre-start ladder and score per market, and the
//! settlement outcome once the exchange closes the book.
//!
//! The pre-start capture is the benchmark everything downstream leans on:
//! closing odds are the fair-price reference for CLV, the final score shows
//! what the system believed just before kickoff.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::exchange::ExchangeClient;
use crate::models::{
    ClosingOdds, ClosingRunnerOdds, RunnerResult, RunnerStatus, SettlementResult,
};
use crate::storage::{ClosingCapture, Database};

/// How far ahead of kickoff the capture window opens.
const CAPTURE_WINDOW_MINUTES: i64 = 15;
/// Settlement is attempted for events started between these bounds ago.
const SETTLE_MIN_AGE_HOURS: i64 = 2;
const SETTLE_MAX_AGE_HOURS: i64 = 48;
const SETTLE_BATCH_SIZE: usize = 5;

#[derive(Debug, Default, Serialize)]
pub struct ClosingStats {
    pub markets_checked: usize,
    pub closing_odds_captured: usize,
    pub final_scores_captured: usize,
    pub already_captured: usize,
    pub errors: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct SettlementCaptureStats {
    pub markets_checked: usize,
    pub settled: usize,
    pub voided: usize,
    pub not_closed_yet: usize,
    pub batches_failed: usize,
}

pub struct ClosingService {
    client: Arc<ExchangeClient>,
    db: Database,
}

impl ClosingService {
    pub fn new(client: Arc<ExchangeClient>, db: Database) -> Self {
        Self { client, db }
    }

    /// Capture closing odds and the latest score for markets whose event
    /// starts within the next fifteen minutes.
    pub fn capture_closing_data(&self) -> anyhow::Result<ClosingStats> {
        let mut stats = ClosingStats::default();
        let now = Utc::now();
        let window_end = now + Duration::minutes(CAPTURE_WINDOW_MINUTES);

        let markets = self.db.markets_starting_between(now, window_end)?;
        stats.markets_checked = markets.len();

        for (market, event) in markets {
            let minutes_to_start =
                ((event.scheduled_start - now).num_seconds() / 60).max(0);

            // Preserve the freshest capture: once a closer-to-kickoff row
            // exists, an earlier capture must not overwrite it.
            if let Some(existing) = self.db.closing_data(market.id)? {
                if let Some(existing_minutes) = existing.minutes_to_start {
                    if existing_minutes <= minutes_to_start {
                        stats.already_captured += 1;
                        continue;
                    }
                }
            }

            let Some(snapshot) = self.db.latest_snapshot(market.id)? else {
                continue;
            };

            let runner_names: HashMap<i64, String> = self
                .db
                .runners_for_market(market.id)?
                .into_iter()
                .map(|r| (r.selection_id, r.name))
                .collect();

            let closing_odds = ClosingOdds {
                captured_at: snapshot.captured_at,
                total_matched: snapshot.total_matched,
                runners: snapshot
                    .ladder
                    .runners
                    .iter()
                    .map(|r| ClosingRunnerOdds {
                        runner_id: r.runner_id,
                        name: runner_names
                            .get(&r.runner_id)
                            .cloned()
                            .unwrap_or_else(|| format!("Runner {}", r.runner_id)),
                        back_price: r.back.first().map(|l| l.price),
                        lay_price: r.lay.first().map(|l| l.price),
                        last_traded: r.last_traded,
                        total_matched: r.total_matched,
                    })
                    .collect(),
            };

            let latest_score = self.db.latest_score(market.id)?;
            let (final_score_id, final_score, score_captured_at) = match &latest_score {
                Some(score) => (Some(score.id), Some(score.total_score), Some(score.scored_at)),
                None => (None, None, None),
            };

            self.db.upsert_closing_capture(&ClosingCapture {
                market_id: market.id,
                closing_snapshot_id: snapshot.id,
                closing_odds: &closing_odds,
                odds_captured_at: snapshot.captured_at,
                minutes_to_start,
                final_score_id,
                final_score,
                score_captured_at,
            })?;

            stats.closing_odds_captured += 1;
            if final_score.is_some() {
                stats.final_scores_captured += 1;
            }
            debug!(
                market_id = market.id,
                minutes_to_start,
                runners = closing_odds.runners.len(),
                "closing_odds_captured"
            );
        }

        info!(
            checked = stats.markets_checked,
            captured = stats.closing_odds_captured,
            scores = stats.final_scores_captured,
            skipped = stats.already_captured,
            "closing_capture_complete"
        );
        Ok(stats)
    }

    /// Settle captured markets whose events finished: query the book in
    /// small batches, and for each CLOSED book record the winner (or a void
    /// when every runner was removed). Runner statuses are written back so
    /// the shadow settler and results capture can read outcomes locally.
    pub async fn capture_settlements(&self) -> anyhow::Result<SettlementCaptureStats> {
        let mut stats = SettlementCaptureStats::default();
        let now = Utc::now();
        let unsettled = self.db.unsettled_closings(
            now - Duration::hours(SETTLE_MAX_AGE_HOURS),
            now - Duration::hours(SETTLE_MIN_AGE_HOURS),
            100,
        )?;
        stats.markets_checked = unsettled.len();
        if unsettled.is_empty() {
            return Ok(stats);
        }

        for batch in unsettled.chunks(SETTLE_BATCH_SIZE) {
            let ids: Vec<String> = batch.iter().map(|c| c.market_exchange_id.clone()).collect();
            let books = match self.client.list_market_book(&ids, 1).await {
                Ok(books) => books,
                Err(e) => {
                    warn!(error = %e, batch_size = ids.len(), "settlement_batch_failed");
                    stats.batches_failed += 1;
                    continue;
                }
            };

            let by_exchange_id: HashMap<&str, &crate::storage::UnsettledClosing> = batch
                .iter()
                .map(|c| (c.market_exchange_id.as_str(), c))
                .collect();

            for book in books {
                let Some(closing) = by_exchange_id.get(book.market_id.as_str()) else {
                    continue;
                };
                if book.status != "CLOSED" {
                    stats.not_closed_yet += 1;
                    continue;
                }

                let runner_names: HashMap<i64, String> = self
                    .db
                    .runners_for_market(closing.market_id)?
                    .into_iter()
                    .map(|r| (r.selection_id, r.name))
                    .collect();

                let mut winner: Option<(i64, String)> = None;
                let mut all_removed = !book.runners.is_empty();
                let mut runner_results = Vec::with_capacity(book.runners.len());

                for runner in &book.runners {
                    let status = RunnerStatus::parse(&runner.status);
                    self.db
                        .set_runner_status(closing.market_id, runner.selection_id, status)?;

                    let name = runner_names
                        .get(&runner.selection_id)
                        .cloned()
                        .unwrap_or_else(|| format!("Runner {}", runner.selection_id));
                    if status == RunnerStatus::Winner {
                        winner = Some((runner.selection_id, name.clone()));
                    }
                    if !matches!(status, RunnerStatus::Removed | RunnerStatus::RemovedVacant) {
                        all_removed = false;
                    }
                    runner_results.push(RunnerResult {
                        runner_id: runner.selection_id,
                        name,
                        status: runner.status.clone(),
                    });
                }

                let result = if all_removed {
                    stats.voided += 1;
                    SettlementResult {
                        winner_runner_id: None,
                        winner_name: None,
                        void: true,
                        runners: runner_results,
                    }
                } else if let Some((id, name)) = winner {
                    stats.settled += 1;
                    SettlementResult {
                        winner_runner_id: Some(id),
                        winner_name: Some(name),
                        void: false,
                        runners: runner_results,
                    }
                } else {
                    // Closed but no winner reported yet; try again next run.
                    stats.not_closed_yet += 1;
                    continue;
                };

                self.db
                    .set_closing_settlement(closing.closing_id, &result, Utc::now())?;
            }
        }

        info!(
            checked = stats.markets_checked,
            settled = stats.settled,
            voided = stats.voided,
            pending = stats.not_closed_yet,
            failed_batches = stats.batches_failed,
            "settlement_capture_complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LadderData, PriceLevel, RunnerLadder};

    fn seed(db: &Database, start_offset_minutes: i64) -> (i64, i64) {
        let sport = db.upsert_sport("1", "Soccer", true).unwrap();
        let comp = db.upsert_competition("c", sport, "Liga", None, true, "active").unwrap();
        let event = db
            .upsert_event(
                "e",
                comp,
                "A v B",
                Utc::now() + Duration::minutes(start_offset_minutes),
            )
            .unwrap();
        let market = db.upsert_market("1.1", event, "MO", "MATCH_ODDS", 0.0).unwrap();
        db.upsert_runner(101, market, "A", Some(1)).unwrap();
        (event, market)
    }

    fn store_snapshot(db: &Database, market: i64, minutes_ago: i64) -> i64 {
        let ladder = LadderData {
            runners: vec![RunnerLadder {
                runner_id: 101,
                last_traded: Some(2.46),
                total_matched: 900.0,
                back: vec![PriceLevel { price: 2.44, size: 320.0 }],
                lay: vec![PriceLevel { price: 2.54, size: 280.0 }],
            }],
            overround: 0.41,
            total_available: 600.0,
        };
        db.insert_snapshot(
            market,
            Utc::now() - Duration::minutes(minutes_ago),
            12_000.0,
            600.0,
            0.41,
            &ladder,
        )
        .unwrap()
        .unwrap()
    }

    fn service(db: &Database) -> ClosingService {
        let settings = crate::config::Settings {
            database_path: ":memory:".into(),
            exchange_app_key: String::new(),
            exchange_username: String::new(),
            exchange_password: String::new(),
            exchange_cert_path: None,
            exchange_cert_key_path: None,
            enabled_sports: vec![],
            enabled_market_types: vec![],
            lookahead_hours: 72,
            ladder_depth: 3,
            snapshot_batch_size: 5,
            snapshot_interval_secs: 300,
        };
        let auth = Arc::new(crate::exchange::SessionManager::new(
            &settings,
            Arc::new(crate::exchange::MemoryTokenStore::default()),
        ));
        let limiter = Arc::new(crate::exchange::RateLimiter::default());
        ClosingService::new(Arc::new(ExchangeClient::new(auth, limiter)), db.clone())
    }

    #[test]
    fn captures_market_inside_window_with_names_and_score() {
        let db = Database::open_in_memory().unwrap();
        let (_, market) = seed(&db, 10);
        store_snapshot(&db, market, 2);

        let stats = service(&db).capture_closing_data().unwrap();
        assert_eq!(stats.closing_odds_captured, 1);

        let closing = db.closing_data(market).unwrap().unwrap();
        let odds = closing.closing_odds.unwrap();
        assert_eq!(odds.runners.len(), 1);
        assert_eq!(odds.runners[0].name, "A");
        assert_eq!(odds.runners[0].back_price, Some(2.44));
        assert!(closing.minutes_to_start.unwrap() <= 10);
    }

    #[test]
    fn fresher_capture_wins_staler_is_skipped() {
        let db = Database::open_in_memory().unwrap();
        let (_, market) = seed(&db, 8);
        let snap = store_snapshot(&db, market, 2);

        // Pre-existing capture closer to kickoff than we are now.
        let odds = ClosingOdds {
            captured_at: Utc::now(),
            total_matched: 1.0,
            runners: vec![],
        };
        db.upsert_closing_capture(&ClosingCapture {
            market_id: market,
            closing_snapshot_id: snap,
            closing_odds: &odds,
            odds_captured_at: Utc::now(),
            minutes_to_start: 3,
            final_score_id: None,
            final_score: None,
            score_captured_at: None,
        })
        .unwrap();

        let stats = service(&db).capture_closing_data().unwrap();
        assert_eq!(stats.already_captured, 1);
        assert_eq!(stats.closing_odds_captured, 0);
        let closing = db.closing_data(market).unwrap().unwrap();
        assert_eq!(closing.minutes_to_start, Some(3));
    }

    #[test]
    fn markets_outside_window_are_not_touched() {
        let db = Database::open_in_memory().unwrap();
        let (_, market) = seed(&db, 120);
        store_snapshot(&db, market, 2);

        let stats = service(&db).capture_closing_data().unwrap();
        assert_eq!(stats.markets_checked, 0);
        assert!(db.closing_data(market).unwrap().is_none());
    }
}
