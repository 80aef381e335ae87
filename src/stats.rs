//! Competition statistics: learn which competitions consistently produce
//! high-scoring markets instead of pre-judging them by name.

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::{debug, info};

use crate::storage::{CompetitionDayStats, CompetitionRanking, Database};

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Default, Serialize)]
pub struct CompetitionStatsStats {
    pub competitions_processed: usize,
    pub competitions_with_scores: usize,
    pub total_markets_scored: usize,
}

pub struct CompetitionStatsService {
    db: Database,
}

impl CompetitionStatsService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Aggregate the day's scores per enabled competition and refresh the
    /// rolling 30-day mean (simple average of the trailing-window mean and
    /// today's mean).
    pub fn aggregate_for_date(&self, date: NaiveDate) -> anyhow::Result<CompetitionStatsStats> {
        let mut stats = CompetitionStatsStats::default();

        for competition in self.db.enabled_competitions()? {
            stats.competitions_processed += 1;

            let scores = self.db.scores_for_competition_on(competition.id, date)?;
            if scores.is_empty() {
                continue;
            }
            stats.competitions_with_scores += 1;
            stats.total_markets_scored += scores.len();

            let values: Vec<f64> = scores.iter().map(|s| s.total_score).collect();
            let avg = mean(&values);
            let max = values.iter().cloned().fold(f64::MIN, f64::max);
            let min = values.iter().cloned().fold(f64::MAX, f64::min);

            let rolling = match self.db.avg_score_between(
                competition.id,
                date - Duration::days(30),
                date,
            )? {
                Some(prior) => (prior + avg) / 2.0,
                None => avg,
            };

            self.db.upsert_competition_stats(
                competition.id,
                date,
                &CompetitionDayStats {
                    markets_scored: scores.len() as i64,
                    avg_score: round2(avg),
                    max_score: round2(max),
                    min_score: round2(min),
                    score_std_dev: round2(stdev(&values)),
                    markets_above_40: values.iter().filter(|v| **v >= 40.0).count() as i64,
                    markets_above_55: values.iter().filter(|v| **v >= 55.0).count() as i64,
                    markets_above_70: values.iter().filter(|v| **v >= 70.0).count() as i64,
                    rolling_30d_avg_score: round2(rolling),
                },
            )?;

            debug!(
                competition = %competition.name,
                markets = scores.len(),
                avg_score = round2(avg),
                rolling_30d = round2(rolling),
                "competition_stats_calculated"
            );
        }

        info!(
            date = %date,
            processed = stats.competitions_processed,
            with_scores = stats.competitions_with_scores,
            markets = stats.total_markets_scored,
            "competition_stats_complete"
        );
        Ok(stats)
    }

    /// Competitions ranked by mean score over the trailing window.
    pub fn rankings(&self, days: i64, min_markets: i64) -> anyhow::Result<Vec<CompetitionRanking>> {
        let since = chrono::Utc::now().date_naive() - Duration::days(days);
        self.db.competition_rankings(since, min_markets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewScore;
    use chrono::Utc;

    fn insert_score(db: &Database, market: i64, total: f64) {
        db.insert_score(&NewScore {
            market_id: market,
            scored_at: Utc::now(),
            time_bucket: "6-24h",
            odds_band: "Even",
            spread_score: 0.0,
            volatility_score: 0.0,
            update_score: 0.0,
            depth_score: 0.0,
            volume_penalty: 0.0,
            total_score: total,
            guards_failed: &[],
            config_version_id: None,
        })
        .unwrap();
    }

    #[test]
    fn aggregates_thresholds_and_rolling_mean() {
        let db = Database::open_in_memory().unwrap();
        let sport = db.upsert_sport("1", "Soccer", true).unwrap();
        let comp = db.upsert_competition("c", sport, "Liga", None, true, "active").unwrap();
        let event = db
            .upsert_event("e", comp, "A v B", Utc::now() + Duration::hours(8))
            .unwrap();
        let market = db.upsert_market("1.1", event, "MO", "MATCH_ODDS", 0.0).unwrap();

        for total in [35.0, 45.0, 60.0, 75.0] {
            insert_score(&db, market, total);
        }

        let today = Utc::now().date_naive();
        // A prior day in the window so the rolling mean combines two halves.
        db.upsert_competition_stats(
            comp,
            today - Duration::days(1),
            &CompetitionDayStats {
                markets_scored: 4,
                avg_score: 40.0,
                max_score: 60.0,
                min_score: 20.0,
                score_std_dev: 10.0,
                markets_above_40: 2,
                markets_above_55: 1,
                markets_above_70: 0,
                rolling_30d_avg_score: 40.0,
            },
        )
        .unwrap();

        let service = CompetitionStatsService::new(db.clone());
        let stats = service.aggregate_for_date(today).unwrap();
        assert_eq!(stats.competitions_with_scores, 1);
        assert_eq!(stats.total_markets_scored, 4);

        let row = db.competition_stats(comp, today).unwrap().unwrap();
        assert_eq!(row.markets_scored, 4);
        assert!((row.avg_score - 53.75).abs() < 1e-9);
        assert_eq!(row.markets_above_40, 3);
        assert_eq!(row.markets_above_55, 2);
        assert_eq!(row.markets_above_70, 1);
        // Rolling: (40.0 + 53.75) / 2.
        assert!((row.rolling_30d_avg_score - 46.88).abs() < 0.01);
    }

    #[test]
    fn competitions_without_scores_get_no_row() {
        let db = Database::open_in_memory().unwrap();
        let sport = db.upsert_sport("1", "Soccer", true).unwrap();
        let comp = db.upsert_competition("c", sport, "Liga", None, true, "active").unwrap();

        let service = CompetitionStatsService::new(db.clone());
        let today = Utc::now().date_naive();
        let stats = service.aggregate_for_date(today).unwrap();
        assert_eq!(stats.competitions_processed, 1);
        assert_eq!(stats.competitions_with_scores, 0);
        assert!(db.competition_stats(comp, today).unwrap().is_none());
    }
}
