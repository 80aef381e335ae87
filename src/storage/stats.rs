//! Competition stats storage: daily aggregates and the rolling mean input.

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

use super::{fmt_date, fmt_ts, parse_date, Database};
use crate::models::CompetitionStatsRow;

pub struct CompetitionDayStats {
    pub markets_scored: i64,
    pub avg_score: f64,
    pub max_score: f64,
    pub min_score: f64,
    pub score_std_dev: f64,
    pub markets_above_40: i64,
    pub markets_above_55: i64,
    pub markets_above_70: i64,
    pub rolling_30d_avg_score: f64,
}

/// One row of the trailing-window competition ranking.
#[derive(Debug, Clone)]
pub struct CompetitionRanking {
    pub competition_id: i64,
    pub name: String,
    pub country_code: Option<String>,
    pub total_markets: i64,
    pub avg_score: f64,
    pub max_score: f64,
    pub markets_above_55: i64,
    pub markets_above_70: i64,
}

impl Database {
    pub fn upsert_competition_stats(
        &self,
        competition_id: i64,
        stats_date: NaiveDate,
        stats: &CompetitionDayStats,
    ) -> Result<()> {
        let conn = self.conn();
        let now = fmt_ts(chrono::Utc::now());
        conn.execute(
            "INSERT INTO competition_stats
                (competition_id, stats_date, markets_scored, avg_score, max_score, min_score,
                 score_std_dev, markets_above_40, markets_above_55, markets_above_70,
                 rolling_30d_avg_score, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT(competition_id, stats_date) DO UPDATE SET
                markets_scored = excluded.markets_scored,
                avg_score = excluded.avg_score,
                max_score = excluded.max_score,
                min_score = excluded.min_score,
                score_std_dev = excluded.score_std_dev,
                markets_above_40 = excluded.markets_above_40,
                markets_above_55 = excluded.markets_above_55,
                markets_above_70 = excluded.markets_above_70,
                rolling_30d_avg_score = excluded.rolling_30d_avg_score,
                updated_at = excluded.updated_at",
            params![
                competition_id,
                fmt_date(stats_date),
                stats.markets_scored,
                stats.avg_score,
                stats.max_score,
                stats.min_score,
                stats.score_std_dev,
                stats.markets_above_40,
                stats.markets_above_55,
                stats.markets_above_70,
                stats.rolling_30d_avg_score,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn competition_stats(
        &self,
        competition_id: i64,
        stats_date: NaiveDate,
    ) -> Result<Option<CompetitionStatsRow>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, competition_id, stats_date, markets_scored, avg_score, max_score,
                        min_score, score_std_dev, markets_above_40, markets_above_55,
                        markets_above_70, rolling_30d_avg_score
                 FROM competition_stats
                 WHERE competition_id = ?1 AND stats_date = ?2",
                params![competition_id, fmt_date(stats_date)],
                |row| {
                    Ok(CompetitionStatsRow {
                        id: row.get(0)?,
                        competition_id: row.get(1)?,
                        stats_date: parse_date(&row.get::<_, String>(2)?),
                        markets_scored: row.get(3)?,
                        avg_score: row.get(4)?,
                        max_score: row.get(5)?,
                        min_score: row.get(6)?,
                        score_std_dev: row.get(7)?,
                        markets_above_40: row.get(8)?,
                        markets_above_55: row.get(9)?,
                        markets_above_70: row.get(10)?,
                        rolling_30d_avg_score: row.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Mean of stored daily averages inside [from, to), the prior-window half
    /// of the rolling 30-day figure.
    pub fn avg_score_between(
        &self,
        competition_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Option<f64>> {
        let conn = self.conn();
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(avg_score) FROM competition_stats
             WHERE competition_id = ?1 AND stats_date >= ?2 AND stats_date < ?3",
            params![competition_id, fmt_date(from), fmt_date(to)],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    /// Competitions ranked by mean score over a trailing window, requiring a
    /// minimum number of scored markets to qualify.
    pub fn competition_rankings(
        &self,
        since: NaiveDate,
        min_markets: i64,
    ) -> Result<Vec<CompetitionRanking>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, c.country_code,
                    SUM(s.markets_scored), AVG(s.avg_score), MAX(s.max_score),
                    SUM(s.markets_above_55), SUM(s.markets_above_70)
             FROM competitions c
             JOIN competition_stats s ON s.competition_id = c.id
             WHERE c.enabled = 1 AND s.stats_date >= ?1
             GROUP BY c.id, c.name, c.country_code
             HAVING SUM(s.markets_scored) >= ?2
             ORDER BY AVG(s.avg_score) DESC",
        )?;
        let rows = stmt
            .query_map(params![fmt_date(since), min_markets], |row| {
                Ok(CompetitionRanking {
                    competition_id: row.get(0)?,
                    name: row.get(1)?,
                    country_code: row.get(2)?,
                    total_markets: row.get(3)?,
                    avg_score: row.get(4)?,
                    max_score: row.get(5)?,
                    markets_above_55: row.get(6)?,
                    markets_above_70: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day_stats(avg: f64, scored: i64) -> CompetitionDayStats {
        CompetitionDayStats {
            markets_scored: scored,
            avg_score: avg,
            max_score: avg + 10.0,
            min_score: avg - 10.0,
            score_std_dev: 5.0,
            markets_above_40: scored / 2,
            markets_above_55: scored / 4,
            markets_above_70: 0,
            rolling_30d_avg_score: avg,
        }
    }

    #[test]
    fn stats_upsert_by_day() {
        let db = Database::open_in_memory().unwrap();
        let sport = db.upsert_sport("1", "Soccer", true).unwrap();
        let comp = db.upsert_competition("c", sport, "Liga", None, true, "active").unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 7, 30).unwrap();

        db.upsert_competition_stats(comp, day, &day_stats(45.0, 8)).unwrap();
        db.upsert_competition_stats(comp, day, &day_stats(50.0, 10)).unwrap();

        let row = db.competition_stats(comp, day).unwrap().unwrap();
        assert_eq!(row.avg_score, 50.0);
        assert_eq!(row.markets_scored, 10);
    }

    #[test]
    fn rolling_window_average_excludes_target_day() {
        let db = Database::open_in_memory().unwrap();
        let sport = db.upsert_sport("1", "Soccer", true).unwrap();
        let comp = db.upsert_competition("c", sport, "Liga", None, true, "active").unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 7, 30).unwrap();

        db.upsert_competition_stats(comp, today - chrono::Duration::days(2), &day_stats(40.0, 5))
            .unwrap();
        db.upsert_competition_stats(comp, today - chrono::Duration::days(1), &day_stats(60.0, 5))
            .unwrap();
        db.upsert_competition_stats(comp, today, &day_stats(99.0, 5)).unwrap();

        let avg = db
            .avg_score_between(comp, today - chrono::Duration::days(30), today)
            .unwrap()
            .unwrap();
        assert!((avg - 50.0).abs() < 1e-9);
    }

    #[test]
    fn rankings_require_min_markets() {
        let db = Database::open_in_memory().unwrap();
        let sport = db.upsert_sport("1", "Soccer", true).unwrap();
        let a = db.upsert_competition("a", sport, "Liga A", None, true, "active").unwrap();
        let b = db.upsert_competition("b", sport, "Liga B", None, true, "active").unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 7, 30).unwrap();

        db.upsert_competition_stats(a, day, &day_stats(55.0, 20)).unwrap();
        db.upsert_competition_stats(b, day, &day_stats(70.0, 2)).unwrap();

        let rankings = db
            .competition_rankings(day - chrono::Duration::days(30), 10)
            .unwrap();
        assert_eq!(rankings.len(), 1);
        assert_eq!(rankings[0].competition_id, a);
    }
}
