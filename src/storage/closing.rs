//! Closing-data and event-result storage, plus the data-readiness counts the
//! phase gate reads.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{fmt_ts, parse_ts, Database};
use crate::models::{
    ClosingOdds, Event, EventResult, EventStatus, MarketClosingData, SettlementResult,
};

fn closing_from_row(row: &Row<'_>) -> rusqlite::Result<MarketClosingData> {
    let closing_odds: Option<String> = row.get(6)?;
    let result: Option<String> = row.get(10)?;
    Ok(MarketClosingData {
        id: row.get(0)?,
        market_id: row.get(1)?,
        final_score_id: row.get(2)?,
        final_score: row.get(3)?,
        score_captured_at: row.get::<_, Option<String>>(4)?.map(|s| parse_ts(&s)),
        closing_snapshot_id: row.get(5)?,
        closing_odds: closing_odds.and_then(|json| serde_json::from_str(&json).ok()),
        odds_captured_at: row.get::<_, Option<String>>(7)?.map(|s| parse_ts(&s)),
        minutes_to_start: row.get(8)?,
        settled_at: row.get::<_, Option<String>>(9)?.map(|s| parse_ts(&s)),
        result: result.and_then(|json| serde_json::from_str(&json).ok()),
    })
}

const CLOSING_COLS: &str = "id, market_id, final_score_id, final_score, score_captured_at, \
     closing_snapshot_id, closing_odds_json, odds_captured_at, minutes_to_start, settled_at, \
     result_json";

/// An unsettled closing row joined with the ids the settlement poller needs.
#[derive(Debug, Clone)]
pub struct UnsettledClosing {
    pub closing_id: i64,
    pub market_id: i64,
    pub market_exchange_id: String,
}

pub struct ClosingCapture<'a> {
    pub market_id: i64,
    pub closing_snapshot_id: i64,
    pub closing_odds: &'a ClosingOdds,
    pub odds_captured_at: DateTime<Utc>,
    pub minutes_to_start: i64,
    pub final_score_id: Option<i64>,
    pub final_score: Option<f64>,
    pub score_captured_at: Option<DateTime<Utc>>,
}

impl Database {
    pub fn closing_data(&self, market_id: i64) -> Result<Option<MarketClosingData>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {CLOSING_COLS} FROM market_closing_data WHERE market_id = ?1"),
                params![market_id],
                closing_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Write (or overwrite) the pre-start capture. Unique per market; the
    /// caller decides whether a fresher capture should replace an older one.
    pub fn upsert_closing_capture(&self, capture: &ClosingCapture<'_>) -> Result<()> {
        let odds_json = serde_json::to_string(capture.closing_odds).context("serialise odds")?;
        let conn = self.conn();
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO market_closing_data
                (market_id, closing_snapshot_id, closing_odds_json, odds_captured_at,
                 minutes_to_start, final_score_id, final_score, score_captured_at,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(market_id) DO UPDATE SET
                closing_snapshot_id = excluded.closing_snapshot_id,
                closing_odds_json = excluded.closing_odds_json,
                odds_captured_at = excluded.odds_captured_at,
                minutes_to_start = excluded.minutes_to_start,
                final_score_id = excluded.final_score_id,
                final_score = excluded.final_score,
                score_captured_at = excluded.score_captured_at,
                updated_at = excluded.updated_at",
            params![
                capture.market_id,
                capture.closing_snapshot_id,
                odds_json,
                fmt_ts(capture.odds_captured_at),
                capture.minutes_to_start,
                capture.final_score_id,
                capture.final_score,
                capture.score_captured_at.map(fmt_ts),
                now,
            ],
        )?;
        Ok(())
    }

    /// Closing rows with odds but no settlement, for events that started
    /// inside [started_after, started_before].
    pub fn unsettled_closings(
        &self,
        started_after: DateTime<Utc>,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UnsettledClosing>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT cd.id, cd.market_id, m.exchange_id
             FROM market_closing_data cd
             JOIN markets m ON cd.market_id = m.id
             JOIN events e ON m.event_id = e.id
             WHERE cd.settled_at IS NULL AND cd.closing_odds_json IS NOT NULL
               AND e.scheduled_start >= ?1 AND e.scheduled_start <= ?2
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![fmt_ts(started_after), fmt_ts(started_before), limit as i64],
                |row| {
                    Ok(UnsettledClosing {
                        closing_id: row.get(0)?,
                        market_id: row.get(1)?,
                        market_exchange_id: row.get(2)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_closing_settlement(
        &self,
        closing_id: i64,
        result: &SettlementResult,
        settled_at: DateTime<Utc>,
    ) -> Result<()> {
        let result_json = serde_json::to_string(result).context("serialise settlement")?;
        let conn = self.conn();
        conn.execute(
            "UPDATE market_closing_data
             SET result_json = ?1, settled_at = ?2, updated_at = ?3
             WHERE id = ?4",
            params![result_json, fmt_ts(settled_at), fmt_ts(Utc::now()), closing_id],
        )?;
        Ok(())
    }

    // -- phase-gate counts -------------------------------------------------

    pub fn count_closing_rows(&self) -> Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM market_closing_data WHERE closing_odds_json IS NOT NULL",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn count_settled_closings(&self) -> Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM market_closing_data WHERE settled_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn count_high_final_scores(&self, min_score: f64) -> Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM market_closing_data WHERE final_score >= ?1",
            params![min_score],
            |row| row.get(0),
        )?)
    }

    /// Distinct UTC days on which closing odds were captured.
    pub fn count_closing_observation_days(&self) -> Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(DISTINCT substr(odds_captured_at, 1, 10))
             FROM market_closing_data WHERE odds_captured_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?)
    }

    // -- event results -----------------------------------------------------

    pub fn event_result_exists(&self, event_id: i64) -> Result<bool> {
        let conn = self.conn();
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM event_results WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.is_some())
    }

    pub fn insert_event_result(
        &self,
        event_id: i64,
        home_score: Option<i64>,
        away_score: Option<i64>,
        source: &str,
    ) -> Result<i64> {
        let total_goals = match (home_score, away_score) {
            (Some(h), Some(a)) => Some(h + a),
            _ => None,
        };
        let btts = match (home_score, away_score) {
            (Some(h), Some(a)) => Some(h > 0 && a > 0),
            _ => None,
        };
        let conn = self.conn();
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO event_results
                (event_id, status, completed_at, home_score, away_score, total_goals, btts,
                 source, created_at, updated_at)
             VALUES (?1, 'COMPLETED', ?2, ?3, ?4, ?5, ?6, ?7, ?2, ?2)
             ON CONFLICT(event_id) DO NOTHING",
            params![
                event_id,
                now,
                home_score,
                away_score,
                total_goals,
                btts.map(|b| b as i64),
                source
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM event_results WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn event_result(&self, event_id: i64) -> Result<Option<EventResult>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, event_id, status, completed_at, home_score, away_score,
                        total_goals, btts, statistics_json, source
                 FROM event_results WHERE event_id = ?1",
                params![event_id],
                |row| {
                    let statistics: Option<String> = row.get(8)?;
                    Ok(EventResult {
                        id: row.get(0)?,
                        event_id: row.get(1)?,
                        status: row.get(2)?,
                        completed_at: row.get::<_, Option<String>>(3)?.map(|s| parse_ts(&s)),
                        home_score: row.get(4)?,
                        away_score: row.get(5)?,
                        total_goals: row.get(6)?,
                        btts: row.get::<_, Option<i64>>(7)?.map(|b| b != 0),
                        statistics: statistics.and_then(|s| serde_json::from_str(&s).ok()),
                        source: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn update_event_result_scores(
        &self,
        result_id: i64,
        home_score: i64,
        away_score: i64,
        source: &str,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE event_results
             SET home_score = ?1, away_score = ?2, total_goals = ?3, btts = ?4,
                 source = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                home_score,
                away_score,
                home_score + away_score,
                (home_score > 0 && away_score > 0) as i64,
                source,
                fmt_ts(Utc::now()),
                result_id
            ],
        )?;
        Ok(())
    }

    /// Events from enabled competitions that started inside the window and
    /// have no result row yet.
    pub fn events_without_results(
        &self,
        started_after: DateTime<Utc>,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.exchange_id, e.competition_id, e.name, e.scheduled_start, e.status
             FROM events e
             JOIN competitions c ON e.competition_id = c.id
             LEFT JOIN event_results r ON r.event_id = e.id
             WHERE e.scheduled_start >= ?1 AND e.scheduled_start < ?2
               AND c.enabled = 1 AND r.id IS NULL
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![fmt_ts(started_after), fmt_ts(started_before), limit as i64],
                |row| {
                    Ok(Event {
                        id: row.get(0)?,
                        exchange_id: row.get(1)?,
                        competition_id: row.get(2)?,
                        name: row.get(3)?,
                        scheduled_start: parse_ts(&row.get::<_, String>(4)?),
                        status: if row.get::<_, String>(5)? == "CLOSED" {
                            EventStatus::Closed
                        } else {
                            EventStatus::Scheduled
                        },
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Results whose scores are still heuristic, candidates for the
    /// correct-score enhancement pass.
    pub fn heuristic_results(&self, limit: usize) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, event_id FROM event_results
             WHERE status = 'COMPLETED' AND source = 'exchange'
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
