//! Score and config-version storage. Scores are append-only; the active
//! config version is pinned so every score row is reproducible.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{fmt_date, fmt_ts, parse_ts, Database};
use crate::config::ScoringConfig;
use crate::models::ScoreRow;

fn score_from_row(row: &Row<'_>) -> rusqlite::Result<ScoreRow> {
    Ok(ScoreRow {
        id: row.get(0)?,
        market_id: row.get(1)?,
        scored_at: parse_ts(&row.get::<_, String>(2)?),
        time_bucket: row.get(3)?,
        odds_band: row.get(4)?,
        spread_score: row.get(5)?,
        volatility_score: row.get(6)?,
        update_score: row.get(7)?,
        depth_score: row.get(8)?,
        volume_penalty: row.get(9)?,
        total_score: row.get(10)?,
        config_version_id: row.get(11)?,
    })
}

const SCORE_COLS: &str = "id, market_id, scored_at, time_bucket, odds_band, spread_score, \
     volatility_score, update_score, depth_score, volume_penalty, total_score, config_version_id";

pub struct NewScore<'a> {
    pub market_id: i64,
    pub scored_at: DateTime<Utc>,
    pub time_bucket: &'a str,
    pub odds_band: &'a str,
    pub spread_score: f64,
    pub volatility_score: f64,
    pub update_score: f64,
    pub depth_score: f64,
    pub volume_penalty: f64,
    pub total_score: f64,
    pub guards_failed: &'a [String],
    pub config_version_id: Option<i64>,
}

impl Database {
    /// Return the active scoring config version, creating one from the given
    /// config if none exists yet.
    pub fn ensure_active_scoring_config(&self, config: &ScoringConfig) -> Result<i64> {
        if let Some((id, _)) = self.active_scoring_config()? {
            return Ok(id);
        }
        let json = serde_json::to_string(config).context("serialise scoring config")?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO config_versions (config_type, config_json, created_by, created_at, is_active)
             VALUES ('scoring', ?1, 'system', ?2, 1)",
            params![json, fmt_ts(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn active_scoring_config(&self) -> Result<Option<(i64, ScoringConfig)>> {
        let conn = self.conn();
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, config_json FROM config_versions
                 WHERE config_type = 'scoring' AND is_active = 1
                 ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((id, json)) => {
                let config = serde_json::from_str(&json).context("parse scoring config")?;
                Ok(Some((id, config)))
            }
            None => Ok(None),
        }
    }

    pub fn insert_score(&self, score: &NewScore<'_>) -> Result<i64> {
        let guards_json = if score.guards_failed.is_empty() {
            None
        } else {
            Some(serde_json::to_string(score.guards_failed)?)
        };
        let conn = self.conn();
        conn.execute(
            "INSERT INTO exploitability_scores
                (market_id, scored_at, time_bucket, odds_band, spread_score, volatility_score,
                 update_score, depth_score, volume_penalty, total_score, guards_failed,
                 config_version_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                score.market_id,
                fmt_ts(score.scored_at),
                score.time_bucket,
                score.odds_band,
                score.spread_score,
                score.volatility_score,
                score.update_score,
                score.depth_score,
                score.volume_penalty,
                score.total_score,
                guards_json,
                score.config_version_id,
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn latest_score(&self, market_id: i64) -> Result<Option<ScoreRow>> {
        let conn = self.conn();
        let score = conn
            .query_row(
                &format!(
                    "SELECT {SCORE_COLS} FROM exploitability_scores
                     WHERE market_id = ?1 ORDER BY scored_at DESC LIMIT 1"
                ),
                params![market_id],
                score_from_row,
            )
            .optional()?;
        Ok(score)
    }

    /// All scores recorded on `date` for markets of one competition.
    pub fn scores_for_competition_on(
        &self,
        competition_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<ScoreRow>> {
        let conn = self.conn();
        let day_start = format!("{}T00:00:00.000000Z", fmt_date(date));
        let day_end = format!("{}T23:59:59.999999Z", fmt_date(date));
        let mut stmt = conn.prepare(
            "SELECT s.id, s.market_id, s.scored_at, s.time_bucket, s.odds_band, s.spread_score,
                    s.volatility_score, s.update_score, s.depth_score, s.volume_penalty,
                    s.total_score, s.config_version_id
             FROM exploitability_scores s
             JOIN markets m ON s.market_id = m.id
             JOIN events e ON m.event_id = e.id
             WHERE e.competition_id = ?1 AND s.scored_at >= ?2 AND s.scored_at <= ?3",
        )?;
        let rows = stmt
            .query_map(params![competition_id, day_start, day_end], score_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
