//! Snapshot storage. Append-only ladder captures per market.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::warn;

use super::{fmt_ts, parse_ts, Database};
use crate::models::{LadderData, MarketSnapshot};

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<MarketSnapshot> {
    let ladder_json: String = row.get(6)?;
    let ladder: LadderData = serde_json::from_str(&ladder_json).unwrap_or(LadderData {
        runners: Vec::new(),
        overround: 0.0,
        total_available: 0.0,
    });
    Ok(MarketSnapshot {
        id: row.get(0)?,
        market_id: row.get(1)?,
        captured_at: parse_ts(&row.get::<_, String>(2)?),
        total_matched: row.get(3)?,
        total_available: row.get(4)?,
        overround: row.get(5)?,
        ladder,
    })
}

const SNAPSHOT_COLS: &str =
    "id, market_id, captured_at, total_matched, total_available, overround, ladder_json";

impl Database {
    /// Insert a snapshot. Duplicate (market, instant) pairs are ignored so a
    /// retried job cannot double-write. Returns the row id, or None when the
    /// snapshot already existed.
    pub fn insert_snapshot(
        &self,
        market_id: i64,
        captured_at: DateTime<Utc>,
        total_matched: f64,
        total_available: f64,
        overround: f64,
        ladder: &LadderData,
    ) -> Result<Option<i64>> {
        // Upstream totals should only grow; regressions are recorded, not
        // rejected, but they are worth a trace.
        if let Some(previous) = self.last_total_matched(market_id)? {
            if total_matched < previous {
                warn!(
                    market_id,
                    previous, current = total_matched, "total_matched_regression"
                );
            }
        }

        let ladder_json = serde_json::to_string(ladder).context("serialise ladder")?;
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO market_snapshots
                (market_id, captured_at, total_matched, total_available, overround, ladder_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                market_id,
                fmt_ts(captured_at),
                total_matched,
                total_available,
                overround,
                ladder_json
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn latest_snapshot(&self, market_id: i64) -> Result<Option<MarketSnapshot>> {
        let conn = self.conn();
        let snap = conn
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLS} FROM market_snapshots
                     WHERE market_id = ?1 ORDER BY captured_at DESC LIMIT 1"
                ),
                params![market_id],
                snapshot_from_row,
            )
            .optional()?;
        Ok(snap)
    }

    /// Most recent snapshot inside [from, to) for a market.
    pub fn latest_snapshot_in_window(
        &self,
        market_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<MarketSnapshot>> {
        let conn = self.conn();
        let snap = conn
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLS} FROM market_snapshots
                     WHERE market_id = ?1 AND captured_at >= ?2 AND captured_at < ?3
                     ORDER BY captured_at DESC LIMIT 1"
                ),
                params![market_id, fmt_ts(from), fmt_ts(to)],
                snapshot_from_row,
            )
            .optional()?;
        Ok(snap)
    }

    /// Snapshots for one market inside [from, to), ordered by capture time.
    pub fn snapshots_between(
        &self,
        market_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MarketSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLS} FROM market_snapshots
             WHERE market_id = ?1 AND captured_at >= ?2 AND captured_at < ?3
             ORDER BY captured_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![market_id, fmt_ts(from), fmt_ts(to)], snapshot_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Distinct market ids with at least one snapshot inside [from, to).
    pub fn market_ids_with_snapshots_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT market_id FROM market_snapshots
             WHERE captured_at >= ?1 AND captured_at < ?2",
        )?;
        let rows = stmt
            .query_map(params![fmt_ts(from), fmt_ts(to)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn last_total_matched(&self, market_id: i64) -> Result<Option<f64>> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT total_matched FROM market_snapshots
                 WHERE market_id = ?1 ORDER BY captured_at DESC LIMIT 1",
                params![market_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}
