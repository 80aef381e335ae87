//! Daily profile storage. One row per (market, date, time bucket), last
//! writer wins.

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Row};

use super::{fmt_date, parse_date, Database};
use crate::models::MarketProfile;

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<MarketProfile> {
    Ok(MarketProfile {
        id: row.get(0)?,
        market_id: row.get(1)?,
        profile_date: parse_date(&row.get::<_, String>(2)?),
        time_bucket: row.get(3)?,
        avg_spread_ticks: row.get(4)?,
        spread_volatility: row.get(5)?,
        avg_depth_best: row.get(6)?,
        depth_5_ticks: row.get(7)?,
        total_matched_volume: row.get(8)?,
        update_rate_per_min: row.get(9)?,
        price_volatility: row.get(10)?,
        mean_price: row.get(11)?,
        snapshot_count: row.get(12)?,
    })
}

const PROFILE_COLS: &str = "id, market_id, profile_date, time_bucket, avg_spread_ticks, \
     spread_volatility, avg_depth_best, depth_5_ticks, total_matched_volume, \
     update_rate_per_min, price_volatility, mean_price, snapshot_count";

/// Upsert payload; the key fields travel separately.
pub struct ProfileMetricsRow {
    pub avg_spread_ticks: f64,
    pub spread_volatility: f64,
    pub avg_depth_best: f64,
    pub depth_5_ticks: f64,
    pub total_matched_volume: f64,
    pub update_rate_per_min: f64,
    pub price_volatility: f64,
    pub mean_price: f64,
    pub snapshot_count: i64,
}

impl Database {
    pub fn upsert_profile(
        &self,
        market_id: i64,
        profile_date: NaiveDate,
        time_bucket: &str,
        metrics: &ProfileMetricsRow,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO market_profiles_daily
                (market_id, profile_date, time_bucket, avg_spread_ticks, spread_volatility,
                 avg_depth_best, depth_5_ticks, total_matched_volume, update_rate_per_min,
                 price_volatility, mean_price, snapshot_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(market_id, profile_date, time_bucket) DO UPDATE SET
                avg_spread_ticks = excluded.avg_spread_ticks,
                spread_volatility = excluded.spread_volatility,
                avg_depth_best = excluded.avg_depth_best,
                depth_5_ticks = excluded.depth_5_ticks,
                total_matched_volume = excluded.total_matched_volume,
                update_rate_per_min = excluded.update_rate_per_min,
                price_volatility = excluded.price_volatility,
                mean_price = excluded.mean_price,
                snapshot_count = excluded.snapshot_count",
            params![
                market_id,
                fmt_date(profile_date),
                time_bucket,
                metrics.avg_spread_ticks,
                metrics.spread_volatility,
                metrics.avg_depth_best,
                metrics.depth_5_ticks,
                metrics.total_matched_volume,
                metrics.update_rate_per_min,
                metrics.price_volatility,
                metrics.mean_price,
                metrics.snapshot_count,
            ],
        )?;
        Ok(())
    }

    /// Profiles for a date, restricted to OPEN markets in enabled
    /// competitions. This is the scorer's work list.
    pub fn profiles_for_scoring(&self, profile_date: NaiveDate) -> Result<Vec<MarketProfile>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT p.id, p.market_id, p.profile_date, p.time_bucket, p.avg_spread_ticks,
                    p.spread_volatility, p.avg_depth_best, p.depth_5_ticks,
                    p.total_matched_volume, p.update_rate_per_min, p.price_volatility,
                    p.mean_price, p.snapshot_count
             FROM market_profiles_daily p
             JOIN markets m ON p.market_id = m.id
             JOIN events e ON m.event_id = e.id
             JOIN competitions c ON e.competition_id = c.id
             WHERE p.profile_date = ?1 AND m.status = 'OPEN' AND c.enabled = 1",
        )?;
        let rows = stmt
            .query_map(params![fmt_date(profile_date)], profile_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn profile(
        &self,
        market_id: i64,
        profile_date: NaiveDate,
        time_bucket: &str,
    ) -> Result<Option<MarketProfile>> {
        let conn = self.conn();
        let profile = conn
            .query_row(
                &format!(
                    "SELECT {PROFILE_COLS} FROM market_profiles_daily
                     WHERE market_id = ?1 AND profile_date = ?2 AND time_bucket = ?3"
                ),
                params![market_id, fmt_date(profile_date), time_bucket],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    pub fn profiles_for_market_on(
        &self,
        market_id: i64,
        profile_date: NaiveDate,
    ) -> Result<Vec<MarketProfile>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROFILE_COLS} FROM market_profiles_daily
             WHERE market_id = ?1 AND profile_date = ?2
             ORDER BY time_bucket"
        ))?;
        let rows = stmt
            .query_map(params![market_id, fmt_date(profile_date)], profile_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
