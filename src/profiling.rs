//! Market profiling: roll snapshots up into per-market, per-time-bucket
//! daily metrics for the scoring engine.

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

use crate::ingestion::extract_snapshot_metrics;
use crate::models::{MarketSnapshot, TimeBucket};
use crate::storage::{Database, ProfileMetricsRow};

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator); zero for fewer than two
/// values.
fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[derive(Debug, Default, Serialize)]
pub struct ProfilingStats {
    pub markets_processed: usize,
    pub profiles_created: usize,
}

pub struct ProfilingService {
    db: Database,
}

impl ProfilingService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Compute profiles for every market that had snapshots on `date`.
    pub fn compute_profiles_for_date(&self, date: NaiveDate) -> anyhow::Result<ProfilingStats> {
        let mut stats = ProfilingStats::default();

        let day_start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
        let day_end = day_start + Duration::days(1);

        let market_ids = self.db.market_ids_with_snapshots_between(day_start, day_end)?;
        for market_id in market_ids {
            stats.profiles_created += self.compute_market_profile(market_id, date)?;
            stats.markets_processed += 1;
        }

        info!(
            date = %date,
            markets = stats.markets_processed,
            profiles = stats.profiles_created,
            "profiles_computed"
        );
        Ok(stats)
    }

    /// Profiles for one market on one date; returns the number of buckets
    /// written.
    pub fn compute_market_profile(&self, market_id: i64, date: NaiveDate) -> anyhow::Result<usize> {
        let Some(market) = self.db.market(market_id)? else {
            return Ok(0);
        };
        let Some(event) = self.db.event(market.event_id)? else {
            return Ok(0);
        };

        let day_start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
        let day_end = day_start + Duration::days(1);
        let snapshots = self.db.snapshots_between(market_id, day_start, day_end)?;
        if snapshots.is_empty() {
            return Ok(0);
        }

        // Group by time-to-start bucket, discarding anything captured after
        // the scheduled start.
        let mut buckets: HashMap<TimeBucket, Vec<&MarketSnapshot>> = HashMap::new();
        for snapshot in &snapshots {
            let hours =
                (event.scheduled_start - snapshot.captured_at).num_seconds() as f64 / 3600.0;
            let bucket = TimeBucket::from_hours_to_start(hours);
            if bucket == TimeBucket::InPlay {
                continue;
            }
            buckets.entry(bucket).or_default().push(snapshot);
        }

        let mut created = 0;
        for (bucket, bucket_snapshots) in buckets {
            if let Some(profile) = compute_bucket_profile(&bucket_snapshots) {
                self.db.upsert_profile(market_id, date, bucket.as_str(), &profile)?;
                created += 1;
            }
        }
        Ok(created)
    }
}

/// Aggregate one bucket of snapshots. Needs at least two snapshots and at
/// least one two-sided ladder observation to say anything useful.
pub fn compute_bucket_profile(snapshots: &[&MarketSnapshot]) -> Option<ProfileMetricsRow> {
    if snapshots.len() < 2 {
        return None;
    }

    let metrics: Vec<_> = snapshots.iter().map(|s| extract_snapshot_metrics(&s.ladder)).collect();

    let spreads: Vec<f64> = metrics.iter().map(|m| m.spread_ticks).filter(|v| *v > 0.0).collect();
    let depths: Vec<f64> = metrics.iter().map(|m| m.best_depth).filter(|v| *v > 0.0).collect();
    let depths_5: Vec<f64> =
        metrics.iter().map(|m| m.depth_5_ticks).filter(|v| *v > 0.0).collect();
    let mid_prices: Vec<f64> = metrics.iter().map(|m| m.mid_price).filter(|v| *v > 0.0).collect();

    if spreads.is_empty() || depths.is_empty() {
        return None;
    }

    let first = snapshots.first().unwrap().captured_at;
    let last = snapshots.last().unwrap().captured_at;
    let duration_minutes = ((last - first).num_seconds() as f64 / 60.0).max(1.0);

    let avg_mid = mean(&mid_prices);
    let price_volatility = if mid_prices.len() > 1 && avg_mid > 0.0 {
        stdev(&mid_prices) / avg_mid
    } else {
        0.0
    };

    let max_volume = snapshots.iter().map(|s| s.total_matched).fold(0.0f64, f64::max);

    Some(ProfileMetricsRow {
        avg_spread_ticks: round_to(mean(&spreads), 4),
        spread_volatility: round_to(stdev(&spreads), 4),
        avg_depth_best: round_to(mean(&depths), 2),
        depth_5_ticks: round_to(mean(&depths_5), 2),
        total_matched_volume: round_to(max_volume, 2),
        update_rate_per_min: round_to(snapshots.len() as f64 / duration_minutes, 4),
        price_volatility: round_to(price_volatility, 6),
        mean_price: round_to(avg_mid, 4),
        snapshot_count: snapshots.len() as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LadderData, PriceLevel, RunnerLadder};
    use chrono::DateTime;

    fn snapshot(
        market_id: i64,
        captured_at: DateTime<Utc>,
        back: f64,
        lay: f64,
        total_matched: f64,
    ) -> MarketSnapshot {
        MarketSnapshot {
            id: 0,
            market_id,
            captured_at,
            total_matched,
            total_available: 500.0,
            overround: 1.02,
            ladder: LadderData {
                runners: vec![RunnerLadder {
                    runner_id: 1,
                    last_traded: None,
                    total_matched,
                    back: vec![PriceLevel { price: back, size: 300.0 }],
                    lay: vec![PriceLevel { price: lay, size: 300.0 }],
                }],
                overround: 1.02,
                total_available: 500.0,
            },
        }
    }

    #[test]
    fn bucket_needs_two_snapshots() {
        let now = Utc::now();
        let s = snapshot(1, now, 2.4, 2.5, 100.0);
        assert!(compute_bucket_profile(&[&s]).is_none());
    }

    #[test]
    fn update_rate_uses_wall_clock_span() {
        let start = Utc.with_ymd_and_hms(2026, 7, 20, 10, 0, 0).unwrap();
        let snaps: Vec<MarketSnapshot> = (0..5)
            .map(|i| snapshot(1, start + Duration::minutes(i * 5), 2.4, 2.5, 100.0 + i as f64))
            .collect();
        let refs: Vec<&MarketSnapshot> = snaps.iter().collect();
        let profile = compute_bucket_profile(&refs).unwrap();
        // 5 snapshots over 20 minutes.
        assert!((profile.update_rate_per_min - 0.25).abs() < 1e-9);
        assert_eq!(profile.snapshot_count, 5);
    }

    #[test]
    fn volume_is_max_not_last() {
        let start = Utc.with_ymd_and_hms(2026, 7, 20, 10, 0, 0).unwrap();
        let snaps = vec![
            snapshot(1, start, 2.4, 2.5, 900.0),
            // Upstream correction dips, the max wins.
            snapshot(1, start + Duration::minutes(5), 2.4, 2.5, 870.0),
        ];
        let refs: Vec<&MarketSnapshot> = snaps.iter().collect();
        let profile = compute_bucket_profile(&refs).unwrap();
        assert_eq!(profile.total_matched_volume, 900.0);
    }

    #[test]
    fn volatility_is_relative_std_of_mids() {
        let start = Utc.with_ymd_and_hms(2026, 7, 20, 10, 0, 0).unwrap();
        let snaps = vec![
            snapshot(1, start, 2.0, 2.1, 100.0),
            snapshot(1, start + Duration::minutes(5), 2.2, 2.3, 100.0),
            snapshot(1, start + Duration::minutes(10), 2.4, 2.5, 100.0),
        ];
        let refs: Vec<&MarketSnapshot> = snaps.iter().collect();
        let profile = compute_bucket_profile(&refs).unwrap();
        // mids are 2.05, 2.25, 2.45: mean 2.25, sample std 0.2.
        assert!((profile.mean_price - 2.25).abs() < 1e-9);
        assert!((profile.price_volatility - round_to(0.2 / 2.25, 6)).abs() < 1e-9);
    }

    #[test]
    fn stdev_of_constant_series_is_zero() {
        assert_eq!(stdev(&[3.0, 3.0, 3.0]), 0.0);
        assert_eq!(stdev(&[3.0]), 0.0);
        assert!((stdev(&[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn profiler_end_to_end_buckets_and_upserts() {
        let db = Database::open_in_memory().unwrap();
        let sport = db.upsert_sport("1", "Soccer", true).unwrap();
        let comp = db.upsert_competition("c", sport, "Liga", None, true, "active").unwrap();
        // Event starts in 3 hours: pre-start snapshots land in 2-6h,
        // post-start snapshots are discarded.
        let start = Utc::now() + Duration::hours(3);
        let event = db.upsert_event("e", comp, "A v B", start).unwrap();
        let market = db.upsert_market("1.1", event, "MO", "MATCH_ODDS", 0.0).unwrap();

        let now = Utc::now();
        for i in 0..4 {
            let s = snapshot(market, now - Duration::minutes(30 - i * 5), 2.4, 2.5, 100.0);
            db.insert_snapshot(
                market,
                s.captured_at,
                s.total_matched,
                s.total_available,
                s.overround,
                &s.ladder,
            )
            .unwrap();
        }
        // One snapshot after the scheduled start (captured "tomorrow" is out
        // of the day window, so place it just after start but today).
        let inplay_at = start + Duration::minutes(10);
        if inplay_at.date_naive() == now.date_naive() {
            let s = snapshot(market, inplay_at, 2.4, 2.5, 100.0);
            db.insert_snapshot(
                market,
                s.captured_at,
                s.total_matched,
                s.total_available,
                s.overround,
                &s.ladder,
            )
            .unwrap();
        }

        let service = ProfilingService::new(db.clone());
        let stats = service.compute_profiles_for_date(now.date_naive()).unwrap();
        assert_eq!(stats.markets_processed, 1);
        assert_eq!(stats.profiles_created, 1);

        let profile = db.profile(market, now.date_naive(), "2-6h").unwrap().unwrap();
        assert_eq!(profile.snapshot_count, 4);

        // Re-running produces identical rows (upsert, not append).
        let stats2 = service.compute_profiles_for_date(now.date_naive()).unwrap();
        assert_eq!(stats2.profiles_created, 1);
        let profile2 = db.profile(market, now.date_naive(), "2-6h").unwrap().unwrap();
        assert_eq!(profile.avg_spread_ticks, profile2.avg_spread_ticks);
        assert_eq!(profile.snapshot_count, profile2.snapshot_count);
    }
}
