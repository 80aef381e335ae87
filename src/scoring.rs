//! Exploitability scoring engine.
//!
//! Turns a profile row into a bounded 0-100 score with a component
//! breakdown. High matched volume is a PENALTY: a heavily traded market is
//! an efficient market, and efficient markets are exactly what this system
//! is trying to avoid. The interesting region is moderate spread, moderate
//! volatility and adequate-but-not-deep liquidity.
//!
//! The engine is pure: same metrics + same config = same result, always.

use tracing::debug;

use crate::config::ScoringConfig;

/// Input metrics for one scoring pass.
#[derive(Debug, Clone, Copy)]
pub struct ProfileMetrics {
    pub spread_ticks: f64,
    pub volatility: f64,
    pub update_rate: f64,
    pub depth: f64,
    pub volume: f64,
    pub mean_price: f64,
    pub snapshot_count: i64,
}

/// Scoring output. When any guard fails the total and every component are
/// zero and `guards_failed` names the tripped guards; a guard failure is a
/// legitimate zero-score result, not an error.
#[derive(Debug, Clone)]
pub struct ScoreResult {
    pub total_score: f64,
    pub spread_score: f64,
    pub volatility_score: f64,
    pub update_score: f64,
    pub depth_score: f64,
    pub volume_penalty: f64,
    pub guards_failed: Vec<String>,
}

impl ScoreResult {
    fn zeroed(guards_failed: Vec<String>) -> Self {
        Self {
            total_score: 0.0,
            spread_score: 0.0,
            volatility_score: 0.0,
            update_score: 0.0,
            depth_score: 0.0,
            volume_penalty: 0.0,
            guards_failed,
        }
    }
}

fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Spread in ticks. Too tight is efficient, too wide is illiquid; the
    /// sweet spot sits between `min_ticks` and `sweet_spot_max`.
    pub fn f_spread(&self, spread_ticks: f64) -> f64 {
        let p = &self.config.normalisation.spread;
        if spread_ticks < p.min_ticks {
            (spread_ticks / p.min_ticks * 0.3).max(0.0)
        } else if spread_ticks <= p.sweet_spot_max {
            let range = p.sweet_spot_max - p.min_ticks;
            0.3 + (spread_ticks - p.min_ticks) / range * 0.7
        } else {
            let excess = spread_ticks - p.sweet_spot_max;
            let max_excess = p.max_ticks - p.sweet_spot_max;
            (1.0 - excess / max_excess).max(0.0)
        }
    }

    /// Volatility peaks at the target; no movement means no opportunity,
    /// too much is chaos.
    pub fn f_volatility(&self, volatility: f64) -> f64 {
        let p = &self.config.normalisation.volatility;
        if volatility <= 0.0 {
            return 0.0;
        }
        if volatility < p.target {
            volatility / p.target
        } else {
            let max_excess = p.max - p.target;
            if max_excess <= 0.0 {
                return 0.0;
            }
            (1.0 - (volatility - p.target) / max_excess).max(0.0)
        }
    }

    /// Update rate with log-scaled diminishing returns above the minimum.
    pub fn f_update(&self, update_rate: f64) -> f64 {
        let p = &self.config.normalisation.update_rate;
        if update_rate <= 0.0 {
            return 0.0;
        }
        if update_rate < p.min {
            return update_rate / p.min * 0.3;
        }
        clamp((1.0 + update_rate).ln() / (1.0 + p.max).ln(), 0.0, 1.0)
    }

    /// Depth needs a tradeable floor; above optimal it decays mildly to 0.7
    /// because very deep books belong to efficient markets.
    pub fn f_depth(&self, depth: f64) -> f64 {
        let p = &self.config.normalisation.depth;
        if depth < p.min {
            return 0.0;
        }
        if depth <= p.optimal {
            (depth - p.min) / (p.optimal - p.min)
        } else {
            let max_excess = p.max - p.optimal;
            if max_excess <= 0.0 {
                return 1.0;
            }
            (1.0 - (depth - p.optimal) / max_excess * 0.3).max(0.7)
        }
    }

    /// Penalty for matched volume. Zero below the threshold, linear up to
    /// `max`, saturated at and above the hard cap.
    pub fn f_volume_penalty(&self, volume: f64) -> f64 {
        let p = &self.config.normalisation.volume;
        if volume <= p.threshold {
            return 0.0;
        }
        if volume >= p.hard_cap {
            return 1.0;
        }
        let max_excess = p.max - p.threshold;
        if max_excess <= 0.0 {
            return 1.0;
        }
        clamp((volume - p.threshold) / max_excess, 0.0, 1.0)
    }

    /// Check hard guards. Returns the names of failed guards (empty = pass).
    pub fn check_guards(&self, metrics: &ProfileMetrics) -> Vec<String> {
        let guards = &self.config.guards;
        let mut failed = Vec::new();

        if metrics.depth < guards.absolute_min_depth {
            failed.push(format!("depth_below_{}", guards.absolute_min_depth));
        }
        if metrics.spread_ticks > guards.absolute_max_spread_ticks {
            failed.push(format!("spread_above_{}", guards.absolute_max_spread_ticks));
        }
        if metrics.snapshot_count < guards.min_snapshots_required {
            failed.push(format!("snapshots_below_{}", guards.min_snapshots_required));
        }
        let hard_cap = self.config.normalisation.volume.hard_cap;
        if metrics.volume > hard_cap {
            failed.push(format!("volume_above_{hard_cap}"));
        }

        failed
    }

    pub fn calculate_score(&self, metrics: &ProfileMetrics) -> ScoreResult {
        let guards_failed = self.check_guards(metrics);
        if !guards_failed.is_empty() {
            debug!(
                guards = ?guards_failed,
                spread = metrics.spread_ticks,
                depth = metrics.depth,
                volume = metrics.volume,
                "guards_failed"
            );
            return ScoreResult::zeroed(guards_failed);
        }

        let spread_norm = self.f_spread(metrics.spread_ticks);
        let volatility_norm = self.f_volatility(metrics.volatility);
        let update_norm = self.f_update(metrics.update_rate);
        let depth_norm = self.f_depth(metrics.depth);
        let volume_penalty_norm = self.f_volume_penalty(metrics.volume);

        let w = &self.config.weights;
        let raw = w.spread * spread_norm
            + w.volatility * volatility_norm
            + w.update_rate * update_norm
            + w.depth * depth_norm
            - w.volume_penalty * volume_penalty_norm;

        let total = clamp(raw * 100.0, 0.0, 100.0);

        let result = ScoreResult {
            total_score: round2(total),
            spread_score: round2(spread_norm * 100.0),
            volatility_score: round2(volatility_norm * 100.0),
            update_score: round2(update_norm * 100.0),
            depth_score: round2(depth_norm * 100.0),
            volume_penalty: round2(volume_penalty_norm * 100.0),
            guards_failed: Vec::new(),
        };

        debug!(
            total = result.total_score,
            spread = result.spread_score,
            volatility = result.volatility_score,
            update = result.update_score,
            depth = result.depth_score,
            volume_penalty = result.volume_penalty,
            "score_calculated"
        );

        result
    }
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct ScoringStats {
    pub markets_processed: usize,
    pub scores_created: usize,
    pub high_scores: usize,
    pub skipped_insufficient_data: usize,
}

/// Scores every market with a fresh profile, pinning each row to the active
/// config version.
pub struct ScoringService {
    db: crate::storage::Database,
    engine: ScoringEngine,
    config_version_id: i64,
}

impl ScoringService {
    pub fn new(db: crate::storage::Database, config: ScoringConfig) -> anyhow::Result<Self> {
        // Reuse the stored config when one is active so past scores stay
        // reproducible; otherwise version the supplied one.
        let (config_version_id, effective) = match db.active_scoring_config()? {
            Some((id, stored)) => (id, stored),
            None => {
                let id = db.ensure_active_scoring_config(&config)?;
                (id, config)
            }
        };
        Ok(Self {
            db,
            engine: ScoringEngine::new(effective),
            config_version_id,
        })
    }

    pub fn score_markets(&self, today: chrono::NaiveDate) -> anyhow::Result<ScoringStats> {
        let mut stats = ScoringStats::default();
        let profiles = self.db.profiles_for_scoring(today)?;

        let mut scored_markets = std::collections::HashSet::new();
        for profile in profiles {
            stats.markets_processed += 1;
            if !scored_markets.insert(profile.market_id) {
                continue;
            }

            // Not enough observations to say anything yet; no row at all
            // rather than a guard-zero row.
            if profile.snapshot_count < self.engine.config().guards.min_snapshots_required {
                stats.skipped_insufficient_data += 1;
                continue;
            }

            let metrics = ProfileMetrics {
                spread_ticks: profile.avg_spread_ticks,
                volatility: profile.price_volatility,
                update_rate: profile.update_rate_per_min,
                depth: profile.avg_depth_best,
                volume: profile.total_matched_volume,
                mean_price: profile.mean_price,
                snapshot_count: profile.snapshot_count,
            };
            let result = self.engine.calculate_score(&metrics);
            let band = crate::models::odds_band(if profile.mean_price > 0.0 {
                profile.mean_price
            } else {
                2.0
            });

            self.db.insert_score(&crate::storage::NewScore {
                market_id: profile.market_id,
                scored_at: chrono::Utc::now(),
                time_bucket: &profile.time_bucket,
                odds_band: band,
                spread_score: result.spread_score,
                volatility_score: result.volatility_score,
                update_score: result.update_score,
                depth_score: result.depth_score,
                volume_penalty: result.volume_penalty,
                total_score: result.total_score,
                guards_failed: &result.guards_failed,
                config_version_id: Some(self.config_version_id),
            })?;
            stats.scores_created += 1;

            if result.total_score > 60.0 {
                stats.high_scores += 1;
                tracing::info!(
                    market_id = profile.market_id,
                    score = result.total_score,
                    time_bucket = %profile.time_bucket,
                    "high_score_market"
                );
            }
        }

        tracing::info!(
            markets = stats.markets_processed,
            scores = stats.scores_created,
            high_scores = stats.high_scores,
            "scoring_complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(
        spread_ticks: f64,
        volatility: f64,
        update_rate: f64,
        depth: f64,
        volume: f64,
        snapshot_count: i64,
    ) -> ProfileMetrics {
        ProfileMetrics {
            spread_ticks,
            volatility,
            update_rate,
            depth,
            volume,
            mean_price: 2.5,
            snapshot_count,
        }
    }

    #[test]
    fn high_volume_efficient_market_scores_low() {
        // Top-league profile: tight, stable, deep, very heavily traded.
        let engine = ScoringEngine::default();
        let result = engine.calculate_score(&metrics(1.0, 0.015, 4.0, 12000.0, 450_000.0, 100));
        assert!(
            result.total_score < 40.0,
            "efficient market scored {}, expected < 40",
            result.total_score
        );
        assert!(
            result.volume_penalty >= 70.0,
            "volume penalty was only {}",
            result.volume_penalty
        );
    }

    #[test]
    fn secondary_league_sweet_spot_scores_high() {
        let engine = ScoringEngine::default();
        let result = engine.calculate_score(&metrics(5.0, 0.045, 0.8, 620.0, 18_000.0, 50));
        assert!(
            result.total_score > 50.0,
            "sweet-spot market scored {}, expected > 50",
            result.total_score
        );
        assert!(result.guards_failed.is_empty());
    }

    #[test]
    fn illiquid_market_fails_depth_guard() {
        let engine = ScoringEngine::default();
        let result = engine.calculate_score(&metrics(8.0, 0.09, 0.05, 50.0, 1000.0, 10));
        assert_eq!(result.total_score, 0.0);
        assert!(result.guards_failed.iter().any(|g| g.starts_with("depth_below")));
        // Guard failures zero the components too.
        assert_eq!(result.spread_score, 0.0);
        assert_eq!(result.volatility_score, 0.0);
    }

    #[test]
    fn wide_spread_fails_guard() {
        let engine = ScoringEngine::default();
        let result = engine.calculate_score(&metrics(25.0, 0.05, 0.5, 500.0, 5000.0, 20));
        assert_eq!(result.total_score, 0.0);
        assert!(result.guards_failed.iter().any(|g| g.starts_with("spread_above")));
    }

    #[test]
    fn volume_hard_cap_fails_guard() {
        let engine = ScoringEngine::default();
        let result = engine.calculate_score(&metrics(5.0, 0.04, 1.0, 1000.0, 600_000.0, 50));
        assert_eq!(result.total_score, 0.0);
        assert!(result.guards_failed.iter().any(|g| g.starts_with("volume_above")));
    }

    #[test]
    fn insufficient_snapshots_fail_guard() {
        let engine = ScoringEngine::default();
        let result = engine.calculate_score(&metrics(5.0, 0.04, 1.0, 1000.0, 10_000.0, 2));
        assert_eq!(result.total_score, 0.0);
        assert!(!result.guards_failed.is_empty());
    }

    #[test]
    fn f_spread_shape() {
        let engine = ScoringEngine::default();
        assert!(engine.f_spread(1.0) < 0.3);
        assert!(engine.f_spread(5.0) > 0.6);
        assert!((engine.f_spread(8.0) - 1.0).abs() < 1e-9);
        assert!(engine.f_spread(15.0) < 0.3);
        assert_eq!(engine.f_spread(20.0), 0.0);
    }

    #[test]
    fn f_volatility_shape() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.f_volatility(0.0), 0.0);
        assert!(engine.f_volatility(0.01) < 0.5);
        assert!(engine.f_volatility(0.04) > 0.9);
        assert!(engine.f_volatility(0.15) < 0.3);
    }

    #[test]
    fn f_update_shape() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.f_update(0.0), 0.0);
        // Below minimum: ramp capped at 30%.
        assert!(engine.f_update(0.1) <= 0.3);
        // At maximum the log scale hits 1.
        assert!((engine.f_update(3.0) - 1.0).abs() < 1e-9);
        // Beyond maximum stays clamped.
        assert_eq!(engine.f_update(100.0), 1.0);
    }

    #[test]
    fn f_depth_shape() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.f_depth(50.0), 0.0);
        assert!((engine.f_depth(1500.0) - 1.0).abs() < 1e-9);
        // Above optimal decays but floors at 0.7.
        assert!(engine.f_depth(8000.0) >= 0.7);
        assert_eq!(engine.f_depth(50_000.0), 0.7);
    }

    #[test]
    fn f_volume_penalty_shape() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.f_volume_penalty(20_000.0), 0.0);
        assert!(engine.f_volume_penalty(100_000.0) > 0.0);
        assert!(engine.f_volume_penalty(200_000.0) >= 0.9);
        assert_eq!(engine.f_volume_penalty(500_000.0), 1.0);
    }

    #[test]
    fn scores_stay_in_bounds() {
        let engine = ScoringEngine::default();
        let extreme = [
            metrics(-5.0, -0.04, -1.0, -1000.0, -15_000.0, 10),
            metrics(1000.0, 10.0, 1000.0, 10_000_000.0, 100_000_000.0, 1000),
            metrics(5.0, 0.04, 1.0, 1000.0, 15_000.0, 50),
        ];
        for m in extreme {
            let result = engine.calculate_score(&m);
            assert!(result.total_score >= 0.0 && result.total_score <= 100.0);
            for component in [
                result.spread_score,
                result.volatility_score,
                result.update_score,
                result.depth_score,
                result.volume_penalty,
            ] {
                assert!((0.0..=100.0).contains(&component));
            }
        }
    }

    #[test]
    fn scoring_is_pure() {
        let engine = ScoringEngine::default();
        let m = metrics(5.0, 0.045, 0.8, 620.0, 18_000.0, 50);
        let a = engine.calculate_score(&m);
        let b = engine.calculate_score(&m);
        assert_eq!(a.total_score, b.total_score);
        assert_eq!(a.spread_score, b.spread_score);
        assert_eq!(a.volume_penalty, b.volume_penalty);
    }

    #[test]
    fn different_inputs_differ() {
        let engine = ScoringEngine::default();
        let a = engine.calculate_score(&metrics(5.0, 0.04, 1.0, 1000.0, 15_000.0, 50));
        let b = engine.calculate_score(&metrics(2.0, 0.01, 0.2, 500.0, 200_000.0, 50));
        assert_ne!(a.total_score, b.total_score);
    }
}
