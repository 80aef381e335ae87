//! Runtime configuration.
//!
//! Environment settings follow the usual pattern: `dotenv` then
//! `std::env::var` with defaults. The scoring configuration is a plain data
//! struct serialised into `config_versions` so every score row can reference
//! the exact parameters that produced it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Application settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: String,
    pub exchange_app_key: String,
    pub exchange_username: String,
    pub exchange_password: String,
    /// Path to a client certificate (PEM). When set, certificate login is
    /// used instead of interactive login.
    pub exchange_cert_path: Option<String>,
    pub exchange_cert_key_path: Option<String>,
    pub enabled_sports: Vec<String>,
    pub enabled_market_types: Vec<String>,
    pub lookahead_hours: i64,
    pub ladder_depth: usize,
    pub snapshot_batch_size: usize,
    pub snapshot_interval_secs: u64,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./ridgeradar.db".to_string());

        let exchange_app_key = std::env::var("EXCHANGE_APP_KEY").unwrap_or_default();
        let exchange_username = std::env::var("EXCHANGE_USERNAME").unwrap_or_default();
        let exchange_password = std::env::var("EXCHANGE_PASSWORD").unwrap_or_default();
        let exchange_cert_path = std::env::var("EXCHANGE_CERT_PATH").ok().filter(|s| !s.is_empty());
        let exchange_cert_key_path = std::env::var("EXCHANGE_CERT_KEY_PATH")
            .ok()
            .filter(|s| !s.is_empty());

        let enabled_sports = std::env::var("ENABLED_SPORTS")
            .unwrap_or_else(|_| "soccer".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let enabled_market_types = std::env::var("ENABLED_MARKET_TYPES")
            .unwrap_or_else(|_| {
                "MATCH_ODDS,OVER_UNDER_25,BOTH_TEAMS_TO_SCORE,CORRECT_SCORE".to_string()
            })
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let lookahead_hours = std::env::var("LOOKAHEAD_HOURS")
            .unwrap_or_else(|_| "72".to_string())
            .parse()
            .unwrap_or(72);

        let ladder_depth = std::env::var("LADDER_DEPTH")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        let snapshot_batch_size = std::env::var("SNAPSHOT_BATCH_SIZE")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let snapshot_interval_secs = std::env::var("SNAPSHOT_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        Ok(Self {
            database_path,
            exchange_app_key,
            exchange_username,
            exchange_password,
            exchange_cert_path,
            exchange_cert_key_path,
            enabled_sports,
            enabled_market_types,
            lookahead_hours,
            ladder_depth,
            snapshot_batch_size,
            snapshot_interval_secs,
        })
    }
}

// ---------------------------------------------------------------------------
// Scoring configuration (versioned)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringWeights {
    pub spread: f64,
    pub volatility: f64,
    pub update_rate: f64,
    pub depth: f64,
    pub volume_penalty: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpreadNorm {
    pub min_ticks: f64,
    pub sweet_spot_max: f64,
    pub max_ticks: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolatilityNorm {
    pub target: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRateNorm {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DepthNorm {
    pub min: f64,
    pub optimal: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeNorm {
    pub threshold: f64,
    pub max: f64,
    pub hard_cap: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Normalisation {
    pub spread: SpreadNorm,
    pub volatility: VolatilityNorm,
    pub update_rate: UpdateRateNorm,
    pub depth: DepthNorm,
    pub volume: VolumeNorm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Guards {
    pub absolute_min_depth: f64,
    pub absolute_max_spread_ticks: f64,
    pub min_snapshots_required: i64,
}

/// Complete scoring configuration. Immutable once written to
/// `config_versions`; the engine only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    pub normalisation: Normalisation,
    pub guards: Guards,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights {
                spread: 0.25,
                volatility: 0.25,
                update_rate: 0.15,
                depth: 0.20,
                volume_penalty: 0.15,
            },
            normalisation: Normalisation {
                spread: SpreadNorm {
                    min_ticks: 2.0,
                    sweet_spot_max: 8.0,
                    max_ticks: 12.0,
                },
                volatility: VolatilityNorm { target: 0.04, max: 0.12 },
                update_rate: UpdateRateNorm { min: 0.2, max: 3.0 },
                depth: DepthNorm {
                    min: 150.0,
                    optimal: 1500.0,
                    max: 8000.0,
                },
                volume: VolumeNorm {
                    threshold: 30_000.0,
                    max: 200_000.0,
                    hard_cap: 500_000.0,
                },
            },
            guards: Guards {
                absolute_min_depth: 100.0,
                absolute_max_spread_ticks: 20.0,
                min_snapshots_required: 5,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Shadow trading configuration
// ---------------------------------------------------------------------------

/// Data-readiness thresholds that gate the move from collecting to shadow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationThresholds {
    pub min_closing_data: i64,
    pub min_results: i64,
    pub min_high_score_markets: i64,
    pub min_days_collecting: i64,
}

impl Default for ActivationThresholds {
    fn default() -> Self {
        Self {
            min_closing_data: 500,
            min_results: 200,
            min_high_score_markets: 50,
            min_days_collecting: 2,
        }
    }
}

/// Default entry window and liquidity floor for shadow entries. The 6-24 h
/// window is where sharp pre-match money tends to show first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDefaults {
    pub min_score: f64,
    pub min_minutes_to_start: i64,
    pub max_minutes_to_start: i64,
    pub min_total_matched: f64,
    pub max_spread_percent: f64,
}

impl Default for EntryDefaults {
    fn default() -> Self {
        Self {
            min_score: 30.0,
            min_minutes_to_start: 360,
            max_minutes_to_start: 1440,
            min_total_matched: 5000.0,
            max_spread_percent: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeConfig {
    pub base_stake: f64,
    pub max_stake_per_market: f64,
    pub max_exposure_per_event: f64,
    pub max_daily_exposure: f64,
    pub commission_rate: f64,
}

impl Default for StakeConfig {
    fn default() -> Self {
        Self {
            base_stake: 10.00,
            max_stake_per_market: 50.00,
            max_exposure_per_event: 100.00,
            max_daily_exposure: 500.00,
            commission_rate: 0.02,
        }
    }
}

/// Per-market-type trading rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTypeRule {
    pub enabled: bool,
    pub strategy: String,
    pub description: String,
    pub runner_name_pattern: Option<String>,
}

/// Shadow trading configuration.
///
/// Live trading cannot be switched on here: `live_trading_enabled` is a
/// method that returns false, not a field, so neither env vars nor stored
/// config can escalate past paper trading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowTradingConfig {
    pub enabled: bool,
    pub auto_activate_phase2: bool,
    pub activation: ActivationThresholds,
    pub entry: EntryDefaults,
    pub stake: StakeConfig,
    pub market_rules: HashMap<String, MarketTypeRule>,
}

impl ShadowTradingConfig {
    /// Always false. Phase 3 requires a code change, not a config change.
    pub fn live_trading_enabled(&self) -> bool {
        false
    }

    pub fn market_rule(&self, market_type: &str) -> MarketTypeRule {
        self.market_rules.get(market_type).cloned().unwrap_or(MarketTypeRule {
            enabled: false,
            strategy: "skip".to_string(),
            description: "Unknown market type - not traded".to_string(),
            runner_name_pattern: None,
        })
    }
}

impl Default for ShadowTradingConfig {
    fn default() -> Self {
        let mut market_rules = HashMap::new();
        market_rules.insert(
            "MATCH_ODDS".to_string(),
            MarketTypeRule {
                enabled: true,
                strategy: "back_best_value".to_string(),
                description: "Back runner where the score indicates mispricing".to_string(),
                runner_name_pattern: None,
            },
        );
        market_rules.insert(
            "OVER_UNDER_25".to_string(),
            MarketTypeRule {
                enabled: true,
                strategy: "back_under".to_string(),
                description: "Back Under 2.5 when the score is high".to_string(),
                runner_name_pattern: Some("Under 2.5".to_string()),
            },
        );
        market_rules.insert(
            "BOTH_TEAMS_TO_SCORE".to_string(),
            MarketTypeRule {
                enabled: true,
                strategy: "back_no".to_string(),
                description: "Back 'No' when the score indicates value".to_string(),
                runner_name_pattern: Some("No".to_string()),
            },
        );
        market_rules.insert(
            "CORRECT_SCORE".to_string(),
            MarketTypeRule {
                enabled: true,
                strategy: "back_best_value".to_string(),
                description: "Traded via hypotheses with specific criteria".to_string(),
                runner_name_pattern: None,
            },
        );
        market_rules.insert(
            "ASIAN_HANDICAP".to_string(),
            MarketTypeRule {
                enabled: false,
                strategy: "skip".to_string(),
                description: "Skipped - requires line selection logic".to_string(),
                runner_name_pattern: None,
            },
        );

        Self {
            enabled: true,
            auto_activate_phase2: true,
            activation: ActivationThresholds::default(),
            entry: EntryDefaults::default(),
            stake: StakeConfig::default(),
            market_rules,
        }
    }
}

/// Competition name fragments that are hard-excluded at discovery. Case
/// insensitive substring match. This is about API quota, not market
/// efficiency: the volume penalty handles efficient leagues.
pub fn default_exclusion_patterns() -> Vec<String> {
    ["friendly", "u21", "u19", "u17", "reserve", "amateur", "women"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoring_weights_sum_to_one_over_positive_terms() {
        let w = ScoringConfig::default().weights;
        let sum = w.spread + w.volatility + w.update_rate + w.depth + w.volume_penalty;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn scoring_config_round_trips_through_json() {
        let config = ScoringConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ScoringConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn live_trading_is_never_enabled() {
        let config = ShadowTradingConfig::default();
        assert!(!config.live_trading_enabled());
        // Deserialising arbitrary JSON cannot flip it either.
        let json = serde_json::to_string(&config).unwrap();
        let from_json: ShadowTradingConfig = serde_json::from_str(&json).unwrap();
        assert!(!from_json.live_trading_enabled());
    }

    #[test]
    fn unknown_market_type_rule_is_disabled() {
        let config = ShadowTradingConfig::default();
        let rule = config.market_rule("HALF_TIME_SCORE");
        assert!(!rule.enabled);
        assert_eq!(rule.strategy, "skip");
    }
}
