//! Phase gate: decides when enough data exists to move from collecting to
//! shadow trading.
//!
//! All four data-readiness thresholds must hold AND the shadow config must
//! allow auto-activation. Phase 3 (live trading) is not reachable from
//! here: nothing in the data model or configuration can produce it.

use serde::Serialize;

use crate::config::ShadowTradingConfig;
use crate::models::TradingPhase;
use crate::storage::Database;

/// Rendered on every shadow-facing surface.
pub const PAPER_TRADING_DISCLAIMER: &str =
    "PAPER TRADING: all figures theoretical, no real money at risk.";

/// Final-score level that counts a market as "high score" for activation.
const HIGH_SCORE_THRESHOLD: f64 = 30.0;

/// Raw counts the gate evaluates.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PhaseReadings {
    pub closing_rows: i64,
    pub settled_rows: i64,
    pub high_score_markets: i64,
    pub observation_days: i64,
}

pub fn read_phase_inputs(db: &Database) -> anyhow::Result<PhaseReadings> {
    Ok(PhaseReadings {
        closing_rows: db.count_closing_rows()?,
        settled_rows: db.count_settled_closings()?,
        high_score_markets: db.count_high_final_scores(HIGH_SCORE_THRESHOLD)?,
        observation_days: db.count_closing_observation_days()?,
    })
}

/// Pure function from readings and config to the current phase.
pub fn compute_phase(readings: &PhaseReadings, config: &ShadowTradingConfig) -> TradingPhase {
    if !config.enabled || !config.auto_activate_phase2 {
        return TradingPhase::Phase1Collecting;
    }

    let t = &config.activation;
    let ready = readings.closing_rows >= t.min_closing_data
        && readings.settled_rows >= t.min_results
        && readings.high_score_markets >= t.min_high_score_markets
        && readings.observation_days >= t.min_days_collecting;

    if ready {
        TradingPhase::Phase2Shadow
    } else {
        TradingPhase::Phase1Collecting
    }
}

pub fn current_phase(db: &Database, config: &ShadowTradingConfig) -> anyhow::Result<TradingPhase> {
    let readings = read_phase_inputs(db)?;
    let phase = compute_phase(&readings, config);
    tracing::info!(
        phase = phase.as_str(),
        closing_rows = readings.closing_rows,
        settled_rows = readings.settled_rows,
        high_score_markets = readings.high_score_markets,
        observation_days = readings.observation_days,
        "phase_evaluated"
    );
    Ok(phase)
}
