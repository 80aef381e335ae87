//! Domain model for the market observation pipeline.
//!
//! Entities follow the exchange hierarchy: Sport -> Competition -> Event ->
//! Market -> Runner. Markets own snapshots, daily profiles, exploitability
//! scores and closing data. Statuses are stored as TEXT, so every enum here
//! carries an `as_str`/`parse` pair.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Market lifecycle status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketStatus {
    Open,
    Suspended,
    Closed,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "OPEN",
            MarketStatus::Suspended => "SUSPENDED",
            MarketStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "OPEN" => MarketStatus::Open,
            "SUSPENDED" => MarketStatus::Suspended,
            _ => MarketStatus::Closed,
        }
    }
}

/// Runner (selection) status. WINNER/LOSER appear after settlement,
/// REMOVED covers non-runners and vacated selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerStatus {
    Active,
    Winner,
    Loser,
    Removed,
    RemovedVacant,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Active => "ACTIVE",
            RunnerStatus::Winner => "WINNER",
            RunnerStatus::Loser => "LOSER",
            RunnerStatus::Removed => "REMOVED",
            RunnerStatus::RemovedVacant => "REMOVED_VACANT",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "WINNER" => RunnerStatus::Winner,
            "LOSER" => RunnerStatus::Loser,
            "REMOVED" => RunnerStatus::Removed,
            "REMOVED_VACANT" => RunnerStatus::RemovedVacant,
            _ => RunnerStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Scheduled,
    Closed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "SCHEDULED",
            EventStatus::Closed => "CLOSED",
        }
    }
}

/// Side of a shadow decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionSide {
    Back,
    Lay,
}

impl DecisionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSide::Back => "BACK",
            DecisionSide::Lay => "LAY",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "LAY" {
            DecisionSide::Lay
        } else {
            DecisionSide::Back
        }
    }
}

/// Outcome of a shadow decision. Progresses PENDING -> WIN/LOSE/VOID, never
/// backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionOutcome {
    Pending,
    Win,
    Lose,
    Void,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Pending => "PENDING",
            DecisionOutcome::Win => "WIN",
            DecisionOutcome::Lose => "LOSE",
            DecisionOutcome::Void => "VOID",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "WIN" => DecisionOutcome::Win,
            "LOSE" => DecisionOutcome::Lose,
            "VOID" => DecisionOutcome::Void,
            _ => DecisionOutcome::Pending,
        }
    }
}

/// System phase. PHASE3_LIVE exists as a sentinel only: no code path in this
/// repository derives it from data, and live trading stays disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingPhase {
    Phase1Collecting,
    Phase2Shadow,
    Phase3Live,
}

impl TradingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingPhase::Phase1Collecting => "PHASE1_COLLECTING",
            TradingPhase::Phase2Shadow => "PHASE2_SHADOW",
            TradingPhase::Phase3Live => "PHASE3_LIVE",
        }
    }
}

/// Pre-match time bucket, measured from the event's scheduled start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeBucket {
    Over72h,
    H24To72,
    H6To24,
    H2To6,
    Under2h,
    /// Snapshot captured after the scheduled start. Discarded at profiling.
    InPlay,
}

impl TimeBucket {
    pub fn from_hours_to_start(hours: f64) -> Self {
        if hours < 0.0 {
            TimeBucket::InPlay
        } else if hours < 2.0 {
            TimeBucket::Under2h
        } else if hours < 6.0 {
            TimeBucket::H2To6
        } else if hours < 24.0 {
            TimeBucket::H6To24
        } else if hours < 72.0 {
            TimeBucket::H24To72
        } else {
            TimeBucket::Over72h
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeBucket::Over72h => "72h+",
            TimeBucket::H24To72 => "24-72h",
            TimeBucket::H6To24 => "6-24h",
            TimeBucket::H2To6 => "2-6h",
            TimeBucket::Under2h => "<2h",
            TimeBucket::InPlay => "inplay",
        }
    }
}

/// Odds band classification from a mean price.
pub fn odds_band(price: f64) -> &'static str {
    if price < 1.01 {
        "Unknown"
    } else if price <= 1.50 {
        "Heavy Fav"
    } else if price <= 2.00 {
        "Favourite"
    } else if price <= 3.00 {
        "Even"
    } else if price <= 5.00 {
        "Underdog"
    } else {
        "Longshot"
    }
}

// ---------------------------------------------------------------------------
// Catalog entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Sport {
    pub id: i64,
    pub exchange_id: String,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Competition {
    pub id: i64,
    pub exchange_id: String,
    pub sport_id: i64,
    pub name: String,
    pub country_code: Option<String>,
    pub enabled: bool,
    /// "active" or "excluded" - excluded only for hard exclusions
    /// (friendlies, youth, reserves). Efficiency filtering is the scoring
    /// engine's job, not a naming heuristic.
    pub tier: String,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub exchange_id: String,
    pub competition_id: i64,
    pub name: String,
    pub scheduled_start: DateTime<Utc>,
    pub status: EventStatus,
}

#[derive(Debug, Clone)]
pub struct Market {
    pub id: i64,
    pub exchange_id: String,
    pub event_id: i64,
    pub name: String,
    pub market_type: String,
    pub total_matched: f64,
    pub status: MarketStatus,
    pub in_play: bool,
}

#[derive(Debug, Clone)]
pub struct Runner {
    pub id: i64,
    pub selection_id: i64,
    pub market_id: i64,
    pub name: String,
    pub sort_priority: Option<i64>,
    pub status: RunnerStatus,
}

// ---------------------------------------------------------------------------
// Ladder snapshots
// ---------------------------------------------------------------------------

/// One price level on a ladder side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

/// Per-runner ladder at an instant: best-first back and lay stacks plus
/// traded context. `runner_id` is the exchange selection id, denormalised so
/// snapshots survive runner-row churn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerLadder {
    pub runner_id: i64,
    pub last_traded: Option<f64>,
    pub total_matched: f64,
    pub back: Vec<PriceLevel>,
    pub lay: Vec<PriceLevel>,
}

/// Full ladder payload persisted as the snapshot's JSON column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderData {
    pub runners: Vec<RunnerLadder>,
    pub overround: f64,
    pub total_available: f64,
}

/// Point-in-time capture of market state. Append-only.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub id: i64,
    pub market_id: i64,
    pub captured_at: DateTime<Utc>,
    pub total_matched: f64,
    pub total_available: f64,
    pub overround: f64,
    pub ladder: LadderData,
}

// ---------------------------------------------------------------------------
// Profiles and scores
// ---------------------------------------------------------------------------

/// Aggregated daily metrics per market per time bucket. Upserted, last
/// writer wins per (market, date, bucket).
#[derive(Debug, Clone)]
pub struct MarketProfile {
    pub id: i64,
    pub market_id: i64,
    pub profile_date: NaiveDate,
    pub time_bucket: String,
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

/// Stored exploitability score row. Append-only; the latest score for a
/// market is the one with the maximum `scored_at`.
#[derive(Debug, Clone)]
pub struct ScoreRow {
    pub id: i64,
    pub market_id: i64,
    pub scored_at: DateTime<Utc>,
    pub time_bucket: String,
    pub odds_band: String,
    pub spread_score: f64,
    pub volatility_score: f64,
    pub update_score: f64,
    pub depth_score: f64,
    pub volume_penalty: f64,
    pub total_score: f64,
    pub config_version_id: Option<i64>,
}

// ---------------------------------------------------------------------------
// Closing data and results
// ---------------------------------------------------------------------------

/// Closing odds per runner, captured from the last pre-start snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingRunnerOdds {
    pub runner_id: i64,
    pub name: String,
    pub back_price: Option<f64>,
    pub lay_price: Option<f64>,
    pub last_traded: Option<f64>,
    pub total_matched: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingOdds {
    pub captured_at: DateTime<Utc>,
    pub total_matched: f64,
    pub runners: Vec<ClosingRunnerOdds>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerResult {
    pub runner_id: i64,
    pub name: String,
    pub status: String,
}

/// Settlement outcome recorded once the exchange reports the market CLOSED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResult {
    pub winner_runner_id: Option<i64>,
    pub winner_name: Option<String>,
    pub void: bool,
    pub runners: Vec<RunnerResult>,
}

/// Closing capture per market: unique per market, freshest pre-start capture
/// wins, settlement fields filled later.
#[derive(Debug, Clone)]
pub struct MarketClosingData {
    pub id: i64,
    pub market_id: i64,
    pub final_score_id: Option<i64>,
    pub final_score: Option<f64>,
    pub score_captured_at: Option<DateTime<Utc>>,
    pub closing_snapshot_id: Option<i64>,
    pub closing_odds: Option<ClosingOdds>,
    pub odds_captured_at: Option<DateTime<Utc>>,
    pub minutes_to_start: Option<i64>,
    pub settled_at: Option<DateTime<Utc>>,
    pub result: Option<SettlementResult>,
}

/// Post-event outcome per event. Scores may be heuristic (from the winner of
/// the match-odds market) until the correct-score pass confirms them.
#[derive(Debug, Clone)]
pub struct EventResult {
    pub id: i64,
    pub event_id: i64,
    pub status: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub home_score: Option<i64>,
    pub away_score: Option<i64>,
    pub total_goals: Option<i64>,
    pub btts: Option<bool>,
    pub statistics: Option<serde_json::Value>,
    pub source: String,
}

/// Daily per-competition score aggregates, learned from data rather than
/// configured.
#[derive(Debug, Clone)]
pub struct CompetitionStatsRow {
    pub id: i64,
    pub competition_id: i64,
    pub stats_date: NaiveDate,
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

// ---------------------------------------------------------------------------
// Shadow trading
// ---------------------------------------------------------------------------

/// Entry criteria for a trading hypothesis. Stored as a JSON column so new
/// clauses can be added without a schema change; absent clauses don't
/// constrain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryCriteria {
    #[serde(default)]
    pub min_score: f64,
    #[serde(default)]
    pub min_total_matched: f64,
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,
    #[serde(default)]
    pub min_minutes_to_start: i64,
    #[serde(default = "default_max_minutes")]
    pub max_minutes_to_start: i64,
    #[serde(default)]
    pub market_type_filter: Option<Vec<String>>,
    #[serde(default)]
    pub competition_filter: Option<Vec<i64>>,
    #[serde(default)]
    pub min_price_change_pct: f64,
    /// "steaming", "drifting", or absent for either direction.
    #[serde(default)]
    pub price_change_direction: Option<String>,
    #[serde(default = "default_change_window")]
    pub price_change_window_minutes: i64,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub max_total_matched: Option<f64>,
}

fn default_max_spread_pct() -> f64 {
    10.0
}

fn default_max_minutes() -> i64 {
    1440
}

fn default_change_window() -> i64 {
    60
}

impl Default for EntryCriteria {
    fn default() -> Self {
        Self {
            min_score: 0.0,
            min_total_matched: 0.0,
            max_spread_pct: default_max_spread_pct(),
            min_minutes_to_start: 0,
            max_minutes_to_start: default_max_minutes(),
            market_type_filter: None,
            competition_filter: None,
            min_price_change_pct: 0.0,
            price_change_direction: None,
            price_change_window_minutes: default_change_window(),
            min_price: None,
            max_price: None,
            max_total_matched: None,
        }
    }
}

/// A user-defined trading hypothesis with denormalised performance counters.
#[derive(Debug, Clone)]
pub struct TradingHypothesis {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub enabled: bool,
    pub entry_criteria: EntryCriteria,
    /// "momentum" or "contrarian"; interacts with the change direction to
    /// override the decision side.
    pub selection_logic: String,
    pub decision_side: DecisionSide,
    pub total_decisions: i64,
    pub total_wins: i64,
    pub total_losses: i64,
    pub total_pnl: f64,
    pub avg_clv: Option<f64>,
    pub last_decision_at: Option<DateTime<Utc>>,
}

/// A recorded hypothetical trade. Never executed on the exchange.
#[derive(Debug, Clone)]
pub struct ShadowDecision {
    pub id: i64,
    pub market_id: i64,
    pub runner_id: i64,
    pub side: DecisionSide,
    pub score_id: Option<i64>,
    pub trigger_score: f64,
    pub trigger_reason: String,
    pub decision_at: DateTime<Utc>,
    pub minutes_to_start: i64,
    pub entry_back_price: f64,
    pub entry_lay_price: f64,
    pub entry_spread: f64,
    pub available_to_back: f64,
    pub available_to_lay: f64,
    pub theoretical_stake: f64,
    pub hypothesis_id: i64,
    pub hypothesis_name: String,
    pub price_change_30m: Option<f64>,
    pub price_change_1h: Option<f64>,
    pub price_change_2h: Option<f64>,
    pub niche: String,
    pub competition_id: i64,
    pub closing_back_price: Option<f64>,
    pub closing_lay_price: Option<f64>,
    pub closing_mid_price: Option<f64>,
    pub clv_percent: Option<f64>,
    pub outcome: DecisionOutcome,
    pub settled_at: Option<DateTime<Utc>>,
    pub gross_pnl: Option<f64>,
    pub commission: Option<f64>,
    pub spread_cost: Option<f64>,
    pub net_pnl: Option<f64>,
    pub max_loss: Option<f64>,
    pub return_on_risk: Option<f64>,
}

// ---------------------------------------------------------------------------
// Job audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }
}

/// Audit record for one scheduled task execution.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: i64,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub records_processed: i64,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_bucket_boundaries() {
        assert_eq!(TimeBucket::from_hours_to_start(-0.5), TimeBucket::InPlay);
        assert_eq!(TimeBucket::from_hours_to_start(0.0), TimeBucket::Under2h);
        assert_eq!(TimeBucket::from_hours_to_start(1.99), TimeBucket::Under2h);
        assert_eq!(TimeBucket::from_hours_to_start(2.0), TimeBucket::H2To6);
        assert_eq!(TimeBucket::from_hours_to_start(5.99), TimeBucket::H2To6);
        assert_eq!(TimeBucket::from_hours_to_start(6.0), TimeBucket::H6To24);
        assert_eq!(TimeBucket::from_hours_to_start(23.5), TimeBucket::H6To24);
        assert_eq!(TimeBucket::from_hours_to_start(24.0), TimeBucket::H24To72);
        assert_eq!(TimeBucket::from_hours_to_start(71.9), TimeBucket::H24To72);
        assert_eq!(TimeBucket::from_hours_to_start(72.0), TimeBucket::Over72h);
        assert_eq!(TimeBucket::from_hours_to_start(500.0), TimeBucket::Over72h);
    }

    #[test]
    fn odds_bands() {
        assert_eq!(odds_band(1.005), "Unknown");
        assert_eq!(odds_band(1.20), "Heavy Fav");
        assert_eq!(odds_band(1.50), "Heavy Fav");
        assert_eq!(odds_band(1.80), "Favourite");
        assert_eq!(odds_band(2.50), "Even");
        assert_eq!(odds_band(4.00), "Underdog");
        assert_eq!(odds_band(12.0), "Longshot");
    }

    #[test]
    fn status_round_trips() {
        for s in [MarketStatus::Open, MarketStatus::Suspended, MarketStatus::Closed] {
            assert_eq!(MarketStatus::parse(s.as_str()), s);
        }
        for s in [
            RunnerStatus::Active,
            RunnerStatus::Winner,
            RunnerStatus::Loser,
            RunnerStatus::Removed,
            RunnerStatus::RemovedVacant,
        ] {
            assert_eq!(RunnerStatus::parse(s.as_str()), s);
        }
        assert_eq!(DecisionOutcome::parse("WIN"), DecisionOutcome::Win);
        assert_eq!(DecisionOutcome::parse("whatever"), DecisionOutcome::Pending);
    }

    #[test]
    fn entry_criteria_defaults_from_sparse_json() {
        let c: EntryCriteria = serde_json::from_str(r#"{"min_score": 40}"#).unwrap();
        assert_eq!(c.min_score, 40.0);
        assert_eq!(c.max_spread_pct, 10.0);
        assert_eq!(c.max_minutes_to_start, 1440);
        assert!(c.market_type_filter.is_none());
    }
}
