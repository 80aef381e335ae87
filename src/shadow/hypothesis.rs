//! Hypothesis engine: match momentum signals against user-defined
//! hypotheses and record shadow decisions.
//!
//! The signal net is cast wide (low change threshold, every eligible
//! market) and each hypothesis narrows it with its own entry criteria. One
//! decision per (market, hypothesis), ever.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::phase::PAPER_TRADING_DISCLAIMER;
use crate::config::ShadowTradingConfig;
use crate::models::{DecisionSide, MarketSnapshot, TradingHypothesis};
use crate::storage::{Database, MomentumMarket, NewShadowDecision};

/// Prices outside this band are not tradeable signals.
const MIN_BACK_PRICE: f64 = 1.10;
const MAX_BACK_PRICE: f64 = 50.0;
/// Changes above this magnitude are treated as data noise.
const MAX_CHANGE_PCT: f64 = 100.0;

/// A runner showing significant recent price movement.
#[derive(Debug, Clone)]
pub struct MomentumSignal {
    pub market_id: i64,
    pub runner_id: i64,
    pub runner_selection_id: i64,
    pub runner_name: String,
    pub event_name: String,
    pub competition_id: i64,
    pub competition_name: String,
    pub market_type: String,
    pub scheduled_start: DateTime<Utc>,
    pub minutes_to_start: i64,
    pub back_price: f64,
    pub lay_price: f64,
    pub spread_pct: f64,
    pub total_matched: f64,
    pub available_to_back: f64,
    pub available_to_lay: f64,
    /// Negative = steaming (shortening), positive = drifting (lengthening).
    pub change_30m: Option<f64>,
    pub change_1h: Option<f64>,
    pub change_2h: Option<f64>,
    pub exploitability_score: Option<f64>,
    pub score_id: Option<i64>,
}

/// A signal that satisfied a hypothesis's entry criteria.
#[derive(Debug)]
pub struct HypothesisMatch<'a> {
    pub hypothesis: &'a TradingHypothesis,
    pub signal: MomentumSignal,
    pub match_reason: String,
    pub side: DecisionSide,
}

#[derive(Debug, Default, Serialize)]
pub struct HypothesisStats {
    pub hypotheses_evaluated: usize,
    pub signals_found: usize,
    pub decisions_created: usize,
    pub skipped_existing: usize,
    pub errors: usize,
}

pub struct HypothesisEngine {
    db: Database,
    config: ShadowTradingConfig,
}

impl HypothesisEngine {
    pub fn new(db: Database, config: ShadowTradingConfig) -> Self {
        Self { db, config }
    }

    /// Main entry point: evaluate every enabled hypothesis against current
    /// momentum signals. Call only in PHASE2_SHADOW.
    pub fn evaluate_hypotheses(&self) -> anyhow::Result<HypothesisStats> {
        let mut stats = HypothesisStats::default();

        let hypotheses = self.db.enabled_hypotheses()?;
        stats.hypotheses_evaluated = hypotheses.len();
        if hypotheses.is_empty() {
            info!("no_active_hypotheses");
            return Ok(stats);
        }

        // Low threshold here; each hypothesis applies its own.
        let signals = self.find_momentum_signals(2.0, 24, 0.0)?;
        stats.signals_found = signals.len();

        for hypothesis in &hypotheses {
            for candidate in &signals {
                let Some(m) = self.matches_hypothesis(hypothesis, candidate) else {
                    continue;
                };
                let signal = &m.signal;
                let hypothesis = m.hypothesis;

                if self.db.decision_exists(signal.market_id, hypothesis.id)? {
                    stats.skipped_existing += 1;
                    continue;
                }

                let trigger_reason =
                    format!("Hypothesis '{}': {}", hypothesis.name, m.match_reason);
                let niche = format!("{} - {}", signal.competition_name, signal.market_type);
                let inserted = self.db.insert_decision(&NewShadowDecision {
                    market_id: signal.market_id,
                    runner_id: signal.runner_id,
                    side: m.side,
                    score_id: signal.score_id,
                    trigger_score: signal.exploitability_score.unwrap_or(0.0),
                    trigger_reason: &trigger_reason,
                    decision_at: Utc::now(),
                    minutes_to_start: signal.minutes_to_start,
                    entry_back_price: signal.back_price,
                    entry_lay_price: signal.lay_price,
                    entry_spread: signal.spread_pct,
                    available_to_back: signal.available_to_back,
                    available_to_lay: signal.available_to_lay,
                    theoretical_stake: self.config.stake.base_stake,
                    hypothesis_id: hypothesis.id,
                    hypothesis_name: &hypothesis.name,
                    price_change_30m: signal.change_30m,
                    price_change_1h: signal.change_1h,
                    price_change_2h: signal.change_2h,
                    niche: &niche,
                    competition_id: signal.competition_id,
                })?;

                if inserted.is_some() {
                    stats.decisions_created += 1;
                    info!(
                        hypothesis = %hypothesis.name,
                        market_id = signal.market_id,
                        runner = %signal.runner_name,
                        side = m.side.as_str(),
                        reason = %m.match_reason,
                        entry_price = if m.side == DecisionSide::Back {
                            signal.back_price
                        } else {
                            signal.lay_price
                        },
                        disclaimer = PAPER_TRADING_DISCLAIMER,
                        "shadow_decision_created"
                    );
                } else {
                    stats.skipped_existing += 1;
                }
            }
        }

        info!(
            hypotheses = stats.hypotheses_evaluated,
            signals = stats.signals_found,
            created = stats.decisions_created,
            skipped = stats.skipped_existing,
            "hypothesis_evaluation_complete"
        );
        Ok(stats)
    }

    /// Find runners with significant recent movement across eligible
    /// markets: open, pre-match, non-handicap, starting within
    /// `hours_ahead`.
    pub fn find_momentum_signals(
        &self,
        min_change_pct: f64,
        hours_ahead: i64,
        min_score: f64,
    ) -> anyhow::Result<Vec<MomentumSignal>> {
        let now = Utc::now();
        let markets = self.db.momentum_markets(now, now + Duration::hours(hours_ahead))?;

        let mut signals = Vec::new();
        for market in markets {
            match self.extract_market_signals(&market, now, min_change_pct, min_score) {
                Ok(mut market_signals) => signals.append(&mut market_signals),
                Err(e) => {
                    warn!(market_id = market.market_id, error = %e, "signal_extraction_error");
                }
            }
        }
        Ok(signals)
    }

    fn extract_market_signals(
        &self,
        market: &MomentumMarket,
        now: DateTime<Utc>,
        min_change_pct: f64,
        min_score: f64,
    ) -> anyhow::Result<Vec<MomentumSignal>> {
        let mut signals = Vec::new();

        let Some(current) = self.db.latest_snapshot(market.market_id)? else {
            return Ok(signals);
        };

        let latest_score = self.db.latest_score(market.market_id)?;
        if let Some(score) = &latest_score {
            if score.total_score < min_score {
                return Ok(signals);
            }
        }

        // Historical reference points: the most recent snapshot in each
        // look-back window.
        let snap_30m = self.db.latest_snapshot_in_window(
            market.market_id,
            now - Duration::minutes(45),
            now - Duration::minutes(25),
        )?;
        let snap_1h = self.db.latest_snapshot_in_window(
            market.market_id,
            now - Duration::minutes(90),
            now - Duration::minutes(45),
        )?;
        let snap_2h = self.db.latest_snapshot_in_window(
            market.market_id,
            now - Duration::minutes(180),
            now - Duration::minutes(90),
        )?;

        let runner_map: std::collections::HashMap<i64, (i64, String)> = self
            .db
            .runners_for_market(market.market_id)?
            .into_iter()
            .map(|r| (r.selection_id, (r.id, r.name)))
            .collect();

        let minutes_to_start = ((market.scheduled_start - now).num_seconds() / 60).max(0);

        for ladder_runner in &current.ladder.runners {
            let Some((runner_db_id, runner_name)) = runner_map.get(&ladder_runner.runner_id)
            else {
                continue;
            };

            let Some(best_back) = ladder_runner.back.first() else {
                continue;
            };
            let back_price = best_back.price;
            if back_price <= 0.0 || back_price < MIN_BACK_PRICE || back_price > MAX_BACK_PRICE {
                continue;
            }
            let (lay_price, available_to_lay) = match ladder_runner.lay.first() {
                Some(level) => (level.price, level.size),
                None => (back_price * 1.02, 0.0),
            };

            let spread_pct = (lay_price - back_price) / back_price * 100.0;

            let change_30m = price_change(back_price, &snap_30m, ladder_runner.runner_id);
            let change_1h = price_change(back_price, &snap_1h, ladder_runner.runner_id);
            let change_2h = price_change(back_price, &snap_2h, ladder_runner.runner_id);

            let primary = change_2h.or(change_1h).or(change_30m);
            let Some(primary) = primary else { continue };
            if primary.abs() < min_change_pct || primary.abs() > MAX_CHANGE_PCT {
                continue;
            }

            signals.push(MomentumSignal {
                market_id: market.market_id,
                runner_id: *runner_db_id,
                runner_selection_id: ladder_runner.runner_id,
                runner_name: runner_name.clone(),
                event_name: market.event_name.clone(),
                competition_id: market.competition_id,
                competition_name: market.competition_name.clone(),
                market_type: market.market_type.clone(),
                scheduled_start: market.scheduled_start,
                minutes_to_start,
                back_price,
                lay_price,
                spread_pct,
                total_matched: current.total_matched,
                available_to_back: best_back.size,
                available_to_lay,
                change_30m,
                change_1h,
                change_2h,
                exploitability_score: latest_score.as_ref().map(|s| s.total_score),
                score_id: latest_score.as_ref().map(|s| s.id),
            });
        }

        Ok(signals)
    }

    /// Check a signal against a hypothesis's entry criteria. All applicable
    /// clauses must hold.
    pub fn matches_hypothesis<'a>(
        &self,
        hypothesis: &'a TradingHypothesis,
        signal: &MomentumSignal,
    ) -> Option<HypothesisMatch<'a>> {
        // Market-type rule from shadow config comes first: a disabled type
        // is never traded regardless of hypothesis criteria.
        let rule = self.config.market_rule(&signal.market_type);
        if !rule.enabled {
            return None;
        }
        if let Some(pattern) = &rule.runner_name_pattern {
            if !signal.runner_name.contains(pattern.as_str()) {
                return None;
            }
        }

        let criteria = &hypothesis.entry_criteria;
        let mut reasons = Vec::new();

        if criteria.min_score > 0.0 {
            match signal.exploitability_score {
                Some(score) if score >= criteria.min_score => {
                    reasons.push(format!("score {score:.0} >= {:.0}", criteria.min_score));
                }
                _ => return None,
            }
        }

        if signal.minutes_to_start < criteria.min_minutes_to_start
            || signal.minutes_to_start > criteria.max_minutes_to_start
        {
            return None;
        }
        reasons.push(format!("{}m to start", signal.minutes_to_start));

        if signal.spread_pct > criteria.max_spread_pct {
            return None;
        }
        if signal.total_matched < criteria.min_total_matched {
            return None;
        }
        if let Some(max_matched) = criteria.max_total_matched {
            if signal.total_matched > max_matched {
                return None;
            }
        }
        if let Some(min_price) = criteria.min_price {
            if signal.back_price < min_price {
                return None;
            }
        }
        if let Some(max_price) = criteria.max_price {
            if signal.back_price > max_price {
                return None;
            }
        }
        if let Some(types) = &criteria.market_type_filter {
            if !types.iter().any(|t| t == &signal.market_type) {
                return None;
            }
        }
        if let Some(competitions) = &criteria.competition_filter {
            if !competitions.contains(&signal.competition_id) {
                return None;
            }
        }

        // Momentum clause: pick the change matching the hypothesis window.
        let change = if criteria.price_change_window_minutes <= 30 {
            signal.change_30m
        } else if criteria.price_change_window_minutes <= 60 {
            signal.change_1h.or(signal.change_30m)
        } else {
            signal.change_2h.or(signal.change_1h).or(signal.change_30m)
        };

        if change.is_none() && criteria.min_price_change_pct > 0.0 {
            return None;
        }

        if let Some(change) = change {
            match criteria.price_change_direction.as_deref() {
                Some("steaming") => {
                    if change >= 0.0 || change.abs() < criteria.min_price_change_pct {
                        return None;
                    }
                    reasons.push(format!("steaming {:.1}%", change.abs()));
                }
                Some("drifting") => {
                    if change <= 0.0 || change < criteria.min_price_change_pct {
                        return None;
                    }
                    reasons.push(format!("drifting {change:.1}%"));
                }
                _ => {
                    if criteria.min_price_change_pct > 0.0 {
                        if change.abs() < criteria.min_price_change_pct {
                            return None;
                        }
                        let direction = if change < 0.0 { "steaming" } else { "drifting" };
                        reasons.push(format!("{direction} {:.1}%", change.abs()));
                    }
                }
            }
        }

        // The hypothesis's configured side, except where direction and
        // selection logic pin it: following steam means backing, fading a
        // drift means laying.
        let mut side = hypothesis.decision_side;
        match criteria.price_change_direction.as_deref() {
            Some("steaming") if hypothesis.selection_logic == "momentum" => {
                side = DecisionSide::Back;
            }
            Some("drifting") if hypothesis.selection_logic == "contrarian" => {
                side = DecisionSide::Lay;
            }
            _ => {}
        }

        Some(HypothesisMatch {
            hypothesis,
            signal: signal.clone(),
            match_reason: reasons.join(", "),
            side,
        })
    }
}

/// Percentage change of the current best back against the historical
/// snapshot's best back for the same runner.
fn price_change(
    current_back: f64,
    historical: &Option<MarketSnapshot>,
    selection_id: i64,
) -> Option<f64> {
    let snapshot = historical.as_ref()?;
    let runner = snapshot
        .ladder
        .runners
        .iter()
        .find(|r| r.runner_id == selection_id)?;
    let old_price = runner.back.first()?.price;
    if old_price <= 0.0 {
        return None;
    }
    Some((current_back - old_price) / old_price * 100.0)
}
