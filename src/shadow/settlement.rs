//! Shadow settler: closing-mid capture, CLV and theoretical P&L.
//!
//! CLV is measured against the closing mid, not the closing back/lay
//! separately, and return-on-risk (net over max loss) is the only metric
//! that compares BACK and LAY hypotheses fairly: a winning lay at 4.0
//! risks three times its stake to win one.

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::phase::PAPER_TRADING_DISCLAIMER;
use crate::models::{DecisionOutcome, DecisionSide, RunnerStatus};
use crate::storage::Database;

/// Closing mids are captured for decisions whose event starts within this
/// window around now.
const MID_WINDOW_BEFORE_START_MINUTES: i64 = 5;
const MID_WINDOW_AFTER_START_HOURS: i64 = 2;
/// Settlement waits this long after the scheduled start.
const SETTLE_AFTER_HOURS: i64 = 2;

/// Mid-based closing line value, in percent. Positive = beat the close.
pub fn clv_percent(side: DecisionSide, entry_back: f64, entry_lay: f64, closing_mid: f64) -> f64 {
    match side {
        // Backed at higher odds than the close: good.
        DecisionSide::Back => {
            if closing_mid <= 0.0 {
                return 0.0;
            }
            (entry_back - closing_mid) / closing_mid * 100.0
        }
        // Laid at lower odds than the close: good.
        DecisionSide::Lay => {
            if entry_lay <= 0.0 {
                return 0.0;
            }
            (closing_mid - entry_lay) / entry_lay * 100.0
        }
    }
}

/// Theoretical P&L for a settled decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnL {
    pub gross: f64,
    pub commission: f64,
    pub net: f64,
    pub max_loss: f64,
    pub return_on_risk: f64,
}

/// Commission applies to winnings only. VOID zeroes everything.
pub fn compute_pnl(
    side: DecisionSide,
    outcome: DecisionOutcome,
    stake: f64,
    price: f64,
    commission_rate: f64,
) -> PnL {
    let max_loss = match side {
        DecisionSide::Back => stake,
        DecisionSide::Lay => stake * (price - 1.0),
    };

    let (gross, commission) = match (side, outcome) {
        (_, DecisionOutcome::Void) => (0.0, 0.0),
        (DecisionSide::Back, DecisionOutcome::Win) => {
            let gross = stake * (price - 1.0);
            (gross, gross * commission_rate)
        }
        (DecisionSide::Back, _) => (-stake, 0.0),
        (DecisionSide::Lay, DecisionOutcome::Win) => (stake, stake * commission_rate),
        (DecisionSide::Lay, _) => (-stake * (price - 1.0), 0.0),
    };

    let net = gross - commission;
    let max_loss = if outcome == DecisionOutcome::Void { 0.0 } else { max_loss };
    let return_on_risk = if max_loss > 0.0 { net / max_loss } else { 0.0 };

    PnL {
        gross,
        commission,
        net,
        max_loss,
        return_on_risk,
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ClosingMidStats {
    pub decisions_checked: usize,
    pub mids_captured: usize,
    pub no_snapshot: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct ShadowSettlementStats {
    pub decisions_checked: usize,
    pub settled_wins: usize,
    pub settled_losses: usize,
    pub voided: usize,
    pub still_unresolved: usize,
    pub net_pnl: f64,
}

pub struct ShadowSettler {
    db: Database,
    commission_rate: f64,
}

impl ShadowSettler {
    pub fn new(db: Database, commission_rate: f64) -> Self {
        Self { db, commission_rate }
    }

    /// Copy closing back/lay/mid onto decisions whose events are at or just
    /// past kickoff, and compute CLV against the mid.
    pub fn capture_closing_mids(&self) -> anyhow::Result<ClosingMidStats> {
        let mut stats = ClosingMidStats::default();
        let now = Utc::now();

        let awaiting = self.db.decisions_awaiting_closing(
            now - Duration::hours(MID_WINDOW_AFTER_START_HOURS),
            now + Duration::minutes(MID_WINDOW_BEFORE_START_MINUTES),
        )?;
        stats.decisions_checked = awaiting.len();

        for (decision, selection_id) in awaiting {
            let Some(snapshot) = self.db.latest_snapshot(decision.market_id)? else {
                stats.no_snapshot += 1;
                continue;
            };
            let runner = snapshot
                .ladder
                .runners
                .iter()
                .find(|r| r.runner_id == selection_id);
            let Some(runner) = runner else {
                stats.no_snapshot += 1;
                continue;
            };
            let (Some(back), Some(lay)) = (runner.back.first(), runner.lay.first()) else {
                stats.no_snapshot += 1;
                continue;
            };

            let closing_mid = (back.price + lay.price) / 2.0;
            let clv = clv_percent(
                decision.side,
                decision.entry_back_price,
                decision.entry_lay_price,
                closing_mid,
            );
            self.db
                .set_decision_closing(decision.id, back.price, lay.price, closing_mid, clv)?;
            stats.mids_captured += 1;
            debug!(
                decision_id = decision.id,
                closing_mid,
                clv_percent = clv,
                "closing_mid_captured"
            );
        }

        info!(
            checked = stats.decisions_checked,
            captured = stats.mids_captured,
            missing = stats.no_snapshot,
            "closing_mid_capture_complete"
        );
        Ok(stats)
    }

    /// Settle pending decisions against runner outcomes. Each decision is
    /// processed independently; one failure does not abort the batch.
    pub fn settle_decisions(&self) -> anyhow::Result<ShadowSettlementStats> {
        let mut stats = ShadowSettlementStats::default();
        let now = Utc::now();

        let pending = self
            .db
            .pending_decisions_started_before(now - Duration::hours(SETTLE_AFTER_HOURS))?;
        stats.decisions_checked = pending.len();

        let mut touched_hypotheses = std::collections::HashSet::new();

        for (decision, runner_status) in pending {
            let outcome = match (runner_status, decision.side) {
                (RunnerStatus::Winner, DecisionSide::Back) => DecisionOutcome::Win,
                (RunnerStatus::Winner, DecisionSide::Lay) => DecisionOutcome::Lose,
                (RunnerStatus::Loser, DecisionSide::Back) => DecisionOutcome::Lose,
                (RunnerStatus::Loser, DecisionSide::Lay) => DecisionOutcome::Win,
                (RunnerStatus::Removed | RunnerStatus::RemovedVacant, _) => DecisionOutcome::Void,
                (RunnerStatus::Active, _) => {
                    stats.still_unresolved += 1;
                    continue;
                }
            };

            let entry_price = match decision.side {
                DecisionSide::Back => decision.entry_back_price,
                DecisionSide::Lay => decision.entry_lay_price,
            };
            let pnl = compute_pnl(
                decision.side,
                outcome,
                decision.theoretical_stake,
                entry_price,
                self.commission_rate,
            );
            // Informational: what crossing the entry spread would have cost.
            let spread_cost = if outcome == DecisionOutcome::Void {
                0.0
            } else {
                decision.theoretical_stake * decision.entry_spread / 100.0
            };

            if let Err(e) = self.db.settle_decision(
                decision.id,
                outcome,
                now,
                pnl.gross,
                pnl.commission,
                spread_cost,
                pnl.net,
                pnl.max_loss,
                pnl.return_on_risk,
            ) {
                warn!(decision_id = decision.id, error = %e, "decision_settlement_error");
                continue;
            }

            match outcome {
                DecisionOutcome::Win => stats.settled_wins += 1,
                DecisionOutcome::Lose => stats.settled_losses += 1,
                DecisionOutcome::Void => stats.voided += 1,
                DecisionOutcome::Pending => {}
            }
            stats.net_pnl += pnl.net;
            touched_hypotheses.insert(decision.hypothesis_id);

            debug!(
                decision_id = decision.id,
                outcome = outcome.as_str(),
                net_pnl = pnl.net,
                return_on_risk = pnl.return_on_risk,
                "shadow_decision_settled"
            );
        }

        for hypothesis_id in touched_hypotheses {
            self.db.refresh_hypothesis_counters(hypothesis_id)?;
        }

        info!(
            checked = stats.decisions_checked,
            wins = stats.settled_wins,
            losses = stats.settled_losses,
            voids = stats.voided,
            net_pnl = stats.net_pnl,
            disclaimer = PAPER_TRADING_DISCLAIMER,
            "shadow_settlement_complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_win_at_three_with_two_percent_commission() {
        let pnl = compute_pnl(DecisionSide::Back, DecisionOutcome::Win, 10.0, 3.0, 0.02);
        assert!((pnl.gross - 20.0).abs() < 1e-9);
        assert!((pnl.commission - 0.40).abs() < 1e-9);
        assert!((pnl.net - 19.6).abs() < 1e-9);
        assert!((pnl.max_loss - 10.0).abs() < 1e-9);
        assert!((pnl.return_on_risk - 1.96).abs() < 1e-9);
    }

    #[test]
    fn lay_win_at_four_with_two_percent_commission() {
        let pnl = compute_pnl(DecisionSide::Lay, DecisionOutcome::Win, 10.0, 4.0, 0.02);
        assert!((pnl.gross - 10.0).abs() < 1e-9);
        assert!((pnl.commission - 0.20).abs() < 1e-9);
        assert!((pnl.net - 9.8).abs() < 1e-9);
        assert!((pnl.max_loss - 30.0).abs() < 1e-9);
        assert!((pnl.return_on_risk - 0.3267).abs() < 1e-4);
    }

    #[test]
    fn back_lose_costs_the_stake() {
        let pnl = compute_pnl(DecisionSide::Back, DecisionOutcome::Lose, 10.0, 3.0, 0.02);
        assert!((pnl.gross - -10.0).abs() < 1e-9);
        assert_eq!(pnl.commission, 0.0);
        assert!((pnl.net - -10.0).abs() < 1e-9);
        assert!((pnl.return_on_risk - -1.0).abs() < 1e-9);
    }

    #[test]
    fn lay_lose_costs_liability() {
        let pnl = compute_pnl(DecisionSide::Lay, DecisionOutcome::Lose, 10.0, 4.0, 0.02);
        assert!((pnl.gross - -30.0).abs() < 1e-9);
        assert!((pnl.net - -30.0).abs() < 1e-9);
        assert!((pnl.max_loss - 30.0).abs() < 1e-9);
        assert!((pnl.return_on_risk - -1.0).abs() < 1e-9);
    }

    #[test]
    fn void_zeroes_everything() {
        for side in [DecisionSide::Back, DecisionSide::Lay] {
            let pnl = compute_pnl(side, DecisionOutcome::Void, 10.0, 4.0, 0.02);
            assert_eq!(pnl.gross, 0.0);
            assert_eq!(pnl.commission, 0.0);
            assert_eq!(pnl.net, 0.0);
            assert_eq!(pnl.max_loss, 0.0);
            assert_eq!(pnl.return_on_risk, 0.0);
        }
    }

    #[test]
    fn clv_back_rewards_higher_entry_than_close() {
        // Backed at 3.0, closed at mid 2.85: positive CLV.
        let clv = clv_percent(DecisionSide::Back, 3.0, 3.05, 2.85);
        assert!((clv - ((3.0 - 2.85) / 2.85 * 100.0)).abs() < 1e-9);
        assert!(clv > 0.0);
        // Steamed the wrong way: negative.
        assert!(clv_percent(DecisionSide::Back, 3.0, 3.05, 3.2) < 0.0);
    }

    #[test]
    fn clv_lay_rewards_lower_entry_than_close() {
        // Laid at 3.05, closed at mid 3.5: the price drifted away, good lay.
        let clv = clv_percent(DecisionSide::Lay, 3.0, 3.05, 3.5);
        assert!((clv - ((3.5 - 3.05) / 3.05 * 100.0)).abs() < 1e-9);
        assert!(clv > 0.0);
        assert!(clv_percent(DecisionSide::Lay, 3.0, 3.05, 2.8) < 0.0);
    }

    #[test]
    fn clv_degenerate_inputs_are_zero() {
        assert_eq!(clv_percent(DecisionSide::Back, 3.0, 3.05, 0.0), 0.0);
        assert_eq!(clv_percent(DecisionSide::Lay, 3.0, 0.0, 2.8), 0.0);
    }
}
