//! Shadow-trading storage: hypotheses, decisions and the momentum work list.
//!
//! All figures here are theoretical. Decisions are unique per
//! (market, hypothesis) at the schema level, so the engine can retry freely.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{fmt_ts, parse_ts, Database};
use crate::models::{
    DecisionOutcome, DecisionSide, EntryCriteria, RunnerStatus, ShadowDecision, TradingHypothesis,
};

fn hypothesis_from_row(row: &Row<'_>) -> rusqlite::Result<TradingHypothesis> {
    let criteria_json: String = row.get(5)?;
    Ok(TradingHypothesis {
        id: row.get(0)?,
        name: row.get(1)?,
        display_name: row.get(2)?,
        description: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        entry_criteria: serde_json::from_str(&criteria_json).unwrap_or_default(),
        selection_logic: row.get(6)?,
        decision_side: DecisionSide::parse(&row.get::<_, String>(7)?),
        total_decisions: row.get(8)?,
        total_wins: row.get(9)?,
        total_losses: row.get(10)?,
        total_pnl: row.get(11)?,
        avg_clv: row.get(12)?,
        last_decision_at: row.get::<_, Option<String>>(13)?.map(|s| parse_ts(&s)),
    })
}

const HYPOTHESIS_COLS: &str = "id, name, display_name, description, enabled, \
     entry_criteria_json, selection_logic, decision_side, total_decisions, total_wins, \
     total_losses, total_pnl, avg_clv, last_decision_at";

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<ShadowDecision> {
    Ok(ShadowDecision {
        id: row.get(0)?,
        market_id: row.get(1)?,
        runner_id: row.get(2)?,
        side: DecisionSide::parse(&row.get::<_, String>(3)?),
        score_id: row.get(4)?,
        trigger_score: row.get(5)?,
        trigger_reason: row.get(6)?,
        decision_at: parse_ts(&row.get::<_, String>(7)?),
        minutes_to_start: row.get(8)?,
        entry_back_price: row.get(9)?,
        entry_lay_price: row.get(10)?,
        entry_spread: row.get(11)?,
        available_to_back: row.get(12)?,
        available_to_lay: row.get(13)?,
        theoretical_stake: row.get(14)?,
        hypothesis_id: row.get(15)?,
        hypothesis_name: row.get(16)?,
        price_change_30m: row.get(17)?,
        price_change_1h: row.get(18)?,
        price_change_2h: row.get(19)?,
        niche: row.get(20)?,
        competition_id: row.get::<_, Option<i64>>(21)?.unwrap_or(0),
        closing_back_price: row.get(22)?,
        closing_lay_price: row.get(23)?,
        closing_mid_price: row.get(24)?,
        clv_percent: row.get(25)?,
        outcome: DecisionOutcome::parse(&row.get::<_, String>(26)?),
        settled_at: row.get::<_, Option<String>>(27)?.map(|s| parse_ts(&s)),
        gross_pnl: row.get(28)?,
        commission: row.get(29)?,
        spread_cost: row.get(30)?,
        net_pnl: row.get(31)?,
        max_loss: row.get(32)?,
        return_on_risk: row.get(33)?,
    })
}

const DECISION_COLS: &str = "id, market_id, runner_id, side, score_id, trigger_score, \
     trigger_reason, decision_at, minutes_to_start, entry_back_price, entry_lay_price, \
     entry_spread, available_to_back, available_to_lay, theoretical_stake, hypothesis_id, \
     hypothesis_name, price_change_30m, price_change_1h, price_change_2h, niche, \
     competition_id, closing_back_price, closing_lay_price, closing_mid_price, clv_percent, \
     outcome, settled_at, gross_pnl, commission, spread_cost, net_pnl, max_loss, return_on_risk";

/// Markets eligible for momentum scanning. Handicap types are excluded
/// because line moves swing prices far beyond what the noise cap tolerates.
#[derive(Debug, Clone)]
pub struct MomentumMarket {
    pub market_id: i64,
    pub market_type: String,
    pub event_id: i64,
    pub event_name: String,
    pub scheduled_start: DateTime<Utc>,
    pub competition_id: i64,
    pub competition_name: String,
}

pub struct NewShadowDecision<'a> {
    pub market_id: i64,
    pub runner_id: i64,
    pub side: DecisionSide,
    pub score_id: Option<i64>,
    pub trigger_score: f64,
    pub trigger_reason: &'a str,
    pub decision_at: DateTime<Utc>,
    pub minutes_to_start: i64,
    pub entry_back_price: f64,
    pub entry_lay_price: f64,
    pub entry_spread: f64,
    pub available_to_back: f64,
    pub available_to_lay: f64,
    pub theoretical_stake: f64,
    pub hypothesis_id: i64,
    pub hypothesis_name: &'a str,
    pub price_change_30m: Option<f64>,
    pub price_change_1h: Option<f64>,
    pub price_change_2h: Option<f64>,
    pub niche: &'a str,
    pub competition_id: i64,
}

impl Database {
    /// Seed the default hypotheses if they are not present. Existing rows
    /// (including user edits) are left alone.
    pub fn seed_default_hypotheses(&self) -> Result<()> {
        let defaults: [(&str, &str, &str, &str, DecisionSide, EntryCriteria); 3] = [
            (
                "steam_follower",
                "Steam Follower",
                "Back selections showing significant price shortening in thin pre-match markets",
                "momentum",
                DecisionSide::Back,
                EntryCriteria {
                    min_total_matched: 5000.0,
                    max_spread_pct: 5.0,
                    min_minutes_to_start: 360,
                    max_minutes_to_start: 1440,
                    min_price_change_pct: 5.0,
                    price_change_direction: Some("steaming".to_string()),
                    price_change_window_minutes: 120,
                    ..EntryCriteria::default()
                },
            ),
            (
                "drift_fader",
                "Drift Fader",
                "Lay selections drifting hard without matching volume",
                "contrarian",
                DecisionSide::Lay,
                EntryCriteria {
                    min_total_matched: 5000.0,
                    max_spread_pct: 5.0,
                    min_minutes_to_start: 360,
                    max_minutes_to_start: 1440,
                    min_price_change_pct: 8.0,
                    price_change_direction: Some("drifting".to_string()),
                    price_change_window_minutes: 120,
                    ..EntryCriteria::default()
                },
            ),
            (
                "score_based_classic",
                "Score Based Classic",
                "Traditional score-threshold entry on structurally exploitable markets",
                "momentum",
                DecisionSide::Back,
                EntryCriteria {
                    min_score: 55.0,
                    min_total_matched: 5000.0,
                    max_spread_pct: 5.0,
                    min_minutes_to_start: 360,
                    max_minutes_to_start: 1440,
                    min_price_change_pct: 3.0,
                    ..EntryCriteria::default()
                },
            ),
        ];

        let conn = self.conn();
        let now = fmt_ts(Utc::now());
        for (name, display, description, logic, side, criteria) in defaults {
            let criteria_json =
                serde_json::to_string(&criteria).context("serialise entry criteria")?;
            conn.execute(
                "INSERT INTO trading_hypotheses
                    (name, display_name, description, enabled, entry_criteria_json,
                     selection_logic, decision_side, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7)
                 ON CONFLICT(name) DO NOTHING",
                params![name, display, description, criteria_json, logic, side.as_str(), now],
            )?;
        }
        Ok(())
    }

    pub fn enabled_hypotheses(&self) -> Result<Vec<TradingHypothesis>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {HYPOTHESIS_COLS} FROM trading_hypotheses WHERE enabled = 1"
        ))?;
        let rows = stmt
            .query_map([], hypothesis_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn hypothesis_by_name(&self, name: &str) -> Result<Option<TradingHypothesis>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {HYPOTHESIS_COLS} FROM trading_hypotheses WHERE name = ?1"),
                params![name],
                hypothesis_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn decision_exists(&self, market_id: i64, hypothesis_id: i64) -> Result<bool> {
        let conn = self.conn();
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM shadow_decisions WHERE market_id = ?1 AND hypothesis_id = ?2",
                params![market_id, hypothesis_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.is_some())
    }

    /// Insert a decision with outcome PENDING. Returns None when a decision
    /// for this (market, hypothesis) already exists.
    pub fn insert_decision(&self, d: &NewShadowDecision<'_>) -> Result<Option<i64>> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO shadow_decisions
                (market_id, runner_id, side, score_id, trigger_score, trigger_reason,
                 decision_at, minutes_to_start, entry_back_price, entry_lay_price, entry_spread,
                 available_to_back, available_to_lay, theoretical_stake, hypothesis_id,
                 hypothesis_name, price_change_30m, price_change_1h, price_change_2h, niche,
                 competition_id, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, 'PENDING', ?22)",
            params![
                d.market_id,
                d.runner_id,
                d.side.as_str(),
                d.score_id,
                d.trigger_score,
                d.trigger_reason,
                fmt_ts(d.decision_at),
                d.minutes_to_start,
                d.entry_back_price,
                d.entry_lay_price,
                d.entry_spread,
                d.available_to_back,
                d.available_to_lay,
                d.theoretical_stake,
                d.hypothesis_id,
                d.hypothesis_name,
                d.price_change_30m,
                d.price_change_1h,
                d.price_change_2h,
                d.niche,
                d.competition_id,
                fmt_ts(Utc::now()),
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn decision(&self, id: i64) -> Result<Option<ShadowDecision>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {DECISION_COLS} FROM shadow_decisions WHERE id = ?1"),
                params![id],
                decision_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn decisions_for_market(&self, market_id: i64) -> Result<Vec<ShadowDecision>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DECISION_COLS} FROM shadow_decisions WHERE market_id = ?1"
        ))?;
        let rows = stmt
            .query_map(params![market_id], decision_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Decisions without closing prices whose event starts inside
    /// [now - 2h, now + 5min], paired with the runner's selection id so the
    /// caller can find it on the ladder.
    pub fn decisions_awaiting_closing(
        &self,
        start_after: DateTime<Utc>,
        start_before: DateTime<Utc>,
    ) -> Result<Vec<(ShadowDecision, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols}, r.selection_id
             FROM shadow_decisions d
             JOIN runners r ON d.runner_id = r.id
             JOIN markets m ON d.market_id = m.id
             JOIN events e ON m.event_id = e.id
             WHERE d.closing_mid_price IS NULL
               AND e.scheduled_start >= ?1 AND e.scheduled_start <= ?2",
            cols = DECISION_COLS
                .split(", ")
                .map(|c| format!("d.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let rows = stmt
            .query_map(params![fmt_ts(start_after), fmt_ts(start_before)], |row| {
                let decision = decision_from_row(row)?;
                let selection_id: i64 = row.get(34)?;
                Ok((decision, selection_id))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_decision_closing(
        &self,
        decision_id: i64,
        closing_back: f64,
        closing_lay: f64,
        closing_mid: f64,
        clv_percent: f64,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE shadow_decisions
             SET closing_back_price = ?1, closing_lay_price = ?2, closing_mid_price = ?3,
                 clv_percent = ?4
             WHERE id = ?5",
            params![closing_back, closing_lay, closing_mid, clv_percent, decision_id],
        )?;
        Ok(())
    }

    /// PENDING decisions whose event started before `cutoff`, with the
    /// current runner status for settlement.
    pub fn pending_decisions_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(ShadowDecision, RunnerStatus)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols}, r.status
             FROM shadow_decisions d
             JOIN runners r ON d.runner_id = r.id
             JOIN markets m ON d.market_id = m.id
             JOIN events e ON m.event_id = e.id
             WHERE d.outcome = 'PENDING' AND e.scheduled_start <= ?1",
            cols = DECISION_COLS
                .split(", ")
                .map(|c| format!("d.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let rows = stmt
            .query_map(params![fmt_ts(cutoff)], |row| {
                let decision = decision_from_row(row)?;
                let status: String = row.get(34)?;
                Ok((decision, RunnerStatus::parse(&status)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn settle_decision(
        &self,
        decision_id: i64,
        outcome: DecisionOutcome,
        settled_at: DateTime<Utc>,
        gross_pnl: f64,
        commission: f64,
        spread_cost: f64,
        net_pnl: f64,
        max_loss: f64,
        return_on_risk: f64,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE shadow_decisions
             SET outcome = ?1, settled_at = ?2, gross_pnl = ?3, commission = ?4,
                 spread_cost = ?5, net_pnl = ?6, max_loss = ?7, return_on_risk = ?8
             WHERE id = ?9 AND outcome = 'PENDING'",
            params![
                outcome.as_str(),
                fmt_ts(settled_at),
                gross_pnl,
                commission,
                spread_cost,
                net_pnl,
                max_loss,
                return_on_risk,
                decision_id
            ],
        )?;
        Ok(())
    }

    /// Recompute the denormalised counters on a hypothesis from its
    /// decisions.
    pub fn refresh_hypothesis_counters(&self, hypothesis_id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE trading_hypotheses SET
                total_decisions = (SELECT COUNT(*) FROM shadow_decisions
                                   WHERE hypothesis_id = ?1),
                total_wins = (SELECT COUNT(*) FROM shadow_decisions
                              WHERE hypothesis_id = ?1 AND outcome = 'WIN'),
                total_losses = (SELECT COUNT(*) FROM shadow_decisions
                                WHERE hypothesis_id = ?1 AND outcome = 'LOSE'),
                total_pnl = (SELECT COALESCE(SUM(net_pnl), 0) FROM shadow_decisions
                             WHERE hypothesis_id = ?1 AND net_pnl IS NOT NULL),
                avg_clv = (SELECT AVG(clv_percent) FROM shadow_decisions
                           WHERE hypothesis_id = ?1 AND clv_percent IS NOT NULL),
                last_decision_at = (SELECT MAX(decision_at) FROM shadow_decisions
                                    WHERE hypothesis_id = ?1)
             WHERE id = ?1",
            params![hypothesis_id],
        )?;
        Ok(())
    }

    /// Open pre-match markets in enabled competitions, starting inside
    /// (now, cutoff], excluding handicap types.
    pub fn momentum_markets(
        &self,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MomentumMarket>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.market_type, e.id, e.name, e.scheduled_start, c.id, c.name
             FROM markets m
             JOIN events e ON m.event_id = e.id
             JOIN competitions c ON e.competition_id = c.id
             WHERE e.scheduled_start > ?1 AND e.scheduled_start < ?2
               AND m.status = 'OPEN' AND m.in_play = 0 AND c.enabled = 1
               AND m.market_type NOT IN ('ASIAN_HANDICAP', 'HANDICAP')",
        )?;
        let rows = stmt
            .query_map(params![fmt_ts(now), fmt_ts(cutoff)], |row| {
                Ok(MomentumMarket {
                    market_id: row.get(0)?,
                    market_type: row.get(1)?,
                    event_id: row.get(2)?,
                    event_name: row.get(3)?,
                    scheduled_start: parse_ts(&row.get::<_, String>(4)?),
                    competition_id: row.get(5)?,
                    competition_name: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seed(db: &Database) -> (i64, i64, i64) {
        let sport = db.upsert_sport("1", "Soccer", true).unwrap();
        let comp = db.upsert_competition("c", sport, "Liga", None, true, "active").unwrap();
        let event = db
            .upsert_event("e", comp, "A v B", Utc::now() + Duration::hours(10))
            .unwrap();
        let market = db.upsert_market("1.1", event, "MO", "MATCH_ODDS", 0.0).unwrap();
        let runner = db.upsert_runner(101, market, "A", Some(1)).unwrap();
        (comp, market, runner)
    }

    fn new_decision<'a>(
        market_id: i64,
        runner_id: i64,
        hypothesis_id: i64,
        hypothesis_name: &'a str,
    ) -> NewShadowDecision<'a> {
        NewShadowDecision {
            market_id,
            runner_id,
            side: DecisionSide::Back,
            score_id: None,
            trigger_score: 55.0,
            trigger_reason: "steaming 6.2%",
            decision_at: Utc::now(),
            minutes_to_start: 600,
            entry_back_price: 3.0,
            entry_lay_price: 3.05,
            entry_spread: 1.67,
            available_to_back: 250.0,
            available_to_lay: 180.0,
            theoretical_stake: 10.0,
            hypothesis_id,
            hypothesis_name,
            price_change_30m: Some(-2.0),
            price_change_1h: Some(-4.5),
            price_change_2h: Some(-6.2),
            niche: "Liga - MATCH_ODDS",
            competition_id: 1,
        }
    }

    #[test]
    fn seeding_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.seed_default_hypotheses().unwrap();
        db.seed_default_hypotheses().unwrap();
        let hypotheses = db.enabled_hypotheses().unwrap();
        assert_eq!(hypotheses.len(), 3);
        let steam = db.hypothesis_by_name("steam_follower").unwrap().unwrap();
        assert_eq!(
            steam.entry_criteria.price_change_direction.as_deref(),
            Some("steaming")
        );
    }

    #[test]
    fn at_most_one_decision_per_market_and_hypothesis() {
        let db = Database::open_in_memory().unwrap();
        db.seed_default_hypotheses().unwrap();
        let (_, market, runner) = seed(&db);
        let hyp = db.hypothesis_by_name("steam_follower").unwrap().unwrap();

        let first = db
            .insert_decision(&new_decision(market, runner, hyp.id, &hyp.name))
            .unwrap();
        assert!(first.is_some());
        let second = db
            .insert_decision(&new_decision(market, runner, hyp.id, &hyp.name))
            .unwrap();
        assert!(second.is_none());
        assert_eq!(db.decisions_for_market(market).unwrap().len(), 1);
    }

    #[test]
    fn settle_only_moves_pending_rows() {
        let db = Database::open_in_memory().unwrap();
        db.seed_default_hypotheses().unwrap();
        let (_, market, runner) = seed(&db);
        let hyp = db.hypothesis_by_name("steam_follower").unwrap().unwrap();
        let id = db
            .insert_decision(&new_decision(market, runner, hyp.id, &hyp.name))
            .unwrap()
            .unwrap();

        db.settle_decision(
            id,
            DecisionOutcome::Win,
            Utc::now(),
            20.0,
            0.4,
            0.1,
            19.6,
            10.0,
            1.96,
        )
        .unwrap();
        let settled = db.decision(id).unwrap().unwrap();
        assert_eq!(settled.outcome, DecisionOutcome::Win);
        assert_eq!(settled.net_pnl, Some(19.6));

        // A second settlement attempt cannot rewrite the outcome.
        db.settle_decision(
            id,
            DecisionOutcome::Lose,
            Utc::now(),
            -10.0,
            0.0,
            0.0,
            -10.0,
            10.0,
            -1.0,
        )
        .unwrap();
        let unchanged = db.decision(id).unwrap().unwrap();
        assert_eq!(unchanged.outcome, DecisionOutcome::Win);
    }

    #[test]
    fn counters_reflect_settled_decisions() {
        let db = Database::open_in_memory().unwrap();
        db.seed_default_hypotheses().unwrap();
        let (_, market, runner) = seed(&db);
        let hyp = db.hypothesis_by_name("steam_follower").unwrap().unwrap();
        let id = db
            .insert_decision(&new_decision(market, runner, hyp.id, &hyp.name))
            .unwrap()
            .unwrap();
        db.set_decision_closing(id, 2.8, 2.9, 2.85, 5.26).unwrap();
        db.settle_decision(
            id,
            DecisionOutcome::Win,
            Utc::now(),
            20.0,
            0.4,
            0.1,
            19.6,
            10.0,
            1.96,
        )
        .unwrap();

        db.refresh_hypothesis_counters(hyp.id).unwrap();
        let refreshed = db.hypothesis_by_name("steam_follower").unwrap().unwrap();
        assert_eq!(refreshed.total_decisions, 1);
        assert_eq!(refreshed.total_wins, 1);
        assert_eq!(refreshed.total_losses, 0);
        assert!((refreshed.total_pnl - 19.6).abs() < 1e-9);
        assert!((refreshed.avg_clv.unwrap() - 5.26).abs() < 1e-9);
    }

    #[test]
    fn momentum_markets_exclude_handicap_types() {
        let db = Database::open_in_memory().unwrap();
        let (_, _, _) = seed(&db);
        let event_id = db.event_id_by_exchange_id("e").unwrap().unwrap();
        db.upsert_market("1.2", event_id, "AH", "ASIAN_HANDICAP", 0.0).unwrap();

        let markets = db
            .momentum_markets(Utc::now(), Utc::now() + Duration::hours(24))
            .unwrap();
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].market_type, "MATCH_ODDS");
    }
}
