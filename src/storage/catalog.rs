//! Catalog storage: sports, competitions, events, markets, runners.
//!
//! Upserts are keyed on the exchange id and always overwrite the mutable
//! descriptive fields, so discovery re-runs converge instead of duplicating.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{fmt_ts, parse_ts, Database};
use crate::models::{
    Competition, Event, EventStatus, Market, MarketStatus, Runner, RunnerStatus,
};

/// A market eligible for snapshot capture, with the ids the poller needs.
#[derive(Debug, Clone)]
pub struct ActiveMarket {
    pub market_id: i64,
    pub exchange_id: String,
}

fn competition_from_row(row: &Row<'_>) -> rusqlite::Result<Competition> {
    Ok(Competition {
        id: row.get(0)?,
        exchange_id: row.get(1)?,
        sport_id: row.get(2)?,
        name: row.get(3)?,
        country_code: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        tier: row.get(6)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let status: String = row.get(5)?;
    Ok(Event {
        id: row.get(0)?,
        exchange_id: row.get(1)?,
        competition_id: row.get(2)?,
        name: row.get(3)?,
        scheduled_start: parse_ts(&row.get::<_, String>(4)?),
        status: if status == "CLOSED" {
            EventStatus::Closed
        } else {
            EventStatus::Scheduled
        },
    })
}

fn market_from_row(row: &Row<'_>) -> rusqlite::Result<Market> {
    Ok(Market {
        id: row.get(0)?,
        exchange_id: row.get(1)?,
        event_id: row.get(2)?,
        name: row.get(3)?,
        market_type: row.get(4)?,
        total_matched: row.get(5)?,
        status: MarketStatus::parse(&row.get::<_, String>(6)?),
        in_play: row.get::<_, i64>(7)? != 0,
    })
}

fn runner_from_row(row: &Row<'_>) -> rusqlite::Result<Runner> {
    Ok(Runner {
        id: row.get(0)?,
        selection_id: row.get(1)?,
        market_id: row.get(2)?,
        name: row.get(3)?,
        sort_priority: row.get(4)?,
        status: RunnerStatus::parse(&row.get::<_, String>(5)?),
    })
}

impl Database {
    pub fn upsert_sport(&self, exchange_id: &str, name: &str, enabled: bool) -> Result<i64> {
        let conn = self.conn();
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO sports (exchange_id, name, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(exchange_id) DO UPDATE SET
                name = excluded.name,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            params![exchange_id, name, enabled as i64, now],
        )
        .context("upsert_sport")?;
        let id = conn.query_row(
            "SELECT id FROM sports WHERE exchange_id = ?1",
            params![exchange_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn upsert_competition(
        &self,
        exchange_id: &str,
        sport_id: i64,
        name: &str,
        country_code: Option<&str>,
        enabled: bool,
        tier: &str,
    ) -> Result<i64> {
        let conn = self.conn();
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO competitions
                (exchange_id, sport_id, name, country_code, enabled, tier, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(exchange_id) DO UPDATE SET
                name = excluded.name,
                country_code = excluded.country_code,
                enabled = excluded.enabled,
                tier = excluded.tier,
                updated_at = excluded.updated_at",
            params![exchange_id, sport_id, name, country_code, enabled as i64, tier, now],
        )
        .context("upsert_competition")?;
        let id = conn.query_row(
            "SELECT id FROM competitions WHERE exchange_id = ?1",
            params![exchange_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn enabled_competitions(&self) -> Result<Vec<Competition>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, exchange_id, sport_id, name, country_code, enabled, tier
             FROM competitions WHERE enabled = 1",
        )?;
        let rows = stmt
            .query_map([], competition_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn competition(&self, id: i64) -> Result<Option<Competition>> {
        let conn = self.conn();
        let comp = conn
            .query_row(
                "SELECT id, exchange_id, sport_id, name, country_code, enabled, tier
                 FROM competitions WHERE id = ?1",
                params![id],
                competition_from_row,
            )
            .optional()?;
        Ok(comp)
    }

    pub fn upsert_event(
        &self,
        exchange_id: &str,
        competition_id: i64,
        name: &str,
        scheduled_start: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn();
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO events
                (exchange_id, competition_id, name, scheduled_start, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'SCHEDULED', ?5, ?5)
             ON CONFLICT(exchange_id) DO UPDATE SET
                name = excluded.name,
                scheduled_start = excluded.scheduled_start,
                updated_at = excluded.updated_at",
            params![exchange_id, competition_id, name, fmt_ts(scheduled_start), now],
        )
        .context("upsert_event")?;
        let id = conn.query_row(
            "SELECT id FROM events WHERE exchange_id = ?1",
            params![exchange_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn event(&self, id: i64) -> Result<Option<Event>> {
        let conn = self.conn();
        let event = conn
            .query_row(
                "SELECT id, exchange_id, competition_id, name, scheduled_start, status
                 FROM events WHERE id = ?1",
                params![id],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    pub fn event_id_by_exchange_id(&self, exchange_id: &str) -> Result<Option<i64>> {
        let conn = self.conn();
        let id = conn
            .query_row(
                "SELECT id FROM events WHERE exchange_id = ?1",
                params![exchange_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Events whose start passed more than `cutoff` ago move to CLOSED.
    pub fn mark_stale_events(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let now = fmt_ts(Utc::now());
        let changed = conn.execute(
            "UPDATE events SET status = 'CLOSED', updated_at = ?1
             WHERE scheduled_start < ?2 AND status = 'SCHEDULED'",
            params![now, fmt_ts(cutoff)],
        )?;
        Ok(changed)
    }

    pub fn upsert_market(
        &self,
        exchange_id: &str,
        event_id: i64,
        name: &str,
        market_type: &str,
        total_matched: f64,
    ) -> Result<i64> {
        let conn = self.conn();
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO markets
                (exchange_id, event_id, name, market_type, total_matched, status, in_play,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'OPEN', 0, ?6, ?6)
             ON CONFLICT(exchange_id) DO UPDATE SET
                name = excluded.name,
                total_matched = excluded.total_matched,
                updated_at = excluded.updated_at",
            params![exchange_id, event_id, name, market_type, total_matched, now],
        )
        .context("upsert_market")?;
        let id = conn.query_row(
            "SELECT id FROM markets WHERE exchange_id = ?1",
            params![exchange_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn market(&self, id: i64) -> Result<Option<Market>> {
        let conn = self.conn();
        let market = conn
            .query_row(
                "SELECT id, exchange_id, event_id, name, market_type, total_matched, status, in_play
                 FROM markets WHERE id = ?1",
                params![id],
                market_from_row,
            )
            .optional()?;
        Ok(market)
    }

    pub fn set_market_status(&self, market_id: i64, status: MarketStatus) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE markets SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), fmt_ts(Utc::now()), market_id],
        )?;
        Ok(())
    }

    pub fn set_market_in_play(&self, market_id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE markets SET in_play = 1, updated_at = ?1 WHERE id = ?2",
            params![fmt_ts(Utc::now()), market_id],
        )?;
        Ok(())
    }

    /// Markets eligible for snapshots: OPEN, pre-match, enabled competition.
    pub fn active_markets(&self) -> Result<Vec<ActiveMarket>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.exchange_id
             FROM markets m
             JOIN events e ON m.event_id = e.id
             JOIN competitions c ON e.competition_id = c.id
             WHERE m.status = 'OPEN' AND m.in_play = 0 AND c.enabled = 1",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ActiveMarket {
                    market_id: row.get(0)?,
                    exchange_id: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn upsert_runner(
        &self,
        selection_id: i64,
        market_id: i64,
        name: &str,
        sort_priority: Option<i64>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runners (selection_id, market_id, name, sort_priority, status)
             VALUES (?1, ?2, ?3, ?4, 'ACTIVE')
             ON CONFLICT(selection_id, market_id) DO UPDATE SET
                name = excluded.name,
                sort_priority = excluded.sort_priority",
            params![selection_id, market_id, name, sort_priority],
        )
        .context("upsert_runner")?;
        let id = conn.query_row(
            "SELECT id FROM runners WHERE selection_id = ?1 AND market_id = ?2",
            params![selection_id, market_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn runners_for_market(&self, market_id: i64) -> Result<Vec<Runner>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, selection_id, market_id, name, sort_priority, status
             FROM runners WHERE market_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![market_id], runner_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn runner(&self, id: i64) -> Result<Option<Runner>> {
        let conn = self.conn();
        let runner = conn
            .query_row(
                "SELECT id, selection_id, market_id, name, sort_priority, status
                 FROM runners WHERE id = ?1",
                params![id],
                runner_from_row,
            )
            .optional()?;
        Ok(runner)
    }

    pub fn set_runner_status(
        &self,
        market_id: i64,
        selection_id: i64,
        status: RunnerStatus,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE runners SET status = ?1 WHERE market_id = ?2 AND selection_id = ?3",
            params![status.as_str(), market_id, selection_id],
        )?;
        Ok(())
    }

    /// OPEN pre-match markets whose event starts inside [from, to].
    pub fn markets_starting_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(Market, Event)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.exchange_id, m.event_id, m.name, m.market_type, m.total_matched,
                    m.status, m.in_play,
                    e.id, e.exchange_id, e.competition_id, e.name, e.scheduled_start, e.status
             FROM markets m
             JOIN events e ON m.event_id = e.id
             WHERE e.scheduled_start >= ?1 AND e.scheduled_start <= ?2
               AND m.status = 'OPEN' AND m.in_play = 0",
        )?;
        let rows = stmt
            .query_map(params![fmt_ts(from), fmt_ts(to)], |row| {
                let market = Market {
                    id: row.get(0)?,
                    exchange_id: row.get(1)?,
                    event_id: row.get(2)?,
                    name: row.get(3)?,
                    market_type: row.get(4)?,
                    total_matched: row.get(5)?,
                    status: MarketStatus::parse(&row.get::<_, String>(6)?),
                    in_play: row.get::<_, i64>(7)? != 0,
                };
                let event = Event {
                    id: row.get(8)?,
                    exchange_id: row.get(9)?,
                    competition_id: row.get(10)?,
                    name: row.get(11)?,
                    scheduled_start: parse_ts(&row.get::<_, String>(12)?),
                    status: if row.get::<_, String>(13)? == "CLOSED" {
                        EventStatus::Closed
                    } else {
                        EventStatus::Scheduled
                    },
                };
                Ok((market, event))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// First market of the given type for an event, if any.
    pub fn market_of_type_for_event(
        &self,
        event_id: i64,
        market_type: &str,
    ) -> Result<Option<Market>> {
        let conn = self.conn();
        let market = conn
            .query_row(
                "SELECT id, exchange_id, event_id, name, market_type, total_matched, status, in_play
                 FROM markets WHERE event_id = ?1 AND market_type = ?2 LIMIT 1",
                params![event_id, market_type],
                market_from_row,
            )
            .optional()?;
        Ok(market)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seed_market(db: &Database) -> (i64, i64, i64, i64) {
        let sport = db.upsert_sport("1", "Soccer", true).unwrap();
        let comp = db
            .upsert_competition("c-100", sport, "Seg. Liga", Some("PT"), true, "active")
            .unwrap();
        let event = db
            .upsert_event("e-200", comp, "Porto B v Braga B", Utc::now() + Duration::hours(12))
            .unwrap();
        let market = db
            .upsert_market("1.555", event, "Match Odds", "MATCH_ODDS", 1500.0)
            .unwrap();
        (sport, comp, event, market)
    }

    #[test]
    fn upserts_are_idempotent_on_exchange_id() {
        let db = Database::open_in_memory().unwrap();
        let (_, comp, event, market) = seed_market(&db);

        let comp2 = db
            .upsert_competition("c-100", 1, "Seg. Liga", Some("PT"), true, "active")
            .unwrap();
        let event2 = db
            .upsert_event("e-200", comp, "Porto B v Braga B", Utc::now() + Duration::hours(12))
            .unwrap();
        let market2 = db
            .upsert_market("1.555", event, "Match Odds", "MATCH_ODDS", 1600.0)
            .unwrap();

        assert_eq!(comp, comp2);
        assert_eq!(event, event2);
        assert_eq!(market, market2);
        assert_eq!(db.market(market).unwrap().unwrap().total_matched, 1600.0);
    }

    #[test]
    fn active_markets_respects_status_and_competition_flag() {
        let db = Database::open_in_memory().unwrap();
        let (_, comp, _, market) = seed_market(&db);
        assert_eq!(db.active_markets().unwrap().len(), 1);

        db.set_market_in_play(market).unwrap();
        assert_eq!(db.active_markets().unwrap().len(), 0);

        // Reset and disable the competition instead.
        let conn_reset = || {
            db.conn()
                .execute("UPDATE markets SET in_play = 0", [])
                .unwrap();
        };
        conn_reset();
        assert_eq!(db.active_markets().unwrap().len(), 1);
        db.upsert_competition("c-100", 1, "Seg. Liga", Some("PT"), false, "excluded")
            .unwrap();
        let _ = comp;
        assert_eq!(db.active_markets().unwrap().len(), 0);
    }

    #[test]
    fn stale_events_close_after_cutoff() {
        let db = Database::open_in_memory().unwrap();
        let sport = db.upsert_sport("1", "Soccer", true).unwrap();
        let comp = db
            .upsert_competition("c-1", sport, "Liga", None, true, "active")
            .unwrap();
        let old = db
            .upsert_event("e-old", comp, "Old v Older", Utc::now() - Duration::hours(6))
            .unwrap();
        let fresh = db
            .upsert_event("e-new", comp, "New v Newer", Utc::now() + Duration::hours(6))
            .unwrap();

        let changed = db.mark_stale_events(Utc::now() - Duration::hours(4)).unwrap();
        assert_eq!(changed, 1);
        assert_eq!(db.event(old).unwrap().unwrap().status, EventStatus::Closed);
        assert_eq!(db.event(fresh).unwrap().unwrap().status, EventStatus::Scheduled);
    }

    #[test]
    fn runner_unique_per_market_and_selection() {
        let db = Database::open_in_memory().unwrap();
        let (_, _, _, market) = seed_market(&db);
        let a = db.upsert_runner(47972, market, "Porto B", Some(1)).unwrap();
        let b = db.upsert_runner(47972, market, "FC Porto B", Some(1)).unwrap();
        assert_eq!(a, b);
        let runners = db.runners_for_market(market).unwrap();
        assert_eq!(runners.len(), 1);
        assert_eq!(runners[0].name, "FC Porto B");
    }
}
