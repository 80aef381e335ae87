//! rusqlite-backed persistence.
//!
//! A single connection behind a `parking_lot::Mutex`, WAL mode for
//! concurrent readers, prepared statements per call. Storage functions are
//! grouped by domain: catalog (sports through runners), snapshots,
//! profiles, scores, closing data, competition stats, shadow trading and
//! job runs. Each write task holds the lock only for its own statements,
//! which is the unit of atomicity the scheduler relies on.

mod catalog;
mod closing;
mod jobs;
mod profiles;
mod schema;
mod scores;
mod shadow;
mod snapshots;
mod stats;

pub use catalog::ActiveMarket;
pub use closing::{ClosingCapture, UnsettledClosing};
pub use profiles::ProfileMetricsRow;
pub use scores::NewScore;
pub use shadow::{MomentumMarket, NewShadowDecision};
pub use stats::{CompetitionDayStats, CompetitionRanking};

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

/// Fixed-width UTC timestamp format. Sorts lexicographically in time order,
/// which the window queries depend on.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
const DATE_FORMAT: &str = "%Y-%m-%d";

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    chrono::NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .or_else(|_| DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

pub(crate) fn fmt_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .unwrap_or_else(|_| NaiveDate::from_ymd_opt(1970, 1, 1).unwrap())
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        info!(path, "database_opened");
        Ok(db)
    }

    /// In-memory database for tests and one-off runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(schema::SCHEMA_SQL)
            .context("failed to apply schema")?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}
