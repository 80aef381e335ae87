//! Job-run audit storage.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{fmt_ts, parse_ts, Database};
use crate::models::{JobRun, JobStatus};

impl Database {
    pub fn start_job_run(&self, job_name: &str, started_at: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO job_runs (job_name, started_at, status) VALUES (?1, ?2, 'running')",
            params![job_name, fmt_ts(started_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn complete_job_run(
        &self,
        job_id: i64,
        status: JobStatus,
        records_processed: i64,
        error_message: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE job_runs
             SET completed_at = ?1, status = ?2, records_processed = ?3,
                 error_message = ?4, metadata_json = ?5
             WHERE id = ?6",
            params![
                fmt_ts(Utc::now()),
                status.as_str(),
                records_processed,
                error_message,
                metadata.map(|m| m.to_string()),
                job_id
            ],
        )?;
        Ok(())
    }

    pub fn job_run(&self, job_id: i64) -> Result<Option<JobRun>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, job_name, started_at, completed_at, status, records_processed,
                        error_message, metadata_json
                 FROM job_runs WHERE id = ?1",
                params![job_id],
                |row| {
                    let metadata: Option<String> = row.get(7)?;
                    Ok(JobRun {
                        id: row.get(0)?,
                        job_name: row.get(1)?,
                        started_at: parse_ts(&row.get::<_, String>(2)?),
                        completed_at: row.get::<_, Option<String>>(3)?.map(|s| parse_ts(&s)),
                        status: row.get(4)?,
                        records_processed: row.get(5)?,
                        error_message: row.get(6)?,
                        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// A `running` row whose start is older than the task's hard limit is an
    /// orphan from a killed worker; mark it failed so dashboards don't show
    /// it as alive forever.
    pub fn fail_orphaned_job_runs(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE job_runs
             SET status = 'failed', completed_at = ?1,
                 error_message = 'orphaned: exceeded hard time limit'
             WHERE status = 'running' AND started_at < ?2",
            params![fmt_ts(Utc::now()), fmt_ts(older_than)],
        )?;
        Ok(changed)
    }
}
