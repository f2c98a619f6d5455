// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Durable job store backed by SQLite.
//
// Every job, including the full ticket it prints, lives in the `jobs` table so
// the queue can be rebuilt after a crash. The queue worker is the only writer.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use tracing::{debug, info, instrument};

use ticketpress_core::error::{QueueError, Result, TicketpressError};
use ticketpress_core::types::{
    HistoryFilter, JobError, JobId, JobStatus, PrintJob, Priority, ProfileId, QueueStatus, Ticket,
};

/// SQLite schema for the jobs table.
const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        ticket TEXT NOT NULL,
        ticket_number TEXT NOT NULL,
        printer_id TEXT NOT NULL,
        priority TEXT NOT NULL,
        copies INTEGER NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        last_error TEXT,
        seq INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_attempt_at TEXT,
        completed_at TEXT,
        next_attempt_at TEXT,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        payload_digest TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
    CREATE INDEX IF NOT EXISTS idx_jobs_printer ON jobs (printer_id);
"#;

const SELECT_COLUMNS: &str = "SELECT id, ticket, printer_id, priority, copies, status, attempts,
        max_attempts, last_error, seq, created_at, updated_at, last_attempt_at,
        completed_at, next_attempt_at, cancel_requested, payload_digest
     FROM jobs";

/// Fixed-width UTC timestamps so text comparison matches time order.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| TicketpressError::Database(format!("serialize {what}: {e}")))
}

pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    /// Open (or create) the job database at `path`, in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| TicketpressError::Database(format!("open: {e}")))?;

        // WAL survives unclean shutdowns and lets the registry connection read
        // while the worker writes.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| TicketpressError::Database(format!("WAL pragma: {e}")))?;

        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| TicketpressError::Database(format!("create table: {e}")))?;

        info!("job store opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TicketpressError::Database(format!("open in-memory: {e}")))?;
        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| TicketpressError::Database(format!("create table: {e}")))?;
        debug!("in-memory job store opened");
        Ok(Self { conn })
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn insert_job(&self, job: &PrintJob) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO jobs (id, ticket, ticket_number, printer_id, priority, copies,
                 status, attempts, max_attempts, last_error, seq, created_at, updated_at,
                 last_attempt_at, completed_at, next_attempt_at, cancel_requested, payload_digest)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    job.id.to_string(),
                    to_json("ticket", &job.ticket)?,
                    job.ticket.ticket_number,
                    job.printer_id.as_str(),
                    to_json("priority", &job.priority)?,
                    job.copies,
                    to_json("status", &job.status)?,
                    job.attempts,
                    job.max_attempts,
                    job.last_error.as_ref().map(|e| to_json("last_error", e)).transpose()?,
                    job.seq as i64,
                    ts(&job.created_at),
                    ts(&job.updated_at),
                    job.last_attempt_at.as_ref().map(ts),
                    job.completed_at.as_ref().map(ts),
                    job.next_attempt_at.as_ref().map(ts),
                    job.cancel_requested,
                    job.payload_digest,
                ],
            )
            .map_err(|e| TicketpressError::Database(format!("insert job: {e}")))?;

        debug!(job_id = %job.id, "job inserted");
        Ok(())
    }

    /// Persist every mutable column of `job`.
    #[instrument(skip(self, job), fields(job_id = %job.id, status = job.status.label()))]
    pub fn update_job(&self, job: &PrintJob) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?1, attempts = ?2, max_attempts = ?3, last_error = ?4,
                 updated_at = ?5, last_attempt_at = ?6, completed_at = ?7, next_attempt_at = ?8,
                 cancel_requested = ?9, payload_digest = ?10
                 WHERE id = ?11",
                params![
                    to_json("status", &job.status)?,
                    job.attempts,
                    job.max_attempts,
                    job.last_error.as_ref().map(|e| to_json("last_error", e)).transpose()?,
                    ts(&job.updated_at),
                    job.last_attempt_at.as_ref().map(ts),
                    job.completed_at.as_ref().map(ts),
                    job.next_attempt_at.as_ref().map(ts),
                    job.cancel_requested,
                    job.payload_digest,
                    job.id.to_string(),
                ],
            )
            .map_err(|e| TicketpressError::Database(format!("update job: {e}")))?;

        if rows == 0 {
            return Err(QueueError::JobNotFound(job.id).into());
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn get_job(&self, job_id: &JobId) -> Result<Option<PrintJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .map_err(|e| TicketpressError::Database(format!("prepare get_job: {e}")))?;

        let mut rows = stmt
            .query_map(params![job_id.to_string()], row_to_print_job)
            .map_err(|e| TicketpressError::Database(format!("query get_job: {e}")))?;

        match rows.next() {
            Some(Ok(job)) => Ok(Some(job)),
            Some(Err(e)) => Err(TicketpressError::Database(format!("row parse: {e}"))),
            None => Ok(None),
        }
    }

    /// Jobs still in flight (Queued, Printing, Retrying), oldest first.
    #[instrument(skip(self))]
    pub fn active_jobs(&self) -> Result<Vec<PrintJob>> {
        let statuses = [JobStatus::Queued, JobStatus::Printing, JobStatus::Retrying]
            .iter()
            .map(|s| to_json("status", s).map(Value::Text))
            .collect::<Result<Vec<_>>>()?;
        self.select(
            &format!("{SELECT_COLUMNS} WHERE status IN (?1, ?2, ?3) ORDER BY seq ASC"),
            statuses,
        )
    }

    /// Jobs matching `filter`, newest first.
    #[instrument(skip(self, filter))]
    pub fn history(&self, filter: &HistoryFilter) -> Result<Vec<PrintJob>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !filter.statuses.is_empty() {
            let mut marks = Vec::new();
            for status in &filter.statuses {
                values.push(Value::Text(to_json("status", status)?));
                marks.push(format!("?{}", values.len()));
            }
            clauses.push(format!("status IN ({})", marks.join(", ")));
        }
        if let Some(printer) = &filter.printer_id {
            values.push(Value::Text(printer.as_str().to_string()));
            clauses.push(format!("printer_id = ?{}", values.len()));
        }
        if let Some(number) = &filter.ticket_number {
            values.push(Value::Text(number.clone()));
            clauses.push(format!("ticket_number = ?{}", values.len()));
        }
        if let Some(after) = &filter.created_after {
            values.push(Value::Text(ts(after)));
            clauses.push(format!("created_at >= ?{}", values.len()));
        }
        if let Some(before) = &filter.created_before {
            values.push(Value::Text(ts(before)));
            clauses.push(format!("created_at < ?{}", values.len()));
        }

        let mut sql = SELECT_COLUMNS.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, seq DESC");
        if let Some(limit) = filter.limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let jobs = self.select(&sql, values)?;
        debug!(count = jobs.len(), "history query");
        Ok(jobs)
    }

    /// Counts for the queue status snapshot. Retrying jobs count as queued.
    pub fn status_counts(&self) -> Result<QueueStatus> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .map_err(|e| TicketpressError::Database(format!("prepare status_counts: {e}")))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| TicketpressError::Database(format!("query status_counts: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TicketpressError::Database(format!("collect rows: {e}")))?;

        let mut counts = QueueStatus::default();
        for (status_json, n) in rows {
            let status: JobStatus = serde_json::from_str(&status_json)?;
            if let Some(count) = counts.counter_mut(status) {
                *count += n as usize;
            }
        }
        Ok(counts)
    }

    /// Next submission sequence number.
    pub fn next_seq(&self) -> Result<u64> {
        let max: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM jobs", [], |row| row.get(0))
            .map_err(|e| TicketpressError::Database(format!("next_seq: {e}")))?;
        Ok(max as u64 + 1)
    }

    /// Number of jobs, in any state, targeting `printer`.
    pub fn count_referencing(&self, printer: &ProfileId) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM jobs WHERE printer_id = ?1",
                params![printer.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| TicketpressError::Database(format!("count_referencing: {e}")))?;
        Ok(n as usize)
    }

    fn select(&self, sql: &str, values: Vec<Value>) -> Result<Vec<PrintJob>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| TicketpressError::Database(format!("prepare: {e}")))?;
        stmt.query_map(params_from_iter(values), row_to_print_job)
            .map_err(|e| TicketpressError::Database(format!("query: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TicketpressError::Database(format!("collect rows: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn conversion_error(
    column: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_json<T: serde::de::DeserializeOwned>(column: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| conversion_error(column, e))
}

fn parse_ts(column: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn parse_opt_ts(column: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(column, &s)).transpose()
}

/// Map a row to a `PrintJob`. Column indices follow `SELECT_COLUMNS`.
fn row_to_print_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrintJob> {
    let id_str: String = row.get(0)?;
    let uuid = uuid::Uuid::parse_str(&id_str).map_err(|e| conversion_error(0, e))?;

    let ticket: Ticket = parse_json(1, &row.get::<_, String>(1)?)?;
    let printer_id = ProfileId(row.get(2)?);
    let priority: Priority = parse_json(3, &row.get::<_, String>(3)?)?;
    let status: JobStatus = parse_json(5, &row.get::<_, String>(5)?)?;
    let last_error: Option<JobError> = row
        .get::<_, Option<String>>(8)?
        .map(|s| parse_json(8, &s))
        .transpose()?;

    Ok(PrintJob {
        id: JobId(uuid),
        ticket,
        printer_id,
        priority,
        copies: row.get(4)?,
        status,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        last_error,
        seq: row.get::<_, i64>(9)? as u64,
        created_at: parse_ts(10, &row.get::<_, String>(10)?)?,
        updated_at: parse_ts(11, &row.get::<_, String>(11)?)?,
        last_attempt_at: parse_opt_ts(12, row.get(12)?)?,
        completed_at: parse_opt_ts(13, row.get(13)?)?,
        next_attempt_at: parse_opt_ts(14, row.get(14)?)?,
        cancel_requested: row.get(15)?,
        payload_digest: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ticketpress_core::types::{ErrorCategory, VehicleInfo};

    fn test_job(number: &str, printer: &str, seq: u64) -> PrintJob {
        let ticket = Ticket::new(
            "City Truck Terminal",
            number,
            seq,
            VehicleInfo::new("KA01AB1234", "Truck", "Acme"),
            Utc::now(),
        );
        PrintJob::new(ticket, ProfileId::from(printer), Priority::Normal, 1, 3, seq)
    }

    #[test]
    fn insert_and_retrieve_job() {
        let store = JobStore::open_in_memory().expect("open in-memory db");
        let job = test_job("T-1", "gate-1", 1);
        store.insert_job(&job).expect("insert");

        let got = store.get_job(&job.id).expect("get_job").expect("found");
        assert_eq!(got.id, job.id);
        assert_eq!(got.ticket, job.ticket);
        assert_eq!(got.status, JobStatus::Queued);
        assert_eq!(got.printer_id, ProfileId::from("gate-1"));
    }

    #[test]
    fn update_persists_error_and_schedule() {
        let store = JobStore::open_in_memory().expect("open in-memory db");
        let mut job = test_job("T-1", "gate-1", 1);
        store.insert_job(&job).expect("insert");

        job.status = JobStatus::Retrying;
        job.attempts = 1;
        job.next_attempt_at = Some(Utc::now() + Duration::seconds(1));
        job.last_error = Some(JobError {
            category: ErrorCategory::Transmission,
            message: "broken pipe".into(),
            fault: None,
            requires_intervention: false,
        });
        job.payload_digest = Some("abc".into());
        store.update_job(&job).expect("update");

        let got = store.get_job(&job.id).expect("get_job").expect("found");
        assert_eq!(got.status, JobStatus::Retrying);
        assert_eq!(got.attempts, 1);
        assert_eq!(got.last_error, job.last_error);
        assert!(got.next_attempt_at.is_some());
        assert_eq!(got.payload_digest.as_deref(), Some("abc"));
    }

    #[test]
    fn update_nonexistent_job_is_not_found() {
        let store = JobStore::open_in_memory().expect("open in-memory db");
        let job = test_job("T-1", "gate-1", 1);
        let err = store.update_job(&job).expect_err("missing");
        assert!(matches!(err, TicketpressError::Queue(QueueError::JobNotFound(_))));
    }

    #[test]
    fn get_nonexistent_job_returns_none() {
        let store = JobStore::open_in_memory().expect("open in-memory db");
        assert!(store.get_job(&JobId::new()).expect("get_job").is_none());
    }

    #[test]
    fn active_jobs_exclude_terminal_states() {
        let store = JobStore::open_in_memory().expect("open in-memory db");
        let mut done = test_job("T-1", "gate-1", 1);
        done.status = JobStatus::Completed;
        let waiting = test_job("T-2", "gate-1", 2);
        let mut printing = test_job("T-3", "gate-1", 3);
        printing.status = JobStatus::Printing;
        for job in [&done, &waiting, &printing] {
            store.insert_job(job).expect("insert");
        }

        let active: Vec<u64> = store
            .active_jobs()
            .expect("active")
            .iter()
            .map(|j| j.seq)
            .collect();
        assert_eq!(active, vec![2, 3]);
    }

    #[test]
    fn history_filters_and_orders_newest_first() {
        let store = JobStore::open_in_memory().expect("open in-memory db");
        let base = Utc::now() - Duration::hours(1);
        for (i, printer) in ["gate-1", "gate-2", "gate-1"].into_iter().enumerate() {
            let mut job = test_job(&format!("T-{i}"), printer, i as u64 + 1);
            job.created_at = base + Duration::minutes(i as i64);
            store.insert_job(&job).expect("insert");
        }

        let all = store.history(&HistoryFilter::default()).expect("history");
        let numbers: Vec<&str> = all.iter().map(|j| j.ticket.ticket_number.as_str()).collect();
        assert_eq!(numbers, vec!["T-2", "T-1", "T-0"]);

        let gate1 = store
            .history(&HistoryFilter {
                printer_id: Some(ProfileId::from("gate-1")),
                limit: Some(1),
                ..Default::default()
            })
            .expect("history");
        assert_eq!(gate1.len(), 1);
        assert_eq!(gate1[0].ticket.ticket_number, "T-2");

        let by_number = store
            .history(&HistoryFilter {
                ticket_number: Some("T-1".into()),
                statuses: vec![JobStatus::Queued],
                ..Default::default()
            })
            .expect("history");
        assert_eq!(by_number.len(), 1);

        let recent = store
            .history(&HistoryFilter {
                created_after: Some(base + Duration::seconds(30)),
                ..Default::default()
            })
            .expect("history");
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn counts_and_sequence() {
        let store = JobStore::open_in_memory().expect("open in-memory db");
        assert_eq!(store.next_seq().expect("seq"), 1);

        let mut failed = test_job("T-1", "gate-1", 1);
        failed.status = JobStatus::Failed;
        let mut retrying = test_job("T-2", "gate-1", 2);
        retrying.status = JobStatus::Retrying;
        let queued = test_job("T-3", "gate-2", 7);
        for job in [&failed, &retrying, &queued] {
            store.insert_job(job).expect("insert");
        }

        assert_eq!(
            store.status_counts().expect("counts"),
            QueueStatus {
                queued: 2,
                printing: 0,
                failed: 1
            }
        );
        assert_eq!(store.next_seq().expect("seq"), 8);
        assert_eq!(store.count_referencing(&ProfileId::from("gate-1")).expect("count"), 2);
    }

    #[test]
    fn jobs_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.db");
        let job = test_job("T-1", "gate-1", 1);
        {
            let store = JobStore::open(&path).expect("open");
            store.insert_job(&job).expect("insert");
        }
        let store = JobStore::open(&path).expect("reopen");
        assert!(store.get_job(&job.id).expect("get_job").is_some());
    }
}
