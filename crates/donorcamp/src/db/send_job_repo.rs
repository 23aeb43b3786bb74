//! Send job repository — CRUD and claim operations for the
//! `email_send_jobs` table.
//!
//! Job claiming is a status-guarded conditional update (compare-and-swap),
//! so concurrent executor ticks never double-claim the same job.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw send job row from the database.
#[derive(Debug, Clone)]
pub struct SendJobRow {
    pub id: String,
    pub session_id: String,
    pub email_id: String,
    pub organization_id: String,
    pub scheduled_time: String,
    pub status: String,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub message_id: Option<String>,
    pub sent_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SendJobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            email_id: row.get("email_id")?,
            organization_id: row.get("organization_id")?,
            scheduled_time: row.get("scheduled_time")?,
            status: row.get("status")?,
            attempt_count: row.get("attempt_count")?,
            last_error: row.get("last_error")?,
            message_id: row.get("message_id")?,
            sent_at: row.get("sent_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new send job row.
pub fn insert(db: &Database, job: &SendJobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO email_send_jobs (id, session_id, email_id, organization_id,
             scheduled_time, status, attempt_count, last_error, message_id, sent_at,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.session_id,
                job.email_id,
                job.organization_id,
                job.scheduled_time,
                job.status,
                job.attempt_count,
                job.last_error,
                job.message_id,
                job.sent_at,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<SendJobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM email_send_jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], SendJobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Lists jobs for a session, optionally filtered by status.
pub fn list_for_session(
    db: &Database,
    session_id: &str,
    status: Option<&str>,
) -> Result<Vec<SendJobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let rows = match status {
            Some(s) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM email_send_jobs
                     WHERE session_id = ?1 AND status = ?2 ORDER BY scheduled_time",
                )?;
                let rows = stmt
                    .query_map(params![session_id, s], SendJobRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM email_send_jobs WHERE session_id = ?1 ORDER BY scheduled_time",
                )?;
                let rows = stmt
                    .query_map(params![session_id], SendJobRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    })
}

/// Counts jobs occupying a day's budget for an organization: everything
/// scheduled (or already dispatched) inside [day_start, day_end).
/// Cancelled and failed jobs release their slot.
pub fn count_for_day(
    db: &Database,
    organization_id: &str,
    day_start: &str,
    day_end: &str,
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM email_send_jobs
             WHERE organization_id = ?1
               AND scheduled_time >= ?2 AND scheduled_time < ?3
               AND status IN ('scheduled', 'paused', 'sending', 'sent')",
            params![organization_id, day_start, day_end],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Counts jobs actually dispatched today for an organization (used for
/// the executor's remaining-budget check).
pub fn count_sent_in_window(
    db: &Database,
    organization_id: &str,
    start: &str,
    end: &str,
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM email_send_jobs
             WHERE organization_id = ?1 AND status = 'sent'
               AND sent_at >= ?2 AND sent_at < ?3",
            params![organization_id, start, end],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Lists the distinct organizations that currently have due jobs.
pub fn organizations_with_due_jobs(
    db: &Database,
    now: &str,
) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT organization_id FROM email_send_jobs
             WHERE status = 'scheduled' AND scheduled_time <= ?1",
        )?;
        let orgs = stmt
            .query_map(params![now], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(orgs)
    })
}

/// Lists due job ids for an organization, oldest first, bounded by the
/// remaining daily budget.
pub fn due_job_ids(
    db: &Database,
    organization_id: &str,
    now: &str,
    limit: u64,
) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id FROM email_send_jobs
             WHERE organization_id = ?1 AND status = 'scheduled' AND scheduled_time <= ?2
             ORDER BY scheduled_time LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![organization_id, now, limit as i64], |r| {
                r.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    })
}

/// Claims a job for dispatch: scheduled -> sending, guarded on the current
/// status. Returns true if this caller won the claim.
pub fn claim(db: &Database, id: &str, updated_at: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE email_send_jobs SET status = 'sending', updated_at = ?2
             WHERE id = ?1 AND status = 'scheduled'",
            params![id, updated_at],
        )?;
        Ok(changed == 1)
    })
}

/// Marks a claimed job as sent.
pub fn mark_sent(
    db: &Database,
    id: &str,
    message_id: &str,
    sent_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE email_send_jobs
             SET status = 'sent', message_id = ?2, sent_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![id, message_id, sent_at],
        )?;
        Ok(())
    })
}

/// Records a dispatch failure: bumps attempt_count, and either requeues the
/// job at a new time or marks it terminally failed.
pub fn record_failure(
    db: &Database,
    id: &str,
    error: &str,
    retry_at: Option<&str>,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        match retry_at {
            Some(at) => conn.execute(
                "UPDATE email_send_jobs
                 SET status = 'scheduled', attempt_count = attempt_count + 1,
                     last_error = ?2, scheduled_time = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, error, at, updated_at],
            )?,
            None => conn.execute(
                "UPDATE email_send_jobs
                 SET status = 'failed', attempt_count = attempt_count + 1,
                     last_error = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![id, error, updated_at],
            )?,
        };
        Ok(())
    })
}

/// Transitions all of a session's jobs from one set of statuses to a new
/// status. Returns the number of jobs moved.
pub fn transition_session_jobs(
    db: &Database,
    session_id: &str,
    from: &[&str],
    to: &str,
    updated_at: &str,
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let placeholders: Vec<String> = (0..from.len()).map(|i| format!("?{}", i + 4)).collect();
        let sql = format!(
            "UPDATE email_send_jobs SET status = ?2, updated_at = ?3
             WHERE session_id = ?1 AND status IN ({})",
            placeholders.join(", ")
        );
        let mut params_vec: Vec<&dyn rusqlite::types::ToSql> =
            vec![&session_id, &to, &updated_at];
        for s in from {
            params_vec.push(s);
        }
        let changed = conn.execute(&sql, params_vec.as_slice())?;
        Ok(changed as u64)
    })
}

/// Reschedules a single job (used by resume when the original slot has
/// passed or is over cap).
pub fn reschedule(
    db: &Database,
    id: &str,
    scheduled_time: &str,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE email_send_jobs SET scheduled_time = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, scheduled_time, updated_at],
        )?;
        Ok(())
    })
}

/// True if the session still has jobs that could dispatch in the future.
pub fn has_active_jobs(db: &Database, session_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM email_send_jobs
             WHERE session_id = ?1 AND status IN ('scheduled', 'paused', 'sending')",
            params![session_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    })
}
