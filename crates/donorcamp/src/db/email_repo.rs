//! Generated email repository — CRUD for the `generated_emails` table.
//!
//! The (session_id, donor_id) pair is UNIQUE; generation writes go
//! through [`upsert`] so a retried donor updates its prior attempt
//! instead of creating a duplicate row.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw generated email row from the database.
#[derive(Debug, Clone)]
pub struct EmailRow {
    pub id: String,
    pub session_id: String,
    pub donor_id: String,
    pub subject: String,
    pub content: String,
    pub reference_contexts: String,
    pub review_status: String,
    pub reject_reason: Option<String>,
    pub is_sent: bool,
    pub sent_at: Option<String>,
    pub send_status: Option<String>,
    pub send_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl EmailRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            donor_id: row.get("donor_id")?,
            subject: row.get("subject")?,
            content: row.get("content")?,
            reference_contexts: row.get("reference_contexts")?,
            review_status: row.get("review_status")?,
            reject_reason: row.get("reject_reason")?,
            is_sent: row.get::<_, i64>("is_sent")? != 0,
            sent_at: row.get("sent_at")?,
            send_status: row.get("send_status")?,
            send_error: row.get("send_error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a generated email for a (session, donor) pair, or replaces the
/// content of a prior attempt. Review status resets to pending_approval on
/// update so regenerated content goes back through the review gate.
pub fn upsert(db: &Database, email: &EmailRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO generated_emails (id, session_id, donor_id, subject, content,
             reference_contexts, review_status, reject_reason, is_sent, sent_at,
             send_status, send_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT (session_id, donor_id) DO UPDATE SET
                subject = excluded.subject,
                content = excluded.content,
                reference_contexts = excluded.reference_contexts,
                review_status = 'pending_approval',
                reject_reason = NULL,
                updated_at = excluded.updated_at",
            params![
                email.id,
                email.session_id,
                email.donor_id,
                email.subject,
                email.content,
                email.reference_contexts,
                email.review_status,
                email.reject_reason,
                email.is_sent as i64,
                email.sent_at,
                email.send_status,
                email.send_error,
                email.created_at,
                email.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds an email by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<EmailRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM generated_emails WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], EmailRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Lists all emails for a session, optionally filtered by review status.
pub fn list_for_session(
    db: &Database,
    session_id: &str,
    review_status: Option<&str>,
) -> Result<Vec<EmailRow>, DatabaseError> {
    db.with_conn(|conn| {
        let rows = match review_status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM generated_emails
                     WHERE session_id = ?1 AND review_status = ?2
                     ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map(params![session_id, status], EmailRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM generated_emails WHERE session_id = ?1 ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map(params![session_id], EmailRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    })
}

/// Returns the donor ids in a session that already hold a generated email.
pub fn donor_ids_with_email(
    db: &Database,
    session_id: &str,
) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT donor_id FROM generated_emails WHERE session_id = ?1")?;
        let ids = stmt
            .query_map(params![session_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    })
}

/// Applies a bulk review action to the given email ids, restricted to the
/// caller's organization (out-of-org ids are silently skipped, per the
/// review contract). Only pending emails are touched. Returns the number
/// of rows updated.
pub fn bulk_review(
    db: &Database,
    organization_id: &str,
    email_ids: &[String],
    approve: bool,
    reason: Option<&str>,
    updated_at: &str,
) -> Result<u64, DatabaseError> {
    if email_ids.is_empty() {
        return Ok(0);
    }
    db.with_conn(|conn| {
        let placeholders: Vec<String> = (0..email_ids.len())
            .map(|i| format!("?{}", i + 4))
            .collect();
        let set_clause = if approve {
            "review_status = 'approved', reject_reason = NULL"
        } else {
            "review_status = 'pending_approval', reject_reason = ?3"
        };
        let sql = format!(
            "UPDATE generated_emails SET {}, updated_at = ?2
             WHERE review_status = 'pending_approval' AND is_sent = 0
               AND session_id IN (SELECT id FROM campaign_sessions WHERE organization_id = ?1)
               AND id IN ({})",
            set_clause,
            placeholders.join(", ")
        );
        let mut params_vec: Vec<&dyn rusqlite::types::ToSql> =
            vec![&organization_id, &updated_at, &reason];
        for id in email_ids {
            params_vec.push(id);
        }
        let changed = conn.execute(&sql, params_vec.as_slice())?;
        Ok(changed as u64)
    })
}

/// Replaces subject/content of an unsent email. Edited content always
/// goes back through review, so an approved email is demoted to
/// pending_approval. Returns false once the email has been sent.
pub fn update_content(
    db: &Database,
    id: &str,
    subject: &str,
    content_json: &str,
    reference_contexts_json: &str,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE generated_emails
             SET subject = ?2, content = ?3, reference_contexts = ?4,
                 review_status = 'pending_approval', updated_at = ?5
             WHERE id = ?1 AND is_sent = 0
               AND review_status IN ('pending_approval', 'approved')",
            params![id, subject, content_json, reference_contexts_json, updated_at],
        )?;
        Ok(changed == 1)
    })
}

/// Marks an email as sent.
pub fn mark_sent(db: &Database, id: &str, sent_at: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE generated_emails
             SET is_sent = 1, sent_at = ?2, send_status = 'sent', send_error = NULL,
                 updated_at = ?2
             WHERE id = ?1",
            params![id, sent_at],
        )?;
        Ok(())
    })
}

/// Records a terminal send failure on the email.
pub fn mark_send_failed(
    db: &Database,
    id: &str,
    error: &str,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE generated_emails
             SET send_status = 'failed', send_error = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, error, updated_at],
        )?;
        Ok(())
    })
}

/// Counts emails for a session grouped by (review_status, is_sent) facets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EmailCounts {
    pub total: u64,
    pub pending: u64,
    pub approved: u64,
    pub sent: u64,
    pub send_failed: u64,
}

pub fn counts_for_session(db: &Database, session_id: &str) -> Result<EmailCounts, DatabaseError> {
    db.with_conn(|conn| {
        let mut counts = EmailCounts::default();
        let mut stmt = conn.prepare(
            "SELECT review_status, is_sent, COALESCE(send_status, ''), COUNT(*)
             FROM generated_emails WHERE session_id = ?1
             GROUP BY review_status, is_sent, send_status",
        )?;
        let rows = stmt.query_map(params![session_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)? != 0,
                r.get::<_, String>(2)?,
                r.get::<_, u64>(3)?,
            ))
        })?;
        for row in rows {
            let (review_status, is_sent, send_status, n) = row?;
            counts.total += n;
            match review_status.as_str() {
                "approved" => counts.approved += n,
                _ => counts.pending += n,
            }
            if is_sent {
                counts.sent += n;
            }
            if send_status == "failed" {
                counts.send_failed += n;
            }
        }
        Ok(counts)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::session_repo::{self, SessionRow};

    fn test_db() -> Database {
        let db = Database::open_in_memory().expect("Failed to create test database");
        session_repo::insert(
            &db,
            &SessionRow {
                id: "s1".to_string(),
                organization_id: "org-1".to_string(),
                user_id: "u1".to_string(),
                instruction: "thank donors".to_string(),
                refined_instruction: None,
                chat_history: "[]".to_string(),
                donor_ids: r#"["d1","d2"]"#.to_string(),
                preview_donor_ids: "[]".to_string(),
                status: "generating".to_string(),
                total_donors: 2,
                completed_donors: 0,
                error_message: None,
                created_at: "2026-01-01T00:00:00+00:00".to_string(),
                updated_at: "2026-01-01T00:00:00+00:00".to_string(),
                completed_at: None,
            },
        )
        .unwrap();
        db
    }

    fn sample_email(id: &str, donor_id: &str) -> EmailRow {
        EmailRow {
            id: id.to_string(),
            session_id: "s1".to_string(),
            donor_id: donor_id.to_string(),
            subject: "Thank you".to_string(),
            content: r#"[{"piece":"Dear donor","references":[],"addContext":null}]"#.to_string(),
            reference_contexts: "[]".to_string(),
            review_status: "pending_approval".to_string(),
            reject_reason: None,
            is_sent: false,
            sent_at: None,
            send_status: None,
            send_error: None,
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            updated_at: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn test_upsert_is_idempotent_per_donor() {
        let db = test_db();
        upsert(&db, &sample_email("e1", "d1")).unwrap();

        // Second attempt for the same donor keeps one row and the original id.
        let mut retry = sample_email("e2", "d1");
        retry.subject = "Thank you again".to_string();
        retry.updated_at = "2026-01-01T01:00:00+00:00".to_string();
        upsert(&db, &retry).unwrap();

        let rows = list_for_session(&db, "s1", None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "e1");
        assert_eq!(rows[0].subject, "Thank you again");
        assert_eq!(rows[0].review_status, "pending_approval");
    }

    #[test]
    fn test_upsert_resets_review_on_regeneration() {
        let db = test_db();
        upsert(&db, &sample_email("e1", "d1")).unwrap();
        bulk_review(
            &db,
            "org-1",
            &["e1".to_string()],
            true,
            None,
            "2026-01-01T01:00:00+00:00",
        )
        .unwrap();

        upsert(&db, &sample_email("e9", "d1")).unwrap();
        let row = find_by_id(&db, "e1").unwrap().unwrap();
        assert_eq!(row.review_status, "pending_approval");
    }

    #[test]
    fn test_bulk_review_approve() {
        let db = test_db();
        upsert(&db, &sample_email("e1", "d1")).unwrap();
        upsert(&db, &sample_email("e2", "d2")).unwrap();

        let n = bulk_review(
            &db,
            "org-1",
            &["e1".to_string(), "e2".to_string()],
            true,
            None,
            "2026-01-01T01:00:00+00:00",
        )
        .unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            find_by_id(&db, "e1").unwrap().unwrap().review_status,
            "approved"
        );
    }

    #[test]
    fn test_bulk_review_reject_keeps_row_with_reason() {
        let db = test_db();
        upsert(&db, &sample_email("e1", "d1")).unwrap();

        let n = bulk_review(
            &db,
            "org-1",
            &["e1".to_string()],
            false,
            Some("tone"),
            "2026-01-01T01:00:00+00:00",
        )
        .unwrap();
        assert_eq!(n, 1);

        let row = find_by_id(&db, "e1").unwrap().unwrap();
        assert_eq!(row.review_status, "pending_approval");
        assert_eq!(row.reject_reason.as_deref(), Some("tone"));
    }

    #[test]
    fn test_bulk_review_skips_other_orgs() {
        let db = test_db();
        upsert(&db, &sample_email("e1", "d1")).unwrap();

        let n = bulk_review(
            &db,
            "org-2",
            &["e1".to_string()],
            true,
            None,
            "2026-01-01T01:00:00+00:00",
        )
        .unwrap();
        assert_eq!(n, 0);
        assert_eq!(
            find_by_id(&db, "e1").unwrap().unwrap().review_status,
            "pending_approval"
        );
    }

    #[test]
    fn test_update_content_demotes_approved_blocks_sent() {
        let db = test_db();
        upsert(&db, &sample_email("e1", "d1")).unwrap();

        assert!(update_content(
            &db,
            "e1",
            "Edited",
            "[]",
            "[]",
            "2026-01-01T01:00:00+00:00"
        )
        .unwrap());

        // Editing an approved email works but sends it back to review.
        bulk_review(
            &db,
            "org-1",
            &["e1".to_string()],
            true,
            None,
            "2026-01-01T02:00:00+00:00",
        )
        .unwrap();
        assert!(update_content(
            &db,
            "e1",
            "Edited again",
            "[]",
            "[]",
            "2026-01-01T03:00:00+00:00"
        )
        .unwrap());
        let row = find_by_id(&db, "e1").unwrap().unwrap();
        assert_eq!(row.review_status, "pending_approval");

        // A sent email is frozen.
        mark_sent(&db, "e1", "2026-01-02T09:00:00+00:00").unwrap();
        assert!(!update_content(
            &db,
            "e1",
            "Too late",
            "[]",
            "[]",
            "2026-01-02T10:00:00+00:00"
        )
        .unwrap());
    }

    #[test]
    fn test_mark_sent_and_counts() {
        let db = test_db();
        upsert(&db, &sample_email("e1", "d1")).unwrap();
        upsert(&db, &sample_email("e2", "d2")).unwrap();
        bulk_review(
            &db,
            "org-1",
            &["e1".to_string(), "e2".to_string()],
            true,
            None,
            "2026-01-01T01:00:00+00:00",
        )
        .unwrap();
        mark_sent(&db, "e1", "2026-01-02T09:00:00+00:00").unwrap();

        let row = find_by_id(&db, "e1").unwrap().unwrap();
        assert!(row.is_sent);
        assert_eq!(row.send_status.as_deref(), Some("sent"));

        let counts = counts_for_session(&db, "s1").unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.approved, 2);
        assert_eq!(counts.sent, 1);
        assert_eq!(counts.send_failed, 0);
    }

    #[test]
    fn test_donor_ids_with_email() {
        let db = test_db();
        upsert(&db, &sample_email("e1", "d1")).unwrap();
        let ids = donor_ids_with_email(&db, "s1").unwrap();
        assert_eq!(ids, vec!["d1".to_string()]);
    }
}
