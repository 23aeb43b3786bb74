//! Campaign session repository — CRUD operations for the
//! `campaign_sessions` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw campaign session row from the database.
///
/// JSON columns (`chat_history`, `donor_ids`, `preview_donor_ids`) are
/// kept as strings here; the session module owns the typed shapes.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub instruction: String,
    pub refined_instruction: Option<String>,
    pub chat_history: String,
    pub donor_ids: String,
    pub preview_donor_ids: String,
    pub status: String,
    pub total_donors: u32,
    pub completed_donors: u32,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            organization_id: row.get("organization_id")?,
            user_id: row.get("user_id")?,
            instruction: row.get("instruction")?,
            refined_instruction: row.get("refined_instruction")?,
            chat_history: row.get("chat_history")?,
            donor_ids: row.get("donor_ids")?,
            preview_donor_ids: row.get("preview_donor_ids")?,
            status: row.get("status")?,
            total_donors: row.get("total_donors")?,
            completed_donors: row.get("completed_donors")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Query filter parameters for session listing.
#[derive(Debug, Default, Clone)]
pub struct SessionFilter {
    pub status: Option<String>,
    pub user_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new session row.
pub fn insert(db: &Database, session: &SessionRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO campaign_sessions (id, organization_id, user_id, instruction,
             refined_instruction, chat_history, donor_ids, preview_donor_ids, status,
             total_donors, completed_donors, error_message, created_at, updated_at,
             completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                session.id,
                session.organization_id,
                session.user_id,
                session.instruction,
                session.refined_instruction,
                session.chat_history,
                session.donor_ids,
                session.preview_donor_ids,
                session.status,
                session.total_donors,
                session.completed_donors,
                session.error_message,
                session.created_at,
                session.updated_at,
                session.completed_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a session by its ID, scoped to an organization.
pub fn find_by_id(
    db: &Database,
    organization_id: &str,
    id: &str,
) -> Result<Option<SessionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM campaign_sessions WHERE id = ?1 AND organization_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![id, organization_id], SessionRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Returns the owning organization of a session, if the session exists.
/// Used for cross-tenant access checks before reporting NotFound vs Forbidden.
pub fn organization_of(db: &Database, id: &str) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT organization_id FROM campaign_sessions WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], |r| r.get::<_, String>(0))?;
        match rows.next() {
            Some(Ok(org)) => Ok(Some(org)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Queries sessions for an organization with filters, returning
/// (rows, total_count).
pub fn query(
    db: &Database,
    organization_id: &str,
    filter: &SessionFilter,
) -> Result<(Vec<SessionRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = vec!["organization_id = ?1".to_string()];
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(organization_id.to_string())];

        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if let Some(ref user_id) = filter.user_id {
            conditions.push(format!("user_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(user_id.clone()));
        }

        let where_clause = format!("WHERE {}", conditions.join(" AND "));

        let count_sql = format!("SELECT COUNT(*) FROM campaign_sessions {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM campaign_sessions {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<SessionRow> = stmt
            .query_map(params_ref.as_slice(), SessionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Transitions a session's status only if the current status is one of
/// `from`. Returns true if the transition was applied (compare-and-swap,
/// so concurrent callers cannot both win).
pub fn transition_status(
    db: &Database,
    id: &str,
    from: &[&str],
    to: &str,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let placeholders: Vec<String> = (0..from.len()).map(|i| format!("?{}", i + 4)).collect();
        let sql = format!(
            "UPDATE campaign_sessions SET status = ?2, updated_at = ?3 \
             WHERE id = ?1 AND status IN ({})",
            placeholders.join(", ")
        );
        let mut params_vec: Vec<&dyn rusqlite::types::ToSql> = vec![&id, &to, &updated_at];
        for s in from {
            params_vec.push(s);
        }
        let changed = conn.execute(&sql, params_vec.as_slice())?;
        Ok(changed == 1)
    })
}

/// Marks a session terminal: sets status, completed_at and updated_at.
pub fn mark_terminal(
    db: &Database,
    id: &str,
    status: &str,
    timestamp: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE campaign_sessions SET status = ?2, completed_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![id, status, timestamp],
        )?;
        Ok(())
    })
}

/// Recomputes `completed_donors` as the count of generated email rows for
/// the session, and records the failure rollup. A single UPDATE with a
/// subselect, so concurrent batch completions cannot clobber each other
/// with stale counter reads.
pub fn reconcile_progress(
    db: &Database,
    id: &str,
    error_message: Option<&str>,
    updated_at: &str,
) -> Result<u32, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE campaign_sessions
             SET completed_donors = (SELECT COUNT(*) FROM generated_emails
                                     WHERE session_id = ?1),
                 error_message = ?2,
                 updated_at = ?3
             WHERE id = ?1",
            params![id, error_message, updated_at],
        )?;
        let completed: u32 = conn.query_row(
            "SELECT completed_donors FROM campaign_sessions WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        Ok(completed)
    })
}

/// Re-opens a session for a retry run: back to generating, clearing any
/// terminal timestamp. Guarded on retry-eligible statuses.
pub fn reopen(db: &Database, id: &str, updated_at: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE campaign_sessions
             SET status = 'generating', completed_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status IN ('generating', 'failed', 'ready_to_send')",
            params![id, updated_at],
        )?;
        Ok(changed == 1)
    })
}

/// Stores the refined instruction and appended chat history.
pub fn update_refinement(
    db: &Database,
    id: &str,
    refined_instruction: &str,
    chat_history_json: &str,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE campaign_sessions
             SET refined_instruction = ?2, chat_history = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, refined_instruction, chat_history_json, updated_at],
        )?;
        Ok(())
    })
}

/// Deletes a session. Generated emails and send jobs cascade.
pub fn delete(db: &Database, id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute("DELETE FROM campaign_sessions WHERE id = ?1", params![id])?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_session(id: &str) -> SessionRow {
        SessionRow {
            id: id.to_string(),
            organization_id: "org-1".to_string(),
            user_id: "user-1".to_string(),
            instruction: "Thank donors for their support".to_string(),
            refined_instruction: None,
            chat_history: "[]".to_string(),
            donor_ids: r#"["d1","d2","d3"]"#.to_string(),
            preview_donor_ids: r#"["d1"]"#.to_string(),
            status: "pending".to_string(),
            total_donors: 3,
            completed_donors: 0,
            error_message: None,
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            updated_at: "2026-01-01T00:00:00+00:00".to_string(),
            completed_at: None,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample_session("s1")).unwrap();

        let found = find_by_id(&db, "org-1", "s1").unwrap().unwrap();
        assert_eq!(found.status, "pending");
        assert_eq!(found.total_donors, 3);
    }

    #[test]
    fn test_find_scoped_to_organization() {
        let db = test_db();
        insert(&db, &sample_session("s1")).unwrap();

        assert!(find_by_id(&db, "other-org", "s1").unwrap().is_none());
        assert_eq!(organization_of(&db, "s1").unwrap().as_deref(), Some("org-1"));
        assert!(organization_of(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn test_transition_status_cas() {
        let db = test_db();
        insert(&db, &sample_session("s1")).unwrap();

        // pending -> generating applies.
        assert!(transition_status(
            &db,
            "s1",
            &["draft", "pending"],
            "generating",
            "2026-01-01T01:00:00+00:00"
        )
        .unwrap());

        // Second attempt loses the race: status is no longer pending.
        assert!(!transition_status(
            &db,
            "s1",
            &["draft", "pending"],
            "generating",
            "2026-01-01T01:00:01+00:00"
        )
        .unwrap());

        let found = find_by_id(&db, "org-1", "s1").unwrap().unwrap();
        assert_eq!(found.status, "generating");
    }

    #[test]
    fn test_reconcile_progress_counts_generated_rows() {
        let db = test_db();
        insert(&db, &sample_session("s1")).unwrap();

        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO generated_emails (id, session_id, donor_id, subject, content,
                 reference_contexts, review_status, is_sent, created_at, updated_at)
                 VALUES ('e1', 's1', 'd1', 'Hi', '[]', '[]', 'pending_approval', 0,
                 '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let completed =
            reconcile_progress(&db, "s1", Some("d2: timeout"), "2026-01-01T02:00:00+00:00")
                .unwrap();
        assert_eq!(completed, 1);

        let found = find_by_id(&db, "org-1", "s1").unwrap().unwrap();
        assert_eq!(found.completed_donors, 1);
        assert_eq!(found.error_message.as_deref(), Some("d2: timeout"));
    }

    #[test]
    fn test_query_with_status_filter() {
        let db = test_db();
        insert(&db, &sample_session("s1")).unwrap();
        let mut done = sample_session("s2");
        done.status = "completed".to_string();
        insert(&db, &done).unwrap();

        let (rows, total) = query(
            &db,
            "org-1",
            &SessionFilter {
                status: Some("completed".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, "s2");
    }

    #[test]
    fn test_query_excludes_other_orgs() {
        let db = test_db();
        insert(&db, &sample_session("s1")).unwrap();
        let mut other = sample_session("s2");
        other.organization_id = "org-2".to_string();
        insert(&db, &other).unwrap();

        let (rows, total) = query(&db, "org-1", &SessionFilter::default()).unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, "s1");
    }

    #[test]
    fn test_mark_terminal_sets_completed_at() {
        let db = test_db();
        insert(&db, &sample_session("s1")).unwrap();

        mark_terminal(&db, "s1", "failed", "2026-01-02T00:00:00+00:00").unwrap();
        let found = find_by_id(&db, "org-1", "s1").unwrap().unwrap();
        assert_eq!(found.status, "failed");
        assert_eq!(
            found.completed_at.as_deref(),
            Some("2026-01-02T00:00:00+00:00")
        );
    }

    #[test]
    fn test_delete() {
        let db = test_db();
        insert(&db, &sample_session("s1")).unwrap();
        delete(&db, "s1").unwrap();
        assert!(find_by_id(&db, "org-1", "s1").unwrap().is_none());
    }
}
