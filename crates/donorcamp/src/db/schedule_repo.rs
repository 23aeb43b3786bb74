//! Schedule config repository — one row per organization in the
//! `email_schedule_configs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw schedule config row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfigRow {
    pub organization_id: String,
    pub daily_cap: u32,
    pub window_start_hour: u32,
    pub window_end_hour: u32,
    pub cadence_minutes: u32,
    pub horizon_days: u32,
    pub updated_at: String,
}

impl ScheduleConfigRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            organization_id: row.get("organization_id")?,
            daily_cap: row.get("daily_cap")?,
            window_start_hour: row.get("window_start_hour")?,
            window_end_hour: row.get("window_end_hour")?,
            cadence_minutes: row.get("cadence_minutes")?,
            horizon_days: row.get("horizon_days")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Finds the config for an organization, if one has been stored.
pub fn find(
    db: &Database,
    organization_id: &str,
) -> Result<Option<ScheduleConfigRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM email_schedule_configs WHERE organization_id = ?1")?;
        let mut rows = stmt.query_map(params![organization_id], ScheduleConfigRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Inserts or replaces the config for an organization.
pub fn upsert(db: &Database, config: &ScheduleConfigRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO email_schedule_configs (organization_id, daily_cap,
             window_start_hour, window_end_hour, cadence_minutes, horizon_days, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (organization_id) DO UPDATE SET
                daily_cap = excluded.daily_cap,
                window_start_hour = excluded.window_start_hour,
                window_end_hour = excluded.window_end_hour,
                cadence_minutes = excluded.cadence_minutes,
                horizon_days = excluded.horizon_days,
                updated_at = excluded.updated_at",
            params![
                config.organization_id,
                config.daily_cap,
                config.window_start_hour,
                config.window_end_hour,
                config.cadence_minutes,
                config.horizon_days,
                config.updated_at,
            ],
        )?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_config() -> ScheduleConfigRow {
        ScheduleConfigRow {
            organization_id: "org-1".to_string(),
            daily_cap: 50,
            window_start_hour: 9,
            window_end_hour: 17,
            cadence_minutes: 2,
            horizon_days: 14,
            updated_at: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn test_find_missing_returns_none() {
        let db = test_db();
        assert!(find(&db, "org-1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_and_find() {
        let db = test_db();
        upsert(&db, &sample_config()).unwrap();

        let found = find(&db, "org-1").unwrap().unwrap();
        assert_eq!(found.daily_cap, 50);
        assert_eq!(found.window_start_hour, 9);
    }

    #[test]
    fn test_upsert_replaces() {
        let db = test_db();
        upsert(&db, &sample_config()).unwrap();

        let mut updated = sample_config();
        updated.daily_cap = 200;
        updated.updated_at = "2026-01-02T00:00:00+00:00".to_string();
        upsert(&db, &updated).unwrap();

        let found = find(&db, "org-1").unwrap().unwrap();
        assert_eq!(found.daily_cap, 200);

        let count = db
            .with_conn(|conn| {
                let n: u32 =
                    conn.query_row("SELECT COUNT(*) FROM email_schedule_configs", [], |r| {
                        r.get(0)
                    })?;
                Ok(n)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
