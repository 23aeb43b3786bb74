//! Send scheduling: per-organization schedule configuration and the
//! daily-cap slot packer.

pub mod scheduler;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::schedule_repo::{self, ScheduleConfigRow};
use crate::db::Database;
use crate::error::{EngineError, Result};
use crate::events::{ChangeBroadcaster, ChangeKind};

pub use scheduler::{ScheduleOutcome, SendScheduler, SendType};

/// Per-organization sending policy. One row per organization; absent
/// rows fall back to these defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub organization_id: String,
    /// Maximum emails scheduled (or sent) per calendar day.
    pub daily_cap: u32,
    /// First hour of the sending window, UTC.
    pub window_start_hour: u32,
    /// Hour the window closes, UTC (exclusive).
    pub window_end_hour: u32,
    /// Minutes between consecutive slots within a day.
    pub cadence_minutes: u32,
    /// How many days ahead the packer may place slots.
    pub horizon_days: u32,
}

impl ScheduleConfig {
    pub fn defaults_for(organization_id: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            daily_cap: 100,
            window_start_hour: 9,
            window_end_hour: 17,
            cadence_minutes: 2,
            horizon_days: 14,
        }
    }

    fn from_row(row: ScheduleConfigRow) -> Self {
        Self {
            organization_id: row.organization_id,
            daily_cap: row.daily_cap,
            window_start_hour: row.window_start_hour,
            window_end_hour: row.window_end_hour,
            cadence_minutes: row.cadence_minutes,
            horizon_days: row.horizon_days,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.daily_cap == 0 {
            return Err(EngineError::Validation(
                "daily_cap must be at least 1".to_string(),
            ));
        }
        if self.window_end_hour > 24 || self.window_start_hour >= self.window_end_hour {
            return Err(EngineError::Validation(format!(
                "invalid sending window {}..{}",
                self.window_start_hour, self.window_end_hour
            )));
        }
        if self.cadence_minutes == 0 {
            return Err(EngineError::Validation(
                "cadence_minutes must be at least 1".to_string(),
            ));
        }
        if self.horizon_days == 0 {
            return Err(EngineError::Validation(
                "horizon_days must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial update to a schedule config. Unset fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfigPatch {
    pub daily_cap: Option<u32>,
    pub window_start_hour: Option<u32>,
    pub window_end_hour: Option<u32>,
    pub cadence_minutes: Option<u32>,
    pub horizon_days: Option<u32>,
}

/// Read/update surface for schedule configs.
pub struct ScheduleConfigStore {
    db: Database,
    events: ChangeBroadcaster,
}

impl ScheduleConfigStore {
    pub fn new(db: Database, events: ChangeBroadcaster) -> Self {
        Self { db, events }
    }

    /// The organization's config, or defaults if none was ever stored.
    pub fn get_or_default(&self, organization_id: &str) -> Result<ScheduleConfig> {
        Ok(match schedule_repo::find(&self.db, organization_id)? {
            Some(row) => ScheduleConfig::from_row(row),
            None => ScheduleConfig::defaults_for(organization_id),
        })
    }

    /// Applies a partial update, validating the merged result before it
    /// is stored. Existing jobs keep their slots; only future scheduling
    /// runs see the new policy.
    pub fn update(
        &self,
        organization_id: &str,
        patch: &ScheduleConfigPatch,
    ) -> Result<ScheduleConfig> {
        let mut config = self.get_or_default(organization_id)?;
        if let Some(v) = patch.daily_cap {
            config.daily_cap = v;
        }
        if let Some(v) = patch.window_start_hour {
            config.window_start_hour = v;
        }
        if let Some(v) = patch.window_end_hour {
            config.window_end_hour = v;
        }
        if let Some(v) = patch.cadence_minutes {
            config.cadence_minutes = v;
        }
        if let Some(v) = patch.horizon_days {
            config.horizon_days = v;
        }
        config.validate()?;

        schedule_repo::upsert(
            &self.db,
            &ScheduleConfigRow {
                organization_id: config.organization_id.clone(),
                daily_cap: config.daily_cap,
                window_start_hour: config.window_start_hour,
                window_end_hour: config.window_end_hour,
                cadence_minutes: config.cadence_minutes,
                horizon_days: config.horizon_days,
                updated_at: Utc::now().to_rfc3339(),
            },
        )?;
        log::info!(
            "Updated schedule config for org {}: cap {}/day, window {}..{} UTC",
            organization_id,
            config.daily_cap,
            config.window_start_hour,
            config.window_end_hour
        );
        self.events
            .notify("", organization_id, ChangeKind::ScheduleConfigUpdated);
        Ok(config)
    }
}
