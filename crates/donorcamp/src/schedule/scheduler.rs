//! The send scheduler: packs approved emails into future send slots under
//! the organization's daily cap, and drives pause/resume/cancel over the
//! resulting jobs.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Days, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::send_job_repo::{self, SendJobRow};
use crate::db::{email_repo, session_repo, Database};
use crate::error::{EngineError, Result};
use crate::events::{ChangeBroadcaster, ChangeKind};
use crate::schedule::{ScheduleConfig, ScheduleConfigStore};
use crate::session::{format_timestamp, parse_timestamp};

/// Which approved emails a scheduling run targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SendType {
    /// Every approved, unsent email. Existing scheduled jobs for the
    /// session are replaced.
    All,
    /// Only approved emails with no active job yet. Existing jobs keep
    /// their slots.
    Unsent,
}

/// Result of one scheduling run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleOutcome {
    pub scheduled: u64,
    pub first_slot: Option<DateTime<Utc>>,
    pub last_slot: Option<DateTime<Utc>>,
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    NaiveDateTime::new(date, NaiveTime::MIN).and_utc()
}

/// Packs `needed` slots into the horizon, respecting the per-day cap and
/// the sending window. `used_per_day` is how many slots each day already
/// holds. Returns None when the horizon cannot absorb all of them; a
/// partial packing is never returned.
pub(crate) fn pack_slots(
    now: DateTime<Utc>,
    config: &ScheduleConfig,
    needed: usize,
    used_per_day: &HashMap<NaiveDate, u64>,
) -> Option<Vec<DateTime<Utc>>> {
    if needed == 0 {
        return Some(vec![]);
    }
    let cadence = Duration::minutes(i64::from(config.cadence_minutes));
    let mut slots = Vec::with_capacity(needed);

    for offset in 0..u64::from(config.horizon_days) {
        let date = now.date_naive() + Days::new(offset);
        let used = used_per_day.get(&date).copied().unwrap_or(0);
        if used >= u64::from(config.daily_cap) {
            continue;
        }
        let window_open = day_start(date) + Duration::hours(i64::from(config.window_start_hour));
        let window_close = day_start(date) + Duration::hours(i64::from(config.window_end_hour));

        let mut remaining_today = u64::from(config.daily_cap) - used;
        // Start past the slots the day already holds so replays do not
        // stack new jobs onto occupied times.
        let mut index = used as i32;
        loop {
            let slot = window_open + cadence * index;
            index += 1;
            if slot >= window_close {
                break;
            }
            if slot <= now {
                continue;
            }
            slots.push(slot);
            remaining_today -= 1;
            if slots.len() == needed {
                return Some(slots);
            }
            if remaining_today == 0 {
                break;
            }
        }
    }
    None
}

/// Schedules approved emails into send jobs and manages their lifecycle.
pub struct SendScheduler {
    db: Database,
    configs: ScheduleConfigStore,
    events: ChangeBroadcaster,
}

impl SendScheduler {
    pub fn new(db: Database, configs: ScheduleConfigStore, events: ChangeBroadcaster) -> Self {
        Self {
            db,
            configs,
            events,
        }
    }

    /// Packs the session's approved emails into future slots. Either every
    /// email gets a slot or nothing is written and `CapacityExceeded` is
    /// returned.
    pub fn schedule_session(
        &self,
        organization_id: &str,
        session_id: &str,
        send_type: SendType,
    ) -> Result<ScheduleOutcome> {
        self.schedule_session_at(organization_id, session_id, send_type, Utc::now())
    }

    /// Same as [`schedule_session`](Self::schedule_session) with an
    /// explicit clock, for hosts (and tests) that drive their own time.
    pub fn schedule_session_at(
        &self,
        organization_id: &str,
        session_id: &str,
        send_type: SendType,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome> {
        let session = self.load_session(organization_id, session_id)?;
        if session.status != "ready_to_send" {
            return Err(EngineError::InvalidState(format!(
                "cannot schedule sends from status '{}'",
                session.status
            )));
        }
        let config = self.configs.get_or_default(organization_id)?;

        let active_jobs: Vec<SendJobRow> =
            send_job_repo::list_for_session(&self.db, session_id, None)?
                .into_iter()
                .filter(|job| matches!(job.status.as_str(), "scheduled" | "paused"))
                .collect();

        let mut emails: Vec<email_repo::EmailRow> =
            email_repo::list_for_session(&self.db, session_id, Some("approved"))?
                .into_iter()
                .filter(|e| !e.is_sent)
                .collect();
        if send_type == SendType::Unsent {
            let already_queued: HashSet<&str> =
                active_jobs.iter().map(|j| j.email_id.as_str()).collect();
            emails.retain(|e| !already_queued.contains(e.id.as_str()));
        }
        if emails.is_empty() {
            return Err(EngineError::Validation(
                "no approved emails to schedule".to_string(),
            ));
        }

        // Per-day occupancy across the horizon. When replacing (All), the
        // session's own active jobs are excluded so their slots count as
        // free again.
        let mut used_per_day: HashMap<NaiveDate, u64> = HashMap::new();
        for offset in 0..u64::from(config.horizon_days) {
            let date = now.date_naive() + Days::new(offset);
            let start = format_timestamp(day_start(date));
            let end = format_timestamp(day_start(date + Days::new(1)));
            let count = send_job_repo::count_for_day(&self.db, organization_id, &start, &end)?;
            used_per_day.insert(date, count);
        }
        if send_type == SendType::All {
            for job in &active_jobs {
                let date = parse_timestamp(&job.scheduled_time).date_naive();
                if let Some(count) = used_per_day.get_mut(&date) {
                    *count = count.saturating_sub(1);
                }
            }
        }

        let slots = pack_slots(now, &config, emails.len(), &used_per_day).ok_or(
            EngineError::CapacityExceeded {
                organization_id: organization_id.to_string(),
                horizon_days: config.horizon_days,
            },
        )?;

        if send_type == SendType::All && !active_jobs.is_empty() {
            send_job_repo::transition_session_jobs(
                &self.db,
                session_id,
                &["scheduled", "paused"],
                "cancelled",
                &format_timestamp(now),
            )?;
        }

        let now_str = format_timestamp(now);
        for (email, slot) in emails.iter().zip(&slots) {
            send_job_repo::insert(
                &self.db,
                &SendJobRow {
                    id: Uuid::new_v4().to_string(),
                    session_id: session_id.to_string(),
                    email_id: email.id.clone(),
                    organization_id: organization_id.to_string(),
                    scheduled_time: format_timestamp(*slot),
                    status: "scheduled".to_string(),
                    attempt_count: 0,
                    last_error: None,
                    message_id: None,
                    sent_at: None,
                    created_at: now_str.clone(),
                    updated_at: now_str.clone(),
                },
            )?;
        }

        log::info!(
            "Scheduled {} send jobs for session {} (org {}, first slot {:?})",
            slots.len(),
            session_id,
            organization_id,
            slots.first()
        );
        self.events
            .notify(session_id, organization_id, ChangeKind::SendScheduled);
        Ok(ScheduleOutcome {
            scheduled: slots.len() as u64,
            first_slot: slots.first().copied(),
            last_slot: slots.last().copied(),
        })
    }

    /// Freezes the session's scheduled jobs. In-flight dispatches finish;
    /// nothing new is claimed afterwards.
    pub fn pause(&self, organization_id: &str, session_id: &str) -> Result<u64> {
        self.load_session(organization_id, session_id)?;
        let paused = send_job_repo::transition_session_jobs(
            &self.db,
            session_id,
            &["scheduled"],
            "paused",
            &format_timestamp(Utc::now()),
        )?;
        log::info!("Paused {} jobs for session {}", paused, session_id);
        self.events
            .notify(session_id, organization_id, ChangeKind::SendingPaused);
        Ok(paused)
    }

    /// Reactivates paused jobs. Jobs whose slot passed while paused are
    /// repacked into fresh future slots instead of firing all at once.
    pub fn resume(&self, organization_id: &str, session_id: &str) -> Result<u64> {
        self.resume_at(organization_id, session_id, Utc::now())
    }

    /// [`resume`](Self::resume) with an explicit clock.
    pub fn resume_at(
        &self,
        organization_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.load_session(organization_id, session_id)?;
        let resumed = send_job_repo::transition_session_jobs(
            &self.db,
            session_id,
            &["paused"],
            "scheduled",
            &format_timestamp(now),
        )?;

        let stale: Vec<SendJobRow> =
            send_job_repo::list_for_session(&self.db, session_id, Some("scheduled"))?
                .into_iter()
                .filter(|job| parse_timestamp(&job.scheduled_time) <= now)
                .collect();
        if !stale.is_empty() {
            let config = self.configs.get_or_default(organization_id)?;
            let mut used_per_day: HashMap<NaiveDate, u64> = HashMap::new();
            for offset in 0..u64::from(config.horizon_days) {
                let date = now.date_naive() + Days::new(offset);
                let start = format_timestamp(day_start(date));
                let end = format_timestamp(day_start(date + Days::new(1)));
                let count = send_job_repo::count_for_day(&self.db, organization_id, &start, &end)?;
                used_per_day.insert(date, count);
            }
            let slots = pack_slots(now, &config, stale.len(), &used_per_day).ok_or(
                EngineError::CapacityExceeded {
                    organization_id: organization_id.to_string(),
                    horizon_days: config.horizon_days,
                },
            )?;
            for (job, slot) in stale.iter().zip(&slots) {
                send_job_repo::reschedule(
                    &self.db,
                    &job.id,
                    &format_timestamp(*slot),
                    &format_timestamp(now),
                )?;
            }
            log::info!(
                "Repacked {} stale jobs for session {} on resume",
                stale.len(),
                session_id
            );
        }

        self.events
            .notify(session_id, organization_id, ChangeKind::SendingResumed);
        Ok(resumed)
    }

    /// Cancels every remaining scheduled or paused job. Sent emails stay
    /// sent; the session itself is untouched.
    pub fn cancel(&self, organization_id: &str, session_id: &str) -> Result<u64> {
        self.load_session(organization_id, session_id)?;
        let cancelled = send_job_repo::transition_session_jobs(
            &self.db,
            session_id,
            &["scheduled", "paused"],
            "cancelled",
            &format_timestamp(Utc::now()),
        )?;
        log::info!("Cancelled {} jobs for session {}", cancelled, session_id);
        self.events
            .notify(session_id, organization_id, ChangeKind::SendingCancelled);
        Ok(cancelled)
    }

    /// Jobs for a session, optionally filtered by status.
    pub fn list_jobs(
        &self,
        organization_id: &str,
        session_id: &str,
        status: Option<&str>,
    ) -> Result<Vec<SendJobRow>> {
        self.load_session(organization_id, session_id)?;
        Ok(send_job_repo::list_for_session(&self.db, session_id, status)?)
    }

    fn load_session(
        &self,
        organization_id: &str,
        session_id: &str,
    ) -> Result<session_repo::SessionRow> {
        match session_repo::find_by_id(&self.db, organization_id, session_id)? {
            Some(row) => Ok(row),
            None => match session_repo::organization_of(&self.db, session_id)? {
                Some(_) => Err(EngineError::Forbidden {
                    entity: "session",
                    id: session_id.to_string(),
                }),
                None => Err(EngineError::NotFound {
                    entity: "session",
                    id: session_id.to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> ScheduleConfig {
        ScheduleConfig {
            organization_id: "org-1".to_string(),
            daily_cap: 50,
            window_start_hour: 9,
            window_end_hour: 17,
            cadence_minutes: 2,
            horizon_days: 14,
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_pack_overflows_into_next_day() {
        // 60 emails against a cap of 50: 50 today, 10 tomorrow.
        let now = at(2026, 1, 5, 0, 0);
        let slots = pack_slots(now, &config(), 60, &HashMap::new()).unwrap();
        assert_eq!(slots.len(), 60);

        let today = now.date_naive();
        let day_one: Vec<_> = slots.iter().filter(|s| s.date_naive() == today).collect();
        let day_two: Vec<_> = slots
            .iter()
            .filter(|s| s.date_naive() == today + Days::new(1))
            .collect();
        assert_eq!(day_one.len(), 50);
        assert_eq!(day_two.len(), 10);

        // Slots respect the window and cadence.
        assert_eq!(*slots.first().unwrap(), at(2026, 1, 5, 9, 0));
        assert_eq!(slots[1], at(2026, 1, 5, 9, 2));
        for s in &slots {
            assert!(s.time() >= NaiveTime::from_hms_opt(9, 0, 0).unwrap());
            assert!(s.time() < NaiveTime::from_hms_opt(17, 0, 0).unwrap());
        }
    }

    #[test]
    fn test_pack_skips_past_slots_today() {
        // At 15:00 the remaining window still holds the full cap of 50,
        // all strictly in the future.
        let now = at(2026, 1, 5, 15, 0);
        let slots = pack_slots(now, &config(), 50, &HashMap::new()).unwrap();
        let today = now.date_naive();
        assert!(slots.iter().all(|s| s.date_naive() == today));
        assert!(slots.iter().all(|s| *s > now));

        // One more than fits today spills into tomorrow morning.
        let slots = pack_slots(now, &config(), 51, &HashMap::new()).unwrap();
        assert_eq!(
            slots.last().unwrap().date_naive(),
            today + Days::new(1)
        );
    }

    #[test]
    fn test_pack_accounts_for_existing_occupancy() {
        let now = at(2026, 1, 5, 0, 0);
        let mut used = HashMap::new();
        used.insert(now.date_naive(), 45u64);

        let slots = pack_slots(now, &config(), 10, &used).unwrap();
        let today: Vec<_> = slots
            .iter()
            .filter(|s| s.date_naive() == now.date_naive())
            .collect();
        assert_eq!(today.len(), 5);
    }

    #[test]
    fn test_pack_fails_beyond_horizon() {
        let now = at(2026, 1, 5, 0, 0);
        let mut tight = config();
        tight.horizon_days = 2;
        // 2 days * 50/day = 100 max.
        assert!(pack_slots(now, &tight, 101, &HashMap::new()).is_none());
        assert!(pack_slots(now, &tight, 100, &HashMap::new()).is_some());
    }

    #[test]
    fn test_pack_nothing_needed() {
        let now = at(2026, 1, 5, 0, 0);
        assert_eq!(pack_slots(now, &config(), 0, &HashMap::new()), Some(vec![]));
    }

    #[test]
    fn test_window_bounds_cap_slots_per_day() {
        // A one-hour window with 30-minute cadence holds at most 2 slots
        // per day regardless of the cap.
        let now = at(2026, 1, 5, 0, 0);
        let mut narrow = config();
        narrow.window_start_hour = 9;
        narrow.window_end_hour = 10;
        narrow.cadence_minutes = 30;
        narrow.horizon_days = 3;

        let slots = pack_slots(now, &narrow, 6, &HashMap::new()).unwrap();
        assert_eq!(slots.len(), 6);
        assert!(pack_slots(now, &narrow, 7, &HashMap::new()).is_none());
    }
}
