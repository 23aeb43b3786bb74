//! The send job executor: a periodic tick that claims due jobs, enforces
//! the per-day sent budget, and dispatches through the mail transport.
//!
//! Every claim is a compare-and-swap on the job row, so two executors (or
//! two overlapping ticks) can never dispatch the same job twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDateTime, NaiveTime, Utc};
use tracing::{info_span, Instrument};

use crate::config::EngineConfig;
use crate::db::send_job_repo::{self, SendJobRow};
use crate::db::{email_repo, Database};
use crate::donor::DonorDirectory;
use crate::error::{DispatchError, EngineError, Result};
use crate::events::{ChangeBroadcaster, ChangeKind};
use crate::generation::ContentFragment;
use crate::schedule::scheduler::pack_slots;
use crate::schedule::ScheduleConfigStore;
use crate::send::{MailTransport, OutgoingEmail};
use crate::session::{format_timestamp, CampaignService};

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    /// Jobs dispatched successfully.
    pub sent: u64,
    /// Jobs that failed and were requeued for a later attempt.
    pub requeued: u64,
    /// Jobs that exhausted their attempts and are now terminal.
    pub failed: u64,
    /// Due jobs left untouched because the day's sent budget was used up.
    pub deferred: u64,
}

/// Claims and dispatches due send jobs.
pub struct SendJobExecutor {
    db: Database,
    transport: Arc<dyn MailTransport>,
    directory: Arc<dyn DonorDirectory>,
    configs: ScheduleConfigStore,
    service: Arc<CampaignService>,
    events: ChangeBroadcaster,
    config: EngineConfig,
    shutdown: Arc<AtomicBool>,
}

impl SendJobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        transport: Arc<dyn MailTransport>,
        directory: Arc<dyn DonorDirectory>,
        configs: ScheduleConfigStore,
        service: Arc<CampaignService>,
        events: ChangeBroadcaster,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            transport,
            directory,
            configs,
            service,
            events,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the periodic tick loop. Returns a handle the host can await
    /// on shutdown.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let executor = Arc::clone(self);
        executor.shutdown.store(false, Ordering::SeqCst);
        let interval = Duration::from_secs(executor.config.tick_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if executor.shutdown.load(Ordering::SeqCst) {
                    log::info!("Send executor loop stopping");
                    break;
                }
                match executor.tick().await {
                    Ok(summary) if summary != TickSummary::default() => {
                        log::info!(
                            "Send tick: {} sent, {} requeued, {} failed, {} deferred",
                            summary.sent,
                            summary.requeued,
                            summary.failed,
                            summary.deferred
                        );
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Send tick failed: {}", e),
                }
            }
        })
    }

    /// Signals the tick loop to stop after the current iteration.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Runs one tick now. Also callable directly by hosts that drive
    /// their own clock.
    pub async fn tick(&self) -> Result<TickSummary> {
        self.tick_at(Utc::now()).await
    }

    /// [`tick`](Self::tick) with an explicit clock.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let span = info_span!("send_tick", at = %now);
        self.run_tick(now).instrument(span).await
    }

    async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        let now_str = format_timestamp(now);

        for organization_id in send_job_repo::organizations_with_due_jobs(&self.db, &now_str)? {
            let config = self.configs.get_or_default(&organization_id)?;
            let today = now.date_naive();
            let day_open = NaiveDateTime::new(today, NaiveTime::MIN).and_utc();
            let day_close = NaiveDateTime::new(today + Days::new(1), NaiveTime::MIN).and_utc();
            let sent_today = send_job_repo::count_sent_in_window(
                &self.db,
                &organization_id,
                &format_timestamp(day_open),
                &format_timestamp(day_close),
            )?;
            let budget = u64::from(config.daily_cap).saturating_sub(sent_today);

            let due =
                send_job_repo::due_job_ids(&self.db, &organization_id, &now_str, i64::MAX as u64)?;
            if budget == 0 {
                log::warn!(
                    "Org {} hit its daily cap ({}); deferring {} due jobs",
                    organization_id,
                    config.daily_cap,
                    due.len()
                );
                summary.deferred += due.len() as u64;
                continue;
            }
            summary.deferred += due.len().saturating_sub(budget as usize) as u64;

            for job_id in due.into_iter().take(budget as usize) {
                // CAS claim: the loser of a racing tick sees false and
                // moves on.
                if !send_job_repo::claim(&self.db, &job_id, &format_timestamp(now))? {
                    continue;
                }
                match self.dispatch_claimed(&job_id, now).await? {
                    DispatchResult::Sent => summary.sent += 1,
                    DispatchResult::Requeued => summary.requeued += 1,
                    DispatchResult::Failed => summary.failed += 1,
                }
            }
        }
        Ok(summary)
    }

    async fn dispatch_claimed(&self, job_id: &str, now: DateTime<Utc>) -> Result<DispatchResult> {
        let job = send_job_repo::find_by_id(&self.db, job_id)?.ok_or(EngineError::NotFound {
            entity: "send job",
            id: job_id.to_string(),
        })?;
        let email = match email_repo::find_by_id(&self.db, &job.email_id)? {
            Some(e) => e,
            None => {
                // Email deleted after scheduling; terminal, no retry.
                send_job_repo::record_failure(
                    &self.db,
                    job_id,
                    "email no longer exists",
                    None,
                    &format_timestamp(now),
                )?;
                return Ok(DispatchResult::Failed);
            }
        };
        if email.is_sent {
            // Another path already delivered this email; record the job
            // as done without dispatching a duplicate.
            log::warn!(
                "Job {} targets already-sent email {}; skipping dispatch",
                job_id,
                email.id
            );
            send_job_repo::mark_sent(&self.db, job_id, "duplicate-suppressed", &format_timestamp(now))?;
            return Ok(DispatchResult::Sent);
        }

        let outcome = self.deliver(&job, &email).await;
        match outcome {
            Ok(message_id) => {
                let now_str = format_timestamp(now);
                send_job_repo::mark_sent(&self.db, job_id, &message_id, &now_str)?;
                email_repo::mark_sent(&self.db, &email.id, &now_str)?;
                self.events
                    .notify(&job.session_id, &job.organization_id, ChangeKind::EmailSent);

                // COMPLETED is reached lazily, after the last approved
                // email lands.
                match self.service.mark_completed(&job.organization_id, &job.session_id) {
                    Ok(_) | Err(EngineError::InvalidState(_)) => {}
                    Err(e) => log::warn!(
                        "Completion check for session {} failed: {}",
                        job.session_id,
                        e
                    ),
                }
                Ok(DispatchResult::Sent)
            }
            Err(e) => {
                let attempts = job.attempt_count + 1;
                let now_str = format_timestamp(now);
                if attempts >= self.config.max_send_attempts {
                    send_job_repo::record_failure(&self.db, job_id, &e.to_string(), None, &now_str)?;
                    email_repo::mark_send_failed(&self.db, &email.id, &e.to_string(), &now_str)?;
                    log::error!(
                        "Job {} failed permanently after {} attempts: {}",
                        job_id,
                        attempts,
                        e
                    );
                    self.events
                        .notify(&job.session_id, &job.organization_id, ChangeKind::JobFailed);
                    Ok(DispatchResult::Failed)
                } else {
                    let retry_at = self.retry_slot(&job.organization_id, now)?;
                    send_job_repo::record_failure(
                        &self.db,
                        job_id,
                        &e.to_string(),
                        Some(&format_timestamp(retry_at)),
                        &now_str,
                    )?;
                    log::warn!(
                        "Job {} attempt {} failed, retrying at {}: {}",
                        job_id,
                        attempts,
                        retry_at,
                        e
                    );
                    Ok(DispatchResult::Requeued)
                }
            }
        }
    }

    /// Where a failed dispatch retries: the backoff delay, pushed to the
    /// next open slot when the target day's cap is already full.
    fn retry_slot(&self, organization_id: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let backoff = now + chrono::Duration::seconds(self.config.retry_backoff_secs as i64);
        let config = self.configs.get_or_default(organization_id)?;

        let mut used_per_day = HashMap::new();
        for offset in 0..u64::from(config.horizon_days) {
            let date = backoff.date_naive() + Days::new(offset);
            let start = NaiveDateTime::new(date, NaiveTime::MIN).and_utc();
            let end = NaiveDateTime::new(date + Days::new(1), NaiveTime::MIN).and_utc();
            let count = send_job_repo::count_for_day(
                &self.db,
                organization_id,
                &format_timestamp(start),
                &format_timestamp(end),
            )?;
            used_per_day.insert(date, count);
        }

        // An exhausted horizon falls back to the plain backoff; the budget
        // check at dispatch time still holds the cap.
        Ok(pack_slots(backoff, &config, 1, &used_per_day)
            .and_then(|slots| slots.into_iter().next())
            .unwrap_or(backoff))
    }

    /// Renders and dispatches one email, bounded by the dispatch timeout.
    async fn deliver(
        &self,
        job: &SendJobRow,
        email: &email_repo::EmailRow,
    ) -> std::result::Result<String, DispatchError> {
        let fragments: Vec<ContentFragment> =
            serde_json::from_str(&email.content).map_err(|e| {
                DispatchError::Transport(format!("email {} content is unreadable: {}", email.id, e))
            })?;
        let body = fragments
            .iter()
            .map(|f| f.piece.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let donors = self
            .directory
            .donors_by_ids(&job.organization_id, &[email.donor_id.clone()])
            .await
            .map_err(|e| DispatchError::Transport(format!("donor lookup failed: {}", e)))?;
        let donor = donors
            .into_iter()
            .next()
            .ok_or_else(|| DispatchError::Transport(format!("donor {} not found", email.donor_id)))?;

        let outgoing = OutgoingEmail {
            to: donor.email.clone(),
            to_name: donor.display_name(),
            subject: email.subject.clone(),
            body,
        };

        let timeout = Duration::from_secs(self.config.dispatch_timeout_secs);
        match tokio::time::timeout(timeout, self.transport.send(&outgoing)).await {
            Ok(result) => result.map(|receipt| receipt.message_id),
            Err(_) => Err(DispatchError::Timeout(self.config.dispatch_timeout_secs)),
        }
    }
}

enum DispatchResult {
    Sent,
    Requeued,
    Failed,
}
