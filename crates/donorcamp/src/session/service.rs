//! Campaign session operations: creation, generation dispatch, retry,
//! status reporting, listing and deletion.
//!
//! All operations are organization-scoped. A session id that exists under
//! a different organization is `Forbidden`, never silently missing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::db::email_repo::{self, EmailCounts};
use crate::db::session_repo::{self, SessionFilter, SessionRow};
use crate::db::{send_job_repo, Database};
use crate::error::{EngineError, Result};
use crate::events::{ChangeBroadcaster, ChangeKind};
use crate::generation::{BatchOutcome, GenerationCoordinator};
use crate::session::{format_timestamp, CampaignSession, CampaignStatus};

/// Parameters for creating a campaign session.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub organization_id: String,
    pub user_id: String,
    pub instruction: String,
    pub donor_ids: Vec<String>,
    pub preview_donor_ids: Vec<String>,
    /// true: enter PENDING (launched immediately); false: stay DRAFT.
    pub launch: bool,
}

/// Counts-first status view. List/status surfaces report counts, never
/// raw errors — only the aggregated rollup is exposed.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusReport {
    pub session: CampaignSession,
    pub emails: EmailCountsView,
    pub jobs: JobCountsView,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailCountsView {
    pub total: u64,
    pub pending_approval: u64,
    pub approved: u64,
    pub sent: u64,
    pub send_failed: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCountsView {
    pub scheduled: u64,
    pub paused: u64,
    pub sending: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl From<EmailCounts> for EmailCountsView {
    fn from(c: EmailCounts) -> Self {
        Self {
            total: c.total,
            pending_approval: c.pending,
            approved: c.approved,
            sent: c.sent,
            send_failed: c.send_failed,
        }
    }
}

/// The session aggregate's operation surface.
pub struct CampaignService {
    db: Database,
    coordinator: Arc<GenerationCoordinator>,
    events: ChangeBroadcaster,
}

impl CampaignService {
    pub fn new(
        db: Database,
        coordinator: Arc<GenerationCoordinator>,
        events: ChangeBroadcaster,
    ) -> Self {
        Self {
            db,
            coordinator,
            events,
        }
    }

    /// Creates a session in DRAFT (manual draft) or PENDING (launched).
    /// The donor set is deduplicated preserving order and frozen as
    /// total_donors.
    pub fn create_session(&self, new: NewCampaign) -> Result<CampaignSession> {
        if new.instruction.trim().is_empty() {
            return Err(EngineError::Validation(
                "instruction must not be blank".to_string(),
            ));
        }
        let donor_ids = dedup_preserving_order(new.donor_ids);
        if donor_ids.is_empty() {
            return Err(EngineError::Validation(
                "donor set must not be empty".to_string(),
            ));
        }
        for preview_id in &new.preview_donor_ids {
            if !donor_ids.contains(preview_id) {
                return Err(EngineError::Validation(format!(
                    "preview donor '{}' is not in the selected donor set",
                    preview_id
                )));
            }
        }

        let now = format_timestamp(Utc::now());
        let status = if new.launch {
            CampaignStatus::Pending
        } else {
            CampaignStatus::Draft
        };
        let row = SessionRow {
            id: Uuid::new_v4().to_string(),
            organization_id: new.organization_id.clone(),
            user_id: new.user_id,
            instruction: new.instruction,
            refined_instruction: None,
            chat_history: "[]".to_string(),
            donor_ids: serde_json::to_string(&donor_ids).map_err(crate::db::DatabaseError::Json)?,
            preview_donor_ids: serde_json::to_string(&new.preview_donor_ids)
                .map_err(crate::db::DatabaseError::Json)?,
            status: status.as_str().to_string(),
            total_donors: donor_ids.len() as u32,
            completed_donors: 0,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        };
        session_repo::insert(&self.db, &row)?;
        log::info!(
            "Created campaign session {} for org {} ({} donors, {})",
            row.id,
            new.organization_id,
            row.total_donors,
            status
        );
        self.events
            .notify(&row.id, &new.organization_id, ChangeKind::SessionCreated);
        self.load(&new.organization_id, &row.id)
    }

    /// Runs generation for the full donor set. Idempotent: re-invoking
    /// while a batch is already running, or after one has already produced
    /// READY_TO_SEND, returns the current state instead of dispatching a
    /// second batch.
    pub async fn generate_emails(
        &self,
        organization_id: &str,
        session_id: &str,
    ) -> Result<CampaignSession> {
        let session = self.load(organization_id, session_id)?;

        if matches!(
            session.status,
            CampaignStatus::Generating | CampaignStatus::ReadyToSend
        ) {
            log::debug!(
                "generate_emails on session {} ({}): already dispatched, no-op",
                session_id,
                session.status
            );
            return Ok(session);
        }

        let claimed = session_repo::transition_status(
            &self.db,
            session_id,
            &["draft", "pending"],
            "generating",
            &format_timestamp(Utc::now()),
        )?;
        if !claimed {
            // Lost the launch race. The winner may still be mid-batch or
            // may already have finished; either way its dispatch stands.
            let current = self.load(organization_id, session_id)?;
            if matches!(
                current.status,
                CampaignStatus::Generating | CampaignStatus::ReadyToSend
            ) {
                return Ok(current);
            }
            return Err(EngineError::InvalidState(format!(
                "cannot generate from status '{}'",
                current.status
            )));
        }

        self.events
            .notify(session_id, organization_id, ChangeKind::GenerationStarted);

        let donor_ids = session.donor_ids.clone();
        let outcome = self
            .coordinator
            .run_batch(organization_id, session_id, &donor_ids)
            .await?;
        self.apply_batch_outcome(organization_id, session_id, &outcome)?;
        self.load(organization_id, session_id)
    }

    /// Re-enters GENERATING for the donors that still lack a generated
    /// email. Donors whose email already exists (approved or pending) are
    /// untouched — their rows are not rewritten.
    pub async fn retry_campaign(
        &self,
        organization_id: &str,
        session_id: &str,
    ) -> Result<CampaignSession> {
        let session = self.load(organization_id, session_id)?;
        if !matches!(
            session.status,
            CampaignStatus::Generating | CampaignStatus::Failed | CampaignStatus::ReadyToSend
        ) {
            return Err(EngineError::InvalidState(format!(
                "cannot retry from status '{}'",
                session.status
            )));
        }

        let have: Vec<String> = email_repo::donor_ids_with_email(&self.db, session_id)?;
        let remaining: Vec<String> = session
            .donor_ids
            .iter()
            .filter(|id| !have.contains(id))
            .cloned()
            .collect();
        if remaining.is_empty() {
            log::debug!("retry_campaign on session {}: nothing to retry", session_id);
            return Ok(session);
        }

        if !session_repo::reopen(&self.db, session_id, &format_timestamp(Utc::now()))? {
            return Err(EngineError::InvalidState(
                "session left a retryable state".to_string(),
            ));
        }
        self.events
            .notify(session_id, organization_id, ChangeKind::GenerationStarted);

        let outcome = self
            .coordinator
            .run_batch(organization_id, session_id, &remaining)
            .await?;
        self.apply_batch_outcome(organization_id, session_id, &outcome)?;
        self.load(organization_id, session_id)
    }

    /// READY_TO_SEND → COMPLETED once every approved email has been sent.
    /// Called by the send executor after each successful dispatch; safe to
    /// call when the session is already terminal.
    pub fn mark_completed(&self, organization_id: &str, session_id: &str) -> Result<bool> {
        let session = self.load(organization_id, session_id)?;
        if session.status == CampaignStatus::Completed {
            return Ok(false);
        }
        if session.status != CampaignStatus::ReadyToSend {
            return Err(EngineError::InvalidState(format!(
                "cannot complete from status '{}'",
                session.status
            )));
        }

        let counts = email_repo::counts_for_session(&self.db, session_id)?;
        let all_sent = counts.approved > 0 && counts.sent == counts.approved;
        if !all_sent || send_job_repo::has_active_jobs(&self.db, session_id)? {
            return Ok(false);
        }

        session_repo::mark_terminal(
            &self.db,
            session_id,
            "completed",
            &format_timestamp(Utc::now()),
        )?;
        log::info!("Campaign session {} completed", session_id);
        self.events
            .notify(session_id, organization_id, ChangeKind::SessionCompleted);
        Ok(true)
    }

    /// Counts-first status view for one session.
    pub fn get_session_status(
        &self,
        organization_id: &str,
        session_id: &str,
    ) -> Result<SessionStatusReport> {
        let session = self.load(organization_id, session_id)?;
        let emails = email_repo::counts_for_session(&self.db, session_id)?;

        let mut jobs = JobCountsView::default();
        let mut by_status: HashMap<String, u64> = HashMap::new();
        for job in send_job_repo::list_for_session(&self.db, session_id, None)? {
            *by_status.entry(job.status).or_insert(0) += 1;
        }
        jobs.scheduled = by_status.remove("scheduled").unwrap_or(0);
        jobs.paused = by_status.remove("paused").unwrap_or(0);
        jobs.sending = by_status.remove("sending").unwrap_or(0);
        jobs.sent = by_status.remove("sent").unwrap_or(0);
        jobs.failed = by_status.remove("failed").unwrap_or(0);
        jobs.cancelled = by_status.remove("cancelled").unwrap_or(0);

        Ok(SessionStatusReport {
            session,
            emails: emails.into(),
            jobs,
        })
    }

    /// Lists sessions for an organization, newest first.
    pub fn list_campaigns(
        &self,
        organization_id: &str,
        filter: &SessionFilter,
    ) -> Result<(Vec<CampaignSession>, u64)> {
        let (rows, total) = session_repo::query(&self.db, organization_id, filter)?;
        let sessions = rows
            .into_iter()
            .map(CampaignSession::from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((sessions, total))
    }

    /// Deletes a session and everything hanging off it (emails and jobs
    /// cascade). Outstanding jobs are cancelled first so an executor tick
    /// racing the delete cannot claim them.
    pub fn delete_campaign(&self, organization_id: &str, session_id: &str) -> Result<()> {
        self.load(organization_id, session_id)?;
        send_job_repo::transition_session_jobs(
            &self.db,
            session_id,
            &["scheduled", "paused"],
            "cancelled",
            &format_timestamp(Utc::now()),
        )?;
        session_repo::delete(&self.db, session_id)?;
        log::info!("Deleted campaign session {}", session_id);
        self.events
            .notify(session_id, organization_id, ChangeKind::SessionDeleted);
        Ok(())
    }

    /// Loads a session, distinguishing NotFound from cross-tenant access.
    pub(crate) fn load(&self, organization_id: &str, session_id: &str) -> Result<CampaignSession> {
        match session_repo::find_by_id(&self.db, organization_id, session_id)? {
            Some(row) => Ok(CampaignSession::from_row(row)?),
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

    /// Applies the post-batch transition: READY_TO_SEND when every donor
    /// completed, FAILED when nothing has ever succeeded and every attempt
    /// in this run failed, otherwise stay GENERATING awaiting retry.
    fn apply_batch_outcome(
        &self,
        organization_id: &str,
        session_id: &str,
        outcome: &BatchOutcome,
    ) -> Result<()> {
        let session = self.load(organization_id, session_id)?;
        let now = format_timestamp(Utc::now());

        if session.status == CampaignStatus::Generating {
            if outcome.completed_donors >= session.total_donors {
                session_repo::transition_status(
                    &self.db,
                    session_id,
                    &["generating"],
                    "ready_to_send",
                    &now,
                )?;
            } else if outcome.completed_donors == 0
                && outcome.generated.is_empty()
                && !outcome.failures.is_empty()
            {
                session_repo::mark_terminal(&self.db, session_id, "failed", &now)?;
                self.events
                    .notify(session_id, organization_id, ChangeKind::SessionFailed);
            }
        }

        self.events
            .notify(session_id, organization_id, ChangeKind::GenerationFinished);
        Ok(())
    }
}

fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}
