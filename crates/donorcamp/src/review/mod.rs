//! The review gate: every generated email is held for human approval
//! before it can be scheduled, with bulk actions and a per-email
//! enhancement loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::db::email_repo::{self, EmailRow};
use crate::db::{session_repo, Database, DatabaseError};
use crate::donor::DonorDirectory;
use crate::error::{EngineError, GenerationError, Result};
use crate::events::{ChangeBroadcaster, ChangeKind};
use crate::generation::{ContentFragment, GeneratedContent, GenerationProvider};
use crate::session::parse_timestamp;

/// Review disposition of a generated email.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    PendingApproval,
    Approved,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::PendingApproval => "pending_approval",
            ReviewStatus::Approved => "approved",
        }
    }
}

fn parse_review_status(s: &str, email_id: &str) -> ReviewStatus {
    match s {
        "approved" => ReviewStatus::Approved,
        "pending_approval" => ReviewStatus::PendingApproval,
        other => {
            log::warn!(
                "Unknown review status '{}' for email {}, treating as pending",
                other,
                email_id
            );
            ReviewStatus::PendingApproval
        }
    }
}

/// What a bulk review request does to its targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    /// Rejection keeps the email pending with a recorded reason; the
    /// enhance loop is how a rejected email gets fixed.
    Reject,
}

/// Typed view over a generated email row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedEmail {
    pub id: String,
    pub session_id: String,
    pub donor_id: String,
    pub subject: String,
    pub fragments: Vec<ContentFragment>,
    pub reference_contexts: Vec<String>,
    pub review_status: ReviewStatus,
    pub reject_reason: Option<String>,
    pub is_sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub send_status: Option<String>,
    pub send_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GeneratedEmail {
    pub fn from_row(row: EmailRow) -> Result<Self> {
        Ok(Self {
            fragments: serde_json::from_str(&row.content).map_err(DatabaseError::Json)?,
            reference_contexts: serde_json::from_str(&row.reference_contexts)
                .map_err(DatabaseError::Json)?,
            review_status: parse_review_status(&row.review_status, &row.id),
            sent_at: row.sent_at.as_deref().map(parse_timestamp),
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            id: row.id,
            session_id: row.session_id,
            donor_id: row.donor_id,
            subject: row.subject,
            reject_reason: row.reject_reason,
            is_sent: row.is_sent,
            send_status: row.send_status,
            send_error: row.send_error,
        })
    }

    fn to_content(&self) -> GeneratedContent {
        GeneratedContent {
            subject: self.subject.clone(),
            fragments: self.fragments.clone(),
            reference_contexts: self.reference_contexts.clone(),
        }
    }
}

/// Approve/reject surface over a session's generated emails.
pub struct ReviewGate {
    db: Database,
    provider: Arc<dyn GenerationProvider>,
    directory: Arc<dyn DonorDirectory>,
    events: ChangeBroadcaster,
    config: EngineConfig,
}

impl ReviewGate {
    pub fn new(
        db: Database,
        provider: Arc<dyn GenerationProvider>,
        directory: Arc<dyn DonorDirectory>,
        events: ChangeBroadcaster,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            provider,
            directory,
            events,
            config,
        }
    }

    /// Lists a session's emails, optionally filtered by review status.
    pub fn list_emails(
        &self,
        organization_id: &str,
        session_id: &str,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<GeneratedEmail>> {
        self.ensure_session(organization_id, session_id)?;
        let rows = email_repo::list_for_session(&self.db, session_id, status.map(|s| s.as_str()))?;
        rows.into_iter().map(GeneratedEmail::from_row).collect()
    }

    /// Emails still waiting on a reviewer's decision.
    pub fn list_pending_emails(
        &self,
        organization_id: &str,
        session_id: &str,
    ) -> Result<Vec<GeneratedEmail>> {
        self.list_emails(
            organization_id,
            session_id,
            Some(ReviewStatus::PendingApproval),
        )
    }

    /// Applies one review action to a set of emails. Already-approved and
    /// already-sent emails are skipped, not errored; the returned count is
    /// how many rows actually changed.
    pub fn bulk_review(
        &self,
        organization_id: &str,
        session_id: &str,
        email_ids: &[String],
        action: ReviewAction,
        reason: Option<&str>,
    ) -> Result<u64> {
        self.ensure_session(organization_id, session_id)?;
        if email_ids.is_empty() {
            return Err(EngineError::Validation(
                "email id set must not be empty".to_string(),
            ));
        }
        if action == ReviewAction::Reject && reason.map_or(true, |r| r.trim().is_empty()) {
            return Err(EngineError::Validation(
                "rejection requires a reason".to_string(),
            ));
        }

        let changed = email_repo::bulk_review(
            &self.db,
            organization_id,
            email_ids,
            action == ReviewAction::Approve,
            reason,
            &Utc::now().to_rfc3339(),
        )?;
        log::info!(
            "Review {:?} applied to {}/{} emails in session {}",
            action,
            changed,
            email_ids.len(),
            session_id
        );
        self.events
            .notify(session_id, organization_id, ChangeKind::EmailsReviewed);
        Ok(changed)
    }

    /// Approves every email still pending in the session.
    pub fn approve_all_pending(&self, organization_id: &str, session_id: &str) -> Result<u64> {
        self.ensure_session(organization_id, session_id)?;
        let pending: Vec<String> = email_repo::list_for_session(
            &self.db,
            session_id,
            Some(ReviewStatus::PendingApproval.as_str()),
        )?
        .into_iter()
        .filter(|row| !row.is_sent)
        .map(|row| row.id)
        .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        self.bulk_review(
            organization_id,
            session_id,
            &pending,
            ReviewAction::Approve,
            None,
        )
    }

    /// Manually edits an email's subject and body. Edited content always
    /// re-enters review: an approved email is demoted back to pending
    /// approval. Sent emails are frozen.
    pub fn update_email(
        &self,
        organization_id: &str,
        email_id: &str,
        subject: &str,
        fragments: &[ContentFragment],
    ) -> Result<GeneratedEmail> {
        let row = self.load_email(organization_id, email_id)?;
        if subject.trim().is_empty() {
            return Err(EngineError::Validation(
                "subject must not be blank".to_string(),
            ));
        }

        let content_json = serde_json::to_string(fragments).map_err(DatabaseError::Json)?;
        let applied = email_repo::update_content(
            &self.db,
            email_id,
            subject,
            &content_json,
            &row.reference_contexts,
            &Utc::now().to_rfc3339(),
        )?;
        if !applied {
            return Err(EngineError::InvalidState(format!(
                "email {} is no longer editable",
                email_id
            )));
        }
        self.events
            .notify(&row.session_id, organization_id, ChangeKind::EmailUpdated);
        self.reload(organization_id, email_id)
    }

    /// Regenerates an email with an extra instruction via the provider's
    /// refine call. The result replaces the content and returns the email
    /// to pending approval.
    pub async fn enhance_email(
        &self,
        organization_id: &str,
        email_id: &str,
        instruction: &str,
    ) -> Result<GeneratedEmail> {
        if instruction.trim().is_empty() {
            return Err(EngineError::Validation(
                "enhancement instruction must not be blank".to_string(),
            ));
        }
        let row = self.load_email(organization_id, email_id)?;
        if row.is_sent {
            return Err(EngineError::InvalidState(format!(
                "email {} was already sent",
                email_id
            )));
        }
        let email = GeneratedEmail::from_row(row)?;

        let donors = self
            .directory
            .donors_by_ids(organization_id, &[email.donor_id.clone()])
            .await?;
        let donor = donors.into_iter().next().ok_or_else(|| EngineError::NotFound {
            entity: "donor",
            id: email.donor_id.clone(),
        })?;

        let timeout = Duration::from_secs(self.config.generation_timeout_secs);
        let refined = match tokio::time::timeout(
            timeout,
            self.provider
                .refine(&email.to_content(), instruction, &donor),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(
                    GenerationError::Timeout(self.config.generation_timeout_secs).into(),
                )
            }
        };

        let content_json = serde_json::to_string(&refined.fragments).map_err(DatabaseError::Json)?;
        let contexts_json =
            serde_json::to_string(&refined.reference_contexts).map_err(DatabaseError::Json)?;
        let applied = email_repo::update_content(
            &self.db,
            email_id,
            &refined.subject,
            &content_json,
            &contexts_json,
            &Utc::now().to_rfc3339(),
        )?;
        if !applied {
            return Err(EngineError::InvalidState(format!(
                "email {} is no longer editable",
                email_id
            )));
        }
        log::info!("Enhanced email {}", email_id);
        self.events
            .notify(&email.session_id, organization_id, ChangeKind::EmailUpdated);
        self.reload(organization_id, email_id)
    }

    fn reload(&self, organization_id: &str, email_id: &str) -> Result<GeneratedEmail> {
        GeneratedEmail::from_row(self.load_email(organization_id, email_id)?)
    }

    /// Loads an email and verifies its session belongs to the caller's
    /// organization.
    fn load_email(&self, organization_id: &str, email_id: &str) -> Result<EmailRow> {
        let row = email_repo::find_by_id(&self.db, email_id)?.ok_or_else(|| {
            EngineError::NotFound {
                entity: "email",
                id: email_id.to_string(),
            }
        })?;
        match session_repo::organization_of(&self.db, &row.session_id)? {
            Some(org) if org == organization_id => Ok(row),
            Some(_) => Err(EngineError::Forbidden {
                entity: "email",
                id: email_id.to_string(),
            }),
            None => Err(EngineError::NotFound {
                entity: "email",
                id: email_id.to_string(),
            }),
        }
    }

    fn ensure_session(&self, organization_id: &str, session_id: &str) -> Result<()> {
        match session_repo::find_by_id(&self.db, organization_id, session_id)? {
            Some(_) => Ok(()),
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
