//! Per-donor generation fan-out.
//!
//! Each donor in a batch gets one independent generation attempt; a
//! donor's failure is recorded and never blocks the others. Parallelism
//! is bounded, every provider call carries a timeout, and results are
//! upserted so a retried donor updates its prior row instead of
//! duplicating it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::email_repo::{self, EmailRow};
use crate::db::{session_repo, Database};
use crate::donor::{Donor, DonorDirectory};
use crate::error::{EngineError, GenerationError, Result};
use crate::generation::{GeneratedContent, GenerationProvider};
use crate::sanitize;

/// One donor that could not be generated for, with the reason.
#[derive(Debug, Clone)]
pub struct DonorFailure {
    pub donor_id: String,
    pub reason: String,
}

/// Aggregate result of one batch run.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Donors attempted in this run (excludes skips after cancellation).
    pub attempted: usize,
    /// Donor ids whose email row was written.
    pub generated: Vec<String>,
    /// Per-donor failures, in completion order.
    pub failures: Vec<DonorFailure>,
    /// Session-wide completed-donor count after reconciliation.
    pub completed_donors: u32,
}

impl BatchOutcome {
    /// Human-readable rollup of failures for the session's error_message,
    /// or None if everything succeeded.
    pub fn failure_rollup(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let entries: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.donor_id, f.reason))
            .collect();
        Some(sanitize::truncate_rollup(&entries, 20))
    }
}

enum AttemptResult {
    Generated(Box<GeneratedContent>),
    Failed(String),
    /// The session left GENERATING while this donor was queued; the
    /// attempt never started. Cancellation is cooperative.
    Skipped,
}

/// Fans one generation attempt out per donor against a session.
pub struct GenerationCoordinator {
    db: Database,
    provider: Arc<dyn GenerationProvider>,
    directory: Arc<dyn DonorDirectory>,
    config: EngineConfig,
}

impl GenerationCoordinator {
    pub fn new(
        db: Database,
        provider: Arc<dyn GenerationProvider>,
        directory: Arc<dyn DonorDirectory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            provider,
            directory,
            config,
        }
    }

    /// Runs one generation attempt per donor id. Invoking this twice for
    /// the same donor upserts rather than duplicating (retry semantics).
    /// After the batch drains, the session's completed_donors counter and
    /// error_message rollup are reconciled atomically.
    pub async fn run_batch(
        &self,
        organization_id: &str,
        session_id: &str,
        donor_ids: &[String],
    ) -> Result<BatchOutcome> {
        let span = info_span!("generation_batch",
            session_id = %session_id,
            donors = donor_ids.len(),
        );
        self.run_batch_inner(organization_id, session_id, donor_ids)
            .instrument(span)
            .await
    }

    async fn run_batch_inner(
        &self,
        organization_id: &str,
        session_id: &str,
        donor_ids: &[String],
    ) -> Result<BatchOutcome> {
        let session = session_repo::find_by_id(&self.db, organization_id, session_id)?
            .ok_or_else(|| EngineError::NotFound {
                entity: "session",
                id: session_id.to_string(),
            })?;
        let prompt = session
            .refined_instruction
            .clone()
            .unwrap_or_else(|| session.instruction.clone());

        let donors = self
            .directory
            .donors_by_ids(organization_id, donor_ids)
            .await?;
        let mut by_id: HashMap<String, Donor> =
            donors.into_iter().map(|d| (d.id.clone(), d)).collect();

        let mut failures: Vec<DonorFailure> = Vec::new();
        let mut resolved: Vec<Donor> = Vec::new();
        for donor_id in donor_ids {
            match by_id.remove(donor_id) {
                Some(donor) => resolved.push(donor),
                None => failures.push(DonorFailure {
                    donor_id: donor_id.clone(),
                    reason: "donor not found in directory".to_string(),
                }),
            }
        }

        let attempted = resolved.len();
        let timeout_secs = self.config.generation_timeout_secs;
        let parallelism = self.config.max_parallel_generations.max(1);

        let attempts = stream::iter(resolved.into_iter().map(|donor| {
            let provider = Arc::clone(&self.provider);
            let prompt = prompt.clone();
            let db = self.db.clone();
            let session_id = session_id.to_string();
            async move {
                // Cooperative cancellation: a session pulled out of
                // GENERATING stops new attempts, never in-flight ones.
                let still_generating = session_status(&db, &session_id)
                    .map(|s| s == "generating")
                    .unwrap_or(false);
                if !still_generating {
                    return (donor, AttemptResult::Skipped);
                }

                let call = provider.generate(&prompt, &donor);
                let result =
                    match tokio::time::timeout(Duration::from_secs(timeout_secs), call).await {
                        Ok(inner) => inner,
                        Err(_) => Err(GenerationError::Timeout(timeout_secs)),
                    };
                match result {
                    Ok(content) => (donor, AttemptResult::Generated(Box::new(content))),
                    Err(e) => (donor, AttemptResult::Failed(e.to_string())),
                }
            }
        }))
        .buffer_unordered(parallelism);
        futures_util::pin_mut!(attempts);

        let mut generated: Vec<String> = Vec::new();
        while let Some((donor, result)) = attempts.next().await {
            match result {
                AttemptResult::Generated(content) => {
                    match self.store_email(session_id, &donor, &content) {
                        Ok(()) => generated.push(donor.id),
                        Err(e) => failures.push(DonorFailure {
                            donor_id: donor.id,
                            reason: e.to_string(),
                        }),
                    }
                }
                AttemptResult::Failed(reason) => {
                    log::warn!(
                        "Generation failed for donor {}: {}",
                        sanitize::hash_donor_id(&donor.id),
                        reason
                    );
                    failures.push(DonorFailure {
                        donor_id: donor.id,
                        reason,
                    });
                }
                AttemptResult::Skipped => {}
            }
        }

        let mut outcome = BatchOutcome {
            attempted,
            generated,
            failures,
            completed_donors: 0,
        };

        let rollup = outcome.failure_rollup();
        outcome.completed_donors = session_repo::reconcile_progress(
            &self.db,
            session_id,
            rollup.as_deref(),
            &Utc::now().to_rfc3339(),
        )?;

        log::info!(
            "Generation batch for session {} finished: {} generated, {} failed",
            session_id,
            outcome.generated.len(),
            outcome.failures.len()
        );

        Ok(outcome)
    }

    fn store_email(
        &self,
        session_id: &str,
        donor: &Donor,
        content: &GeneratedContent,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let row = EmailRow {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            donor_id: donor.id.clone(),
            subject: content.subject.clone(),
            content: serde_json::to_string(&content.fragments)
                .map_err(crate::db::DatabaseError::Json)?,
            reference_contexts: serde_json::to_string(&content.reference_contexts)
                .map_err(crate::db::DatabaseError::Json)?,
            review_status: "pending_approval".to_string(),
            reject_reason: None,
            is_sent: false,
            sent_at: None,
            send_status: None,
            send_error: None,
            created_at: now.clone(),
            updated_at: now,
        };
        email_repo::upsert(&self.db, &row)?;
        Ok(())
    }
}

fn session_status(db: &Database, session_id: &str) -> Option<String> {
    db.with_conn(|conn| {
        let status: String = conn.query_row(
            "SELECT status FROM campaign_sessions WHERE id = ?1",
            rusqlite::params![session_id],
            |r| r.get(0),
        )?;
        Ok(status)
    })
    .ok()
}
