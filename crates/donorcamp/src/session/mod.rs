//! Campaign session aggregate: the typed model over session rows and the
//! canonical status machine.

pub mod service;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::session_repo::SessionRow;
use crate::db::DatabaseError;

pub use service::{CampaignService, NewCampaign, SessionStatusReport};

/// Canonical campaign session status machine:
/// `DRAFT → PENDING → GENERATING → READY_TO_SEND → COMPLETED`, with
/// `FAILED` reachable from PENDING/GENERATING on unrecoverable error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Pending,
    Generating,
    ReadyToSend,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Pending => "pending",
            CampaignStatus::Generating => "generating",
            CampaignStatus::ReadyToSend => "ready_to_send",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }

    /// True once the session can never move again (absent explicit retry).
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse_status(s: &str, session_id: &str) -> CampaignStatus {
    match s {
        "draft" => CampaignStatus::Draft,
        "pending" => CampaignStatus::Pending,
        "generating" | "in_progress" => CampaignStatus::Generating,
        "ready_to_send" => CampaignStatus::ReadyToSend,
        "completed" => CampaignStatus::Completed,
        "failed" => CampaignStatus::Failed,
        other => {
            log::warn!(
                "Unknown session status '{}' for session {}, defaulting to Pending",
                other,
                session_id
            );
            CampaignStatus::Pending
        }
    }
}

/// Role of one turn in the session's refinement conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One typed turn of the refinement conversation — an explicit
/// append-only log, never a loosely-typed JSON array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One bulk email campaign run, scoped to an organization and a fixed
/// donor set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSession {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub instruction: String,
    pub refined_instruction: Option<String>,
    pub chat_history: Vec<ChatTurn>,
    pub donor_ids: Vec<String>,
    pub preview_donor_ids: Vec<String>,
    pub status: CampaignStatus,
    pub total_donors: u32,
    pub completed_donors: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CampaignSession {
    /// Builds the typed model from a raw row.
    pub fn from_row(row: SessionRow) -> Result<Self, DatabaseError> {
        Ok(Self {
            status: parse_status(&row.status, &row.id),
            chat_history: serde_json::from_str(&row.chat_history)?,
            donor_ids: serde_json::from_str(&row.donor_ids)?,
            preview_donor_ids: serde_json::from_str(&row.preview_donor_ids)?,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
            id: row.id,
            organization_id: row.organization_id,
            user_id: row.user_id,
            instruction: row.instruction,
            refined_instruction: row.refined_instruction,
            total_donors: row.total_donors,
            completed_donors: row.completed_donors,
            error_message: row.error_message,
        })
    }
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}

pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}
