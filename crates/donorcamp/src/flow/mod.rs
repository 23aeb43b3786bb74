//! Agentic conversation flows: short-lived, in-memory dialogue state used
//! to refine a campaign instruction into a confirmed generation prompt.
//!
//! Flows live outside the database on purpose. An abandoned dialogue is
//! worthless after a few minutes, so the store evicts by TTL instead of
//! persisting drafts nobody will resume.

pub mod engine;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use engine::ConversationEngine;
pub use store::FlowStore;

/// Where a flow currently sits in its dialogue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowStep {
    /// The engine asked a clarifying question and is waiting on the user.
    Question,
    /// A candidate prompt has been proposed; the user confirms or revises.
    Confirmation,
    /// Generation has been dispatched for the created session.
    Generating,
    /// Terminal. Further turns are rejected.
    Complete,
}

/// One turn of a flow dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowTurn {
    pub role: crate::session::TurnRole,
    pub content: String,
    /// The step the flow was in when this turn was appended.
    pub step: FlowStep,
    pub timestamp: DateTime<Utc>,
}

/// The full state of one refinement dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    /// The user's original instruction, verbatim.
    pub instruction: String,
    pub donor_ids: Vec<String>,
    pub preview_donor_ids: Vec<String>,
    pub turns: Vec<FlowTurn>,
    pub step: FlowStep,
    /// Clarification answers gathered so far, in ask order.
    pub clarifications: Vec<String>,
    /// The prompt currently proposed for confirmation, if any.
    pub proposed_prompt: Option<String>,
    /// Set once the user confirms; generation uses exactly this text.
    pub confirmed_prompt: Option<String>,
    /// The campaign session created by `execute_generation`, once any.
    pub session_id: Option<String>,
    /// Bumped on every committed turn. Stale readers can detect they
    /// missed an update.
    pub version: u64,
}

impl FlowState {
    /// True while the flow is blocked on a user reply.
    pub fn needs_user_input(&self) -> bool {
        matches!(self.step, FlowStep::Question | FlowStep::Confirmation)
            && self.confirmed_prompt.is_none()
    }

    /// True once the prompt is confirmed and generation may be dispatched.
    pub fn can_proceed(&self) -> bool {
        self.confirmed_prompt.is_some() && !self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.step == FlowStep::Complete
    }

    pub(crate) fn push_turn(&mut self, role: crate::session::TurnRole, content: &str) {
        self.turns.push(FlowTurn {
            role,
            content: content.to_string(),
            step: self.step,
            timestamp: Utc::now(),
        });
    }
}
