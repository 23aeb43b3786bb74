//! The conversation engine: turns a raw campaign instruction into a
//! confirmed generation prompt over a short dialogue, then hands the
//! result to the campaign service.
//!
//! The dialogue policy is deterministic. The engine inspects the
//! instruction for a fixed set of aspects (tone, occasion, call to
//! action) and asks at most `max_clarification_questions` about the ones
//! it cannot find, then proposes a composed prompt for confirmation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::flow::store::FlowStore;
use crate::flow::{FlowState, FlowStep};
use crate::session::{CampaignService, CampaignSession, NewCampaign, TurnRole};

/// An aspect of the campaign the engine wants pinned down before it
/// composes the final prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aspect {
    Tone,
    Occasion,
    CallToAction,
}

impl Aspect {
    const ALL: [Aspect; 3] = [Aspect::Tone, Aspect::Occasion, Aspect::CallToAction];

    fn question(&self) -> &'static str {
        match self {
            Aspect::Tone => {
                "What tone should these emails strike (for example warm, formal, urgent)?"
            }
            Aspect::Occasion => {
                "Is there a specific occasion or campaign these emails relate to?"
            }
            Aspect::CallToAction => {
                "Should the emails ask donors to take a specific action, and if so what?"
            }
        }
    }

    /// True when the text already covers this aspect.
    fn covered_by(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        let keywords: &[&str] = match self {
            Aspect::Tone => &[
                "tone", "warm", "formal", "casual", "friendly", "urgent", "heartfelt",
                "professional",
            ],
            Aspect::Occasion => &[
                "occasion",
                "event",
                "gala",
                "year-end",
                "year end",
                "holiday",
                "anniversary",
                "campaign for",
                "giving tuesday",
                "thanksgiving",
            ],
            Aspect::CallToAction => &[
                "ask them", "call to action", "donate", "give again", "rsvp", "volunteer",
                "share", "no ask", "no call",
            ],
        };
        keywords.iter().any(|k| lower.contains(k))
    }
}

fn missing_aspects(texts: &[&str]) -> Vec<Aspect> {
    Aspect::ALL
        .iter()
        .copied()
        .filter(|aspect| !texts.iter().any(|t| aspect.covered_by(t)))
        .collect()
}

fn is_affirmative(message: &str) -> bool {
    let normalized = message.trim().trim_end_matches(['.', '!']).to_lowercase();
    matches!(
        normalized.as_str(),
        "yes" | "y" | "ok" | "okay" | "confirm" | "confirmed" | "looks good" | "lgtm"
            | "go ahead" | "send it" | "approve" | "sounds good" | "perfect"
    )
}

/// Drives refinement dialogues and dispatches confirmed campaigns.
pub struct ConversationEngine {
    store: FlowStore,
    service: Arc<CampaignService>,
    config: EngineConfig,
}

impl ConversationEngine {
    pub fn new(service: Arc<CampaignService>, config: EngineConfig) -> Self {
        let store = FlowStore::new(Duration::from_secs(config.flow_ttl_secs));
        Self {
            store,
            service,
            config,
        }
    }

    /// Starts a refinement dialogue. Returns the flow either waiting on a
    /// clarification answer or already proposing a prompt for confirmation.
    pub fn start_flow(
        &self,
        organization_id: &str,
        user_id: &str,
        instruction: &str,
        donor_ids: Vec<String>,
        preview_donor_ids: Vec<String>,
    ) -> Result<FlowState> {
        if instruction.trim().is_empty() {
            return Err(EngineError::Validation(
                "instruction must not be blank".to_string(),
            ));
        }
        if donor_ids.is_empty() {
            return Err(EngineError::Validation(
                "donor set must not be empty".to_string(),
            ));
        }

        let mut state = FlowState {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            user_id: user_id.to_string(),
            instruction: instruction.to_string(),
            donor_ids,
            preview_donor_ids,
            turns: vec![],
            step: FlowStep::Question,
            clarifications: vec![],
            proposed_prompt: None,
            confirmed_prompt: None,
            session_id: None,
            version: 0,
        };
        state.push_turn(TurnRole::User, instruction);
        self.advance_dialogue(&mut state);

        log::info!(
            "Started flow {} for org {} at step {:?}",
            state.id,
            organization_id,
            state.step
        );
        self.store.insert(state.clone());
        Ok(state)
    }

    /// Applies one user message to a flow: a clarification answer, a
    /// confirmation, or a revision of the proposed prompt.
    pub fn continue_flow(
        &self,
        organization_id: &str,
        flow_id: &str,
        message: &str,
    ) -> Result<FlowState> {
        self.store.sweep_expired();
        self.authorize(organization_id, flow_id)?;
        let mut state = self.store.begin_turn(flow_id)?;

        let result = self.apply_turn(&mut state, message);
        match result {
            Ok(()) => {
                self.store.commit_turn(state.clone());
                // commit bumped the stored version; mirror it in the copy
                // handed back to the caller.
                state.version += 1;
                Ok(state)
            }
            Err(e) => {
                self.store.abort_turn(flow_id);
                Err(e)
            }
        }
    }

    fn apply_turn(&self, state: &mut FlowState, message: &str) -> Result<()> {
        if state.is_complete() || state.step == FlowStep::Generating {
            return Err(EngineError::InvalidState(format!(
                "flow {} no longer accepts turns",
                state.id
            )));
        }
        if message.trim().is_empty() {
            return Err(EngineError::Validation(
                "message must not be blank".to_string(),
            ));
        }
        state.push_turn(TurnRole::User, message);

        match state.step {
            FlowStep::Question => {
                state.clarifications.push(message.trim().to_string());
                self.advance_dialogue(state);
            }
            FlowStep::Confirmation => {
                if is_affirmative(message) {
                    state.confirmed_prompt = state.proposed_prompt.clone();
                    state.push_turn(
                        TurnRole::Assistant,
                        "Confirmed. Generation can now start for the selected donors.",
                    );
                } else {
                    // Treat anything else as a revision instruction.
                    state.clarifications.push(message.trim().to_string());
                    self.propose_prompt(state);
                }
            }
            FlowStep::Generating | FlowStep::Complete => unreachable!(),
        }
        Ok(())
    }

    /// Ask the next clarification if budget remains, otherwise propose.
    fn advance_dialogue(&self, state: &mut FlowState) {
        let clarification_refs: Vec<&str> = state.clarifications.iter().map(String::as_str).collect();
        let mut texts = vec![state.instruction.as_str()];
        texts.extend(clarification_refs);

        let missing = missing_aspects(&texts);
        let asked = state.clarifications.len() as u32;
        if let Some(aspect) = missing.first() {
            if asked < self.config.max_clarification_questions {
                state.step = FlowStep::Question;
                state.push_turn(TurnRole::Assistant, aspect.question());
                return;
            }
        }
        self.propose_prompt(state);
    }

    fn propose_prompt(&self, state: &mut FlowState) {
        let mut prompt = format!(
            "Write a personalized email to the donor. Campaign goal: {}",
            state.instruction.trim()
        );
        for detail in &state.clarifications {
            prompt.push_str("\nAdditional guidance: ");
            prompt.push_str(detail);
        }
        prompt.push_str(
            "\nUse the donor's name, giving history and notes; keep it specific to them.",
        );

        state.proposed_prompt = Some(prompt.clone());
        state.step = FlowStep::Confirmation;
        state.push_turn(
            TurnRole::Assistant,
            &format!(
                "Here is the prompt I will use:\n\n{}\n\nReply 'yes' to confirm, or tell me what to change.",
                prompt
            ),
        );
    }

    /// The confirmed prompt, available once the user has accepted it.
    pub fn generate_final_prompt(&self, organization_id: &str, flow_id: &str) -> Result<String> {
        self.authorize(organization_id, flow_id)?;
        let state = self.store.get(flow_id)?;
        state.confirmed_prompt.ok_or_else(|| {
            EngineError::InvalidState(format!("flow {} has no confirmed prompt yet", flow_id))
        })
    }

    /// Creates the campaign session from a confirmed flow and runs
    /// generation. The flow transitions Generating → Complete around the
    /// dispatch; concurrent turns are rejected throughout.
    pub async fn execute_generation(
        &self,
        organization_id: &str,
        flow_id: &str,
    ) -> Result<CampaignSession> {
        self.authorize(organization_id, flow_id)?;
        let mut state = self.store.begin_turn(flow_id)?;
        if !state.can_proceed() {
            self.store.abort_turn(flow_id);
            return Err(EngineError::InvalidState(format!(
                "flow {} is not confirmed",
                flow_id
            )));
        }
        let prompt = match state.confirmed_prompt.clone() {
            Some(p) => p,
            None => {
                self.store.abort_turn(flow_id);
                return Err(EngineError::InvalidState(format!(
                    "flow {} has no confirmed prompt",
                    flow_id
                )));
            }
        };

        let created = self.service.create_session(NewCampaign {
            organization_id: state.organization_id.clone(),
            user_id: state.user_id.clone(),
            instruction: prompt,
            donor_ids: state.donor_ids.clone(),
            preview_donor_ids: state.preview_donor_ids.clone(),
            launch: true,
        });
        let session = match created {
            Ok(s) => s,
            Err(e) => {
                self.store.abort_turn(flow_id);
                return Err(e);
            }
        };

        state.step = FlowStep::Generating;
        state.session_id = Some(session.id.clone());
        self.store.commit_turn(state.clone());

        let organization_id = state.organization_id.clone();
        let outcome = self
            .service
            .generate_emails(&organization_id, &session.id)
            .await;

        // Mark the flow terminal either way; the session carries the
        // failure state from here on.
        if let Ok(mut done) = self.store.begin_turn(flow_id) {
            done.step = FlowStep::Complete;
            done.push_turn(
                TurnRole::Assistant,
                &format!("Generation dispatched at {}.", Utc::now().to_rfc3339()),
            );
            self.store.commit_turn(done);
        }

        outcome
    }

    /// Read-only view of a flow for status endpoints.
    pub fn get_flow(&self, organization_id: &str, flow_id: &str) -> Result<FlowState> {
        self.authorize(organization_id, flow_id)?;
        self.store.get(flow_id)
    }

    /// Discards an abandoned flow explicitly.
    pub fn cancel_flow(&self, organization_id: &str, flow_id: &str) -> Result<()> {
        self.authorize(organization_id, flow_id)?;
        self.store.remove(flow_id);
        Ok(())
    }

    /// A flow belongs to the organization that started it; everyone else
    /// is forbidden, not told the flow is missing.
    fn authorize(&self, organization_id: &str, flow_id: &str) -> Result<()> {
        let state = self.store.get(flow_id)?;
        if state.organization_id != organization_id {
            return Err(EngineError::Forbidden {
                entity: "flow",
                id: flow_id.to_string(),
            });
        }
        Ok(())
    }
}
