//! Content generation: the external provider seam and the per-donor
//! fan-out coordinator.

pub mod coordinator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::donor::Donor;
use crate::error::GenerationError;

pub use coordinator::{BatchOutcome, DonorFailure, GenerationCoordinator};

/// One ordered fragment of generated email content, with the source
/// references that informed it. The shape is versioned explicitly —
/// readers never branch on string-or-array at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContentFragment {
    /// The text of this fragment.
    pub piece: String,
    /// Ids of source records (donation history, notes) the fragment cites.
    #[serde(default)]
    pub references: Vec<String>,
    /// Extra context the provider attached, if any.
    #[serde(default)]
    pub add_context: Option<String>,
}

/// The provider's output for one donor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedContent {
    pub subject: String,
    pub fragments: Vec<ContentFragment>,
    /// Opaque reference contexts echoed back for the review UI.
    #[serde(default)]
    pub reference_contexts: Vec<String>,
}

impl GeneratedContent {
    /// Renders the fragments into a plain body for delivery.
    pub fn render_body(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.piece.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// External content-generation collaborator (LLM service, out of scope).
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generates a personalized email for one donor from the confirmed
    /// campaign prompt.
    async fn generate(
        &self,
        prompt: &str,
        donor: &Donor,
    ) -> std::result::Result<GeneratedContent, GenerationError>;

    /// Refines existing content with an additional instruction, keeping
    /// the donor context (the review gate's enhance loop).
    async fn refine(
        &self,
        current: &GeneratedContent,
        instruction: &str,
        donor: &Donor,
    ) -> std::result::Result<GeneratedContent, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_body_joins_fragments() {
        let content = GeneratedContent {
            subject: "Thank you".to_string(),
            fragments: vec![
                ContentFragment {
                    piece: "Dear Jane,".to_string(),
                    references: vec![],
                    add_context: None,
                },
                ContentFragment {
                    piece: "Your gift made a difference.".to_string(),
                    references: vec!["donation-77".to_string()],
                    add_context: None,
                },
            ],
            reference_contexts: vec![],
        };
        assert_eq!(
            content.render_body(),
            "Dear Jane,\n\nYour gift made a difference."
        );
    }

    #[test]
    fn test_fragment_json_shape() {
        let json = r#"{"piece":"Hello","references":["r1"],"addContext":"gala"}"#;
        let fragment: ContentFragment = serde_json::from_str(json).unwrap();
        assert_eq!(fragment.piece, "Hello");
        assert_eq!(fragment.add_context.as_deref(), Some("gala"));
    }
}
