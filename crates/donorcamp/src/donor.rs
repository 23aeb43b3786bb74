//! Donor context and the read-only directory seam.
//!
//! Donor CRUD lives in the surrounding application; the engine only needs
//! enough context per donor to personalize generation and address delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Read-only donor context used for personalization and delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Donor {
    pub id: String,
    pub organization_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// Free-form staff notes, if any.
    #[serde(default)]
    pub notes: Option<String>,
    /// Lifetime giving in cents.
    #[serde(default)]
    pub total_donated_cents: i64,
    /// Most recent donation, if any.
    #[serde(default)]
    pub last_donation_at: Option<DateTime<Utc>>,
}

impl Donor {
    /// Full display name for salutations.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Lookup seam into the surrounding application's donor storage.
/// Implementations must scope results to the given organization; ids that
/// don't resolve within it are simply absent from the result.
#[async_trait]
pub trait DonorDirectory: Send + Sync {
    async fn donors_by_ids(&self, organization_id: &str, ids: &[String]) -> Result<Vec<Donor>>;
}
