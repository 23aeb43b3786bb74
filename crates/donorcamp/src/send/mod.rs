//! Email dispatch: the outbound transport seam and the tick-driven send
//! job executor.

pub mod executor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

pub use executor::{SendJobExecutor, TickSummary};

/// A fully rendered email ready for delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEmail {
    pub to: String,
    pub to_name: String,
    pub subject: String,
    pub body: String,
}

/// Delivery confirmation from the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    /// Provider-assigned message id, recorded on the job.
    pub message_id: String,
}

/// External delivery collaborator (SMTP relay, ESP API, out of scope).
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutgoingEmail)
        -> std::result::Result<DispatchReceipt, DispatchError>;
}
