//! Shared test harness: an in-memory engine wired to stub collaborators.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use donorcamp::config::EngineConfig;
use donorcamp::db::Database;
use donorcamp::donor::{Donor, DonorDirectory};
use donorcamp::error::{DispatchError, GenerationError, Result};
use donorcamp::events::ChangeBroadcaster;
use donorcamp::flow::ConversationEngine;
use donorcamp::generation::{
    ContentFragment, GeneratedContent, GenerationCoordinator, GenerationProvider,
};
use donorcamp::review::ReviewGate;
use donorcamp::schedule::{ScheduleConfigStore, SendScheduler};
use donorcamp::send::{DispatchReceipt, MailTransport, OutgoingEmail, SendJobExecutor};
use donorcamp::session::CampaignService;

/// Generation stub. Fails for donors in `fail_donors`; the set can be
/// cleared mid-test to simulate a transient outage recovering.
pub struct StubProvider {
    fail_donors: Mutex<HashSet<String>>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self {
            fail_donors: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_for(&self, donor_id: &str) {
        self.fail_donors.lock().unwrap().insert(donor_id.to_string());
    }

    pub fn recover(&self, donor_id: &str) {
        self.fail_donors.lock().unwrap().remove(donor_id);
    }
}

#[async_trait]
impl GenerationProvider for StubProvider {
    async fn generate(
        &self,
        prompt: &str,
        donor: &Donor,
    ) -> std::result::Result<GeneratedContent, GenerationError> {
        if self.fail_donors.lock().unwrap().contains(&donor.id) {
            return Err(GenerationError::Provider("model overloaded".to_string()));
        }
        Ok(GeneratedContent {
            subject: format!("Thank you, {}", donor.first_name),
            fragments: vec![
                ContentFragment {
                    piece: format!("Dear {},", donor.display_name()),
                    references: vec![],
                    add_context: None,
                },
                ContentFragment {
                    piece: prompt.chars().take(60).collect(),
                    references: vec![],
                    add_context: None,
                },
            ],
            reference_contexts: vec![],
        })
    }

    async fn refine(
        &self,
        current: &GeneratedContent,
        instruction: &str,
        _donor: &Donor,
    ) -> std::result::Result<GeneratedContent, GenerationError> {
        let mut refined = current.clone();
        refined.fragments.push(ContentFragment {
            piece: instruction.to_string(),
            references: vec![],
            add_context: None,
        });
        Ok(refined)
    }
}

/// Directory stub: resolves every id to a donor in the caller's org,
/// except ids registered as missing.
pub struct StubDirectory {
    missing: Mutex<HashSet<String>>,
}

impl StubDirectory {
    pub fn new() -> Self {
        Self {
            missing: Mutex::new(HashSet::new()),
        }
    }

    pub fn remove_donor(&self, donor_id: &str) {
        self.missing.lock().unwrap().insert(donor_id.to_string());
    }
}

#[async_trait]
impl DonorDirectory for StubDirectory {
    async fn donors_by_ids(&self, organization_id: &str, ids: &[String]) -> Result<Vec<Donor>> {
        let missing = self.missing.lock().unwrap();
        Ok(ids
            .iter()
            .filter(|id| !missing.contains(*id))
            .map(|id| Donor {
                id: id.clone(),
                organization_id: organization_id.to_string(),
                first_name: "Jane".to_string(),
                last_name: format!("Donor-{}", id),
                email: format!("{}@example.org", id),
                notes: Some("prefers email".to_string()),
                total_donated_cents: 250_00,
                last_donation_at: None,
            })
            .collect())
    }
}

/// Transport stub that records dispatched emails and can fail per address.
pub struct RecordingTransport {
    pub sent: Mutex<Vec<OutgoingEmail>>,
    fail_to: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(vec![]),
            fail_to: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_for(&self, address: &str) {
        self.fail_to.lock().unwrap().insert(address.to_string());
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|e| e.to.clone()).collect()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(
        &self,
        email: &OutgoingEmail,
    ) -> std::result::Result<DispatchReceipt, DispatchError> {
        if self.fail_to.lock().unwrap().contains(&email.to) {
            return Err(DispatchError::Transport("mailbox unavailable".to_string()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(email.clone());
        Ok(DispatchReceipt {
            message_id: format!("msg-{}", sent.len()),
        })
    }
}

/// A fully wired engine over an in-memory database.
pub struct Harness {
    pub db: Database,
    pub events: ChangeBroadcaster,
    pub provider: Arc<StubProvider>,
    pub directory: Arc<StubDirectory>,
    pub transport: Arc<RecordingTransport>,
    pub service: Arc<CampaignService>,
    pub conversation: ConversationEngine,
    pub gate: ReviewGate,
    pub configs: ScheduleConfigStore,
    pub scheduler: SendScheduler,
    pub executor: Arc<SendJobExecutor>,
}

impl Harness {
    pub fn new() -> Self {
        let db = Database::open_in_memory().expect("Failed to create test database");
        let events = ChangeBroadcaster::default();
        let config = EngineConfig::default();

        let provider = Arc::new(StubProvider::new());
        let directory = Arc::new(StubDirectory::new());
        let transport = Arc::new(RecordingTransport::new());

        let coordinator = Arc::new(GenerationCoordinator::new(
            db.clone(),
            provider.clone() as Arc<dyn GenerationProvider>,
            directory.clone() as Arc<dyn DonorDirectory>,
            config.clone(),
        ));
        let service = Arc::new(CampaignService::new(
            db.clone(),
            coordinator,
            events.clone(),
        ));
        let conversation = ConversationEngine::new(service.clone(), config.clone());
        let gate = ReviewGate::new(
            db.clone(),
            provider.clone() as Arc<dyn GenerationProvider>,
            directory.clone() as Arc<dyn DonorDirectory>,
            events.clone(),
            config.clone(),
        );
        let configs = ScheduleConfigStore::new(db.clone(), events.clone());
        let scheduler = SendScheduler::new(
            db.clone(),
            ScheduleConfigStore::new(db.clone(), events.clone()),
            events.clone(),
        );
        let executor = Arc::new(SendJobExecutor::new(
            db.clone(),
            transport.clone() as Arc<dyn MailTransport>,
            directory.clone() as Arc<dyn DonorDirectory>,
            ScheduleConfigStore::new(db.clone(), events.clone()),
            service.clone(),
            events.clone(),
            config,
        ));

        Self {
            db,
            events,
            provider,
            directory,
            transport,
            service,
            conversation,
            gate,
            configs,
            scheduler,
            executor,
        }
    }

    pub fn donor_ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("d{}", i)).collect()
    }
}
