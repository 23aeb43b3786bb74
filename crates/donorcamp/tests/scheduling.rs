//! Scheduling and dispatch tests: daily-cap slot packing, pause/resume,
//! cancellation, and executor claim safety.

mod common;

use std::collections::HashSet;

use chrono::{DateTime, Days, TimeZone, Utc};
use common::Harness;

use donorcamp::error::EngineError;
use donorcamp::schedule::{ScheduleConfigPatch, SendType};
use donorcamp::session::NewCampaign;

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
}

/// Creates a launched campaign, generates and approves everything, and
/// returns the session id.
async fn ready_session(h: &Harness, donors: usize) -> String {
    let session = h
        .service
        .create_session(NewCampaign {
            organization_id: "org-1".to_string(),
            user_id: "u1".to_string(),
            instruction: "Warm year-end thank-you, ask them to give again".to_string(),
            donor_ids: Harness::donor_ids(donors),
            preview_donor_ids: vec![],
            launch: true,
        })
        .unwrap();
    h.service.generate_emails("org-1", &session.id).await.unwrap();
    h.gate.approve_all_pending("org-1", &session.id).unwrap();
    session.id
}

#[tokio::test]
async fn test_sixty_emails_pack_fifty_today_ten_tomorrow() {
    let h = Harness::new();
    h.configs
        .update(
            "org-1",
            &ScheduleConfigPatch {
                daily_cap: Some(50),
                ..Default::default()
            },
        )
        .unwrap();
    let session_id = ready_session(&h, 60).await;

    let now = at(2, 0);
    let outcome = h
        .scheduler
        .schedule_session_at("org-1", &session_id, SendType::All, now)
        .unwrap();
    assert_eq!(outcome.scheduled, 60);

    let jobs = h.scheduler.list_jobs("org-1", &session_id, None).unwrap();
    let today = now.date_naive();
    let day_one = jobs
        .iter()
        .filter(|j| j.scheduled_time.starts_with(&today.to_string()))
        .count();
    let day_two = jobs
        .iter()
        .filter(|j| {
            j.scheduled_time
                .starts_with(&(today + Days::new(1)).to_string())
        })
        .count();
    assert_eq!(day_one, 50);
    assert_eq!(day_two, 10);
    assert_eq!(outcome.first_slot.unwrap(), at(2, 9));
}

#[tokio::test]
async fn test_capacity_exceeded_inserts_nothing() {
    let h = Harness::new();
    h.configs
        .update(
            "org-1",
            &ScheduleConfigPatch {
                daily_cap: Some(10),
                horizon_days: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
    let session_id = ready_session(&h, 11).await;

    let err = h
        .scheduler
        .schedule_session_at("org-1", &session_id, SendType::All, at(2, 0))
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { .. }));

    let jobs = h.scheduler.list_jobs("org-1", &session_id, None).unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn test_pause_resume_preserves_job_set() {
    let h = Harness::new();
    let session_id = ready_session(&h, 5).await;
    let now = at(2, 0);
    h.scheduler
        .schedule_session_at("org-1", &session_id, SendType::All, now)
        .unwrap();

    let before: HashSet<(String, String)> = h
        .scheduler
        .list_jobs("org-1", &session_id, Some("scheduled"))
        .unwrap()
        .into_iter()
        .map(|j| (j.id, j.scheduled_time))
        .collect();
    assert_eq!(before.len(), 5);

    assert_eq!(h.scheduler.pause("org-1", &session_id).unwrap(), 5);
    assert!(h
        .scheduler
        .list_jobs("org-1", &session_id, Some("scheduled"))
        .unwrap()
        .is_empty());

    // Resuming before any slot has passed restores the exact same set.
    assert_eq!(h.scheduler.resume_at("org-1", &session_id, now).unwrap(), 5);
    let after: HashSet<(String, String)> = h
        .scheduler
        .list_jobs("org-1", &session_id, Some("scheduled"))
        .unwrap()
        .into_iter()
        .map(|j| (j.id, j.scheduled_time))
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_resume_repacks_slots_that_passed_while_paused() {
    let h = Harness::new();
    let session_id = ready_session(&h, 3).await;
    h.scheduler
        .schedule_session_at("org-1", &session_id, SendType::All, at(2, 0))
        .unwrap();
    h.scheduler.pause("org-1", &session_id).unwrap();

    // Resume a day later: every original slot is in the past.
    let later = at(3, 12);
    h.scheduler.resume_at("org-1", &session_id, later).unwrap();

    let jobs = h
        .scheduler
        .list_jobs("org-1", &session_id, Some("scheduled"))
        .unwrap();
    assert_eq!(jobs.len(), 3);
    for job in &jobs {
        let slot: DateTime<Utc> = job.scheduled_time.parse().unwrap();
        assert!(slot > later);
    }
}

#[tokio::test]
async fn test_cancel_spares_already_sent_jobs() {
    let h = Harness::new();
    h.configs
        .update(
            "org-1",
            &ScheduleConfigPatch {
                // One slot per tick-day keeps the first dispatch isolated.
                daily_cap: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
    let session_id = ready_session(&h, 3).await;
    h.scheduler
        .schedule_session_at("org-1", &session_id, SendType::All, at(2, 0))
        .unwrap();

    // Dispatch the first job, then cancel the rest.
    let summary = h.executor.tick_at(at(2, 23)).await.unwrap();
    assert_eq!(summary.sent, 1);
    assert_eq!(h.scheduler.cancel("org-1", &session_id).unwrap(), 2);

    let jobs = h.scheduler.list_jobs("org-1", &session_id, None).unwrap();
    assert_eq!(jobs.iter().filter(|j| j.status == "sent").count(), 1);
    assert_eq!(jobs.iter().filter(|j| j.status == "cancelled").count(), 2);
    assert_eq!(h.transport.sent_count(), 1);
}

#[tokio::test]
async fn test_unsent_mode_keeps_existing_jobs() {
    let h = Harness::new();
    let session_id = ready_session(&h, 4).await;
    let now = at(2, 0);
    h.scheduler
        .schedule_session_at("org-1", &session_id, SendType::All, now)
        .unwrap();
    let first_ids: HashSet<String> = h
        .scheduler
        .list_jobs("org-1", &session_id, Some("scheduled"))
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();

    // Every approved email already has a job, so Unsent has nothing to add.
    let err = h
        .scheduler
        .schedule_session_at("org-1", &session_id, SendType::Unsent, now)
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // All replaces: old jobs cancelled, fresh ones issued.
    h.scheduler
        .schedule_session_at("org-1", &session_id, SendType::All, now)
        .unwrap();
    let second_ids: HashSet<String> = h
        .scheduler
        .list_jobs("org-1", &session_id, Some("scheduled"))
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(second_ids.len(), 4);
    assert!(first_ids.is_disjoint(&second_ids));
}

#[tokio::test]
async fn test_concurrent_ticks_never_double_send() {
    let h = Harness::new();
    let session_id = ready_session(&h, 5).await;
    h.scheduler
        .schedule_session_at("org-1", &session_id, SendType::All, at(2, 0))
        .unwrap();

    let when = at(2, 23);
    let (a, b) = tokio::join!(h.executor.tick_at(when), h.executor.tick_at(when));
    let total = a.unwrap().sent + b.unwrap().sent;
    assert_eq!(total, 5);
    assert_eq!(h.transport.sent_count(), 5);

    // No recipient appears twice.
    let recipients = h.transport.recipients();
    let unique: HashSet<_> = recipients.iter().collect();
    assert_eq!(unique.len(), recipients.len());
}

#[tokio::test]
async fn test_full_pipeline_completes_session() {
    let h = Harness::new();
    let session_id = ready_session(&h, 3).await;
    h.scheduler
        .schedule_session_at("org-1", &session_id, SendType::All, at(2, 0))
        .unwrap();

    let summary = h.executor.tick_at(at(2, 23)).await.unwrap();
    assert_eq!(summary.sent, 3);

    let report = h.service.get_session_status("org-1", &session_id).unwrap();
    assert_eq!(
        report.session.status,
        donorcamp::session::CampaignStatus::Completed
    );
    assert_eq!(report.emails.sent, 3);
    assert_eq!(report.jobs.sent, 3);
    assert!(report.session.completed_at.is_some());
}

#[tokio::test]
async fn test_transport_failure_retries_then_marks_job_failed() {
    let h = Harness::new();
    let session_id = ready_session(&h, 2).await;
    h.transport.fail_for("d1@example.org");
    h.scheduler
        .schedule_session_at("org-1", &session_id, SendType::All, at(2, 0))
        .unwrap();

    // Failures after the window closes retry the next morning, so one
    // tick per day exhausts d1's attempts.
    h.executor.tick_at(at(2, 21)).await.unwrap();
    h.executor.tick_at(at(3, 21)).await.unwrap();
    let summary = h.executor.tick_at(at(4, 21)).await.unwrap();
    assert_eq!(summary.failed, 1);

    let report = h.service.get_session_status("org-1", &session_id).unwrap();
    assert_eq!(report.emails.sent, 1);
    assert_eq!(report.emails.send_failed, 1);
    assert_eq!(report.jobs.failed, 1);
    // One approved email never landed, so the session is not completed.
    assert_eq!(
        report.session.status,
        donorcamp::session::CampaignStatus::ReadyToSend
    );
}
