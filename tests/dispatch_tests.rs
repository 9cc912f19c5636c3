mod test_harness;

use chrono::{Duration as ChronoDuration, Utc};

use centrum::error::ErrorKind;
use centrum::model::dispatch::{
    Dispatch, DispatchAttribute, DispatchReference, DispatchStatusInput, DispatchStatusKind,
    ReferenceType,
};
use centrum::model::settings::{CentrumMode, CentrumSettings};
use centrum::model::unit::UnitStatusKind;
use centrum::ports::DispatchRepository;
use centrum::store::TakeResponse;
use test_harness::{police_dispatch, staffed_unit, TestEnv, JOB};

fn pending_expiry() -> Option<chrono::DateTime<Utc>> {
    Some(Utc::now() + ChronoDuration::seconds(20))
}

#[tokio::test]
async fn test_create_requires_a_job() {
    let env = TestEnv::new();
    let node = env.node();

    let err = node
        .dispatches
        .create(Dispatch::new(vec![String::new()], "Nobody sees this", 0.0, 0.0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoJobsSpecified);
}

#[tokio::test]
async fn test_create_sets_new_status_and_indexes_job() {
    let env = TestEnv::new();
    let node = env.node();

    let dsp = police_dispatch(&node, 10.0, 20.0).await;
    assert!(dsp.id > 0);
    assert_eq!(dsp.current_status(), DispatchStatusKind::New);

    let listed = node.dispatches.list(&[JOB.to_string()]).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, dsp.id);
    assert!(node.dispatches.list(&["ambulance".to_string()]).await.is_empty());

    assert_eq!(env.publisher.count("centrum.police.dispatch.created").await, 1);
    assert_eq!(node.dispatches.geo().get(JOB).await.unwrap().len().await, 1);
}

#[tokio::test]
async fn test_legacy_job_field_is_normalized_on_create() {
    let env = TestEnv::new();
    let node = env.node();

    let mut dsp = Dispatch::new(vec!["ambulance".to_string()], "Crash", 0.0, 0.0);
    dsp.job = Some("police".to_string());
    let created = node.dispatches.create(dsp).await.unwrap();

    assert_eq!(created.jobs, vec!["police", "ambulance"]);
    assert!(created.job.is_none());
    assert_eq!(node.dispatches.list(&["ambulance".to_string()]).await.len(), 1);
    assert_eq!(env.publisher.count("centrum.ambulance.dispatch.created").await, 1);
}

#[tokio::test]
async fn test_attribute_add_is_idempotent() {
    let env = TestEnv::new();
    let node = env.node();
    let dsp = police_dispatch(&node, 0.0, 0.0).await;

    assert!(node
        .dispatches
        .add_attribute(dsp.id, DispatchAttribute::Multiple)
        .await
        .unwrap());
    let writes = env.repo.write_count();

    assert!(!node
        .dispatches
        .add_attribute(dsp.id, DispatchAttribute::Multiple)
        .await
        .unwrap());
    assert_eq!(env.repo.write_count(), writes, "second add must not write");

    let dsp = node.dispatches.get(dsp.id).await.unwrap();
    assert_eq!(dsp.attributes.len(), 1);
    assert!(dsp.attributes.contains(&DispatchAttribute::Multiple));
}

#[tokio::test]
async fn test_references_only_added_once() {
    let env = TestEnv::new();
    let node = env.node();
    let dsp = police_dispatch(&node, 0.0, 0.0).await;
    let reference = DispatchReference::new(99, ReferenceType::Referenced);

    assert!(node.dispatches.add_references(dsp.id, &[reference]).await.unwrap());
    assert!(!node.dispatches.add_references(dsp.id, &[reference]).await.unwrap());
    assert_eq!(node.dispatches.get(dsp.id).await.unwrap().references, vec![reference]);
}

#[tokio::test]
async fn test_repeated_unassigned_is_suppressed() {
    let env = TestEnv::new();
    let node = env.node();
    let dsp = police_dispatch(&node, 0.0, 0.0).await;

    let first = node
        .dispatches
        .update_status(dsp.id, DispatchStatusInput::new(DispatchStatusKind::Unassigned))
        .await
        .unwrap();
    assert!(first.is_some());

    let second = node
        .dispatches
        .update_status(dsp.id, DispatchStatusInput::new(DispatchStatusKind::Unassigned))
        .await
        .unwrap();
    assert!(second.is_none());
    assert_eq!(env.repo.dispatch_status_history(dsp.id).await.len(), 2);
}

#[tokio::test]
async fn test_empty_unit_is_never_assigned() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[]).await;
    let dsp = police_dispatch(&node, 0.0, 0.0).await;

    let updated = node
        .dispatches
        .update_assignments(dsp.id, &[unit.id], &[], pending_expiry(), None)
        .await
        .unwrap();

    assert!(updated.units.is_empty());
    assert_eq!(updated.current_status(), DispatchStatusKind::Unassigned);
}

#[tokio::test]
async fn test_assignment_records_status_and_snapshot() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let dsp = police_dispatch(&node, 0.0, 0.0).await;

    let updated = node
        .dispatches
        .update_assignments(dsp.id, &[unit.id], &[], pending_expiry(), Some(7))
        .await
        .unwrap();

    assert_eq!(updated.current_status(), DispatchStatusKind::UnitAssigned);
    let assignment = updated.assignment(unit.id).unwrap();
    assert!(assignment.is_pending());
    assert_eq!(assignment.unit.as_ref().unwrap().name, "Adam 1");

    // Adding the same unit again is a no-op
    let again = node
        .dispatches
        .update_assignments(dsp.id, &[unit.id], &[], None, None)
        .await
        .unwrap();
    assert_eq!(again.units.len(), 1);
    assert!(again.assignment(unit.id).unwrap().is_pending());
}

#[tokio::test]
async fn test_removing_last_unit_reverts_to_unassigned() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let dsp = police_dispatch(&node, 0.0, 0.0).await;

    node.dispatches
        .update_assignments(dsp.id, &[unit.id], &[], None, None)
        .await
        .unwrap();
    node.dispatches
        .update_status(dsp.id, DispatchStatusInput::new(DispatchStatusKind::EnRoute))
        .await
        .unwrap();

    let updated = node
        .dispatches
        .update_assignments(dsp.id, &[], &[unit.id], None, None)
        .await
        .unwrap();
    assert!(updated.units.is_empty());
    assert_eq!(updated.current_status(), DispatchStatusKind::Unassigned);
    assert!(env.repo.list_assignments(dsp.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_terminal_dispatch_is_sticky() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let dsp = police_dispatch(&node, 0.0, 0.0).await;

    node.dispatches
        .update_status(dsp.id, DispatchStatusInput::new(DispatchStatusKind::Completed))
        .await
        .unwrap();

    for status in [
        DispatchStatusKind::Unassigned,
        DispatchStatusKind::UnitUnassigned,
        DispatchStatusKind::UnitAccepted,
        DispatchStatusKind::UnitDeclined,
    ] {
        let result = node
            .dispatches
            .update_status(dsp.id, DispatchStatusInput::new(status))
            .await
            .unwrap();
        assert!(result.is_none(), "{status} must be dropped on a terminal dispatch");
    }

    let updated = node
        .dispatches
        .update_assignments(dsp.id, &[unit.id], &[], None, None)
        .await
        .unwrap();
    assert!(updated.units.is_empty());
    assert_eq!(updated.current_status(), DispatchStatusKind::Completed);
}

#[tokio::test]
async fn test_decline_returns_unit_to_pool() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    assert_eq!(unit.current_status(), UnitStatusKind::Available);
    let dsp = police_dispatch(&node, 0.0, 0.0).await;

    node.dispatches
        .update_assignments(dsp.id, &[unit.id], &[], pending_expiry(), None)
        .await
        .unwrap();

    let outcome = node
        .dispatches
        .take_dispatch(JOB, unit.id, &[dsp.id], TakeResponse::Decline, Some(7))
        .await
        .unwrap();
    assert!(outcome.failures.is_empty());

    let dsp = node.dispatches.get(dsp.id).await.unwrap();
    assert!(dsp.units.is_empty());
    assert_eq!(dsp.current_status(), DispatchStatusKind::Unassigned);
    assert!(env.repo.list_assignments(dsp.id).await.unwrap().is_empty());

    let history = env.repo.dispatch_status_history(dsp.id).await;
    assert!(history.iter().any(|s| s.status == DispatchStatusKind::UnitDeclined));

    let unit = node.units.get(unit.id).await.unwrap();
    assert_eq!(unit.current_status(), UnitStatusKind::Available);
}

#[tokio::test]
async fn test_accept_clears_expiry_and_sets_busy_once() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let dsp = police_dispatch(&node, 0.0, 0.0).await;

    node.dispatches
        .update_assignments(dsp.id, &[unit.id], &[], pending_expiry(), None)
        .await
        .unwrap();

    for _ in 0..2 {
        let outcome = node
            .dispatches
            .take_dispatch(JOB, unit.id, &[dsp.id], TakeResponse::Accept, Some(7))
            .await
            .unwrap();
        assert_eq!(outcome.dispatches.len(), 1);
    }

    let dsp = node.dispatches.get(dsp.id).await.unwrap();
    assert!(!dsp.assignment(unit.id).unwrap().is_pending());
    let rows = env.repo.list_assignments(dsp.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].expires_at.is_none());

    let busy = env
        .repo
        .unit_status_history(unit.id)
        .await
        .into_iter()
        .filter(|s| s.status == UnitStatusKind::Busy)
        .count();
    assert_eq!(busy, 1);

    let accepted = env
        .repo
        .dispatch_status_history(dsp.id)
        .await
        .into_iter()
        .filter(|s| s.status == DispatchStatusKind::UnitAccepted)
        .count();
    assert_eq!(accepted, 2);
    assert_eq!(node.units.get(unit.id).await.unwrap().current_status(), UnitStatusKind::Busy);
}

#[tokio::test]
async fn test_accept_without_offer_adds_unit() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let dsp = police_dispatch(&node, 0.0, 0.0).await;

    node.dispatches
        .take_dispatch(JOB, unit.id, &[dsp.id], TakeResponse::Accept, Some(7))
        .await
        .unwrap();

    let dsp = node.dispatches.get(dsp.id).await.unwrap();
    assert!(dsp.has_unit(unit.id));
    assert!(!dsp.assignment(unit.id).unwrap().is_pending());
    assert_eq!(dsp.current_status(), DispatchStatusKind::UnitAccepted);
}

#[tokio::test]
async fn test_take_batch_isolates_completed_dispatches() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let open = police_dispatch(&node, 0.0, 0.0).await;
    let done = police_dispatch(&node, 500.0, 500.0).await;
    node.dispatches
        .update_status(done.id, DispatchStatusInput::new(DispatchStatusKind::Completed))
        .await
        .unwrap();

    let outcome = node
        .dispatches
        .take_dispatch(JOB, unit.id, &[done.id, open.id, 4242], TakeResponse::Accept, Some(7))
        .await
        .unwrap();

    assert_eq!(outcome.dispatches.len(), 1);
    assert_eq!(outcome.dispatches[0].id, open.id);
    let kinds: Vec<(u64, ErrorKind)> = outcome
        .failures
        .iter()
        .map(|(id, e)| (*id, e.kind()))
        .collect();
    assert_eq!(
        kinds,
        vec![(done.id, ErrorKind::AlreadyCompleted), (4242, ErrorKind::NotFound)]
    );
}

#[tokio::test]
async fn test_central_command_forbids_take() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let dsp = police_dispatch(&node, 0.0, 0.0).await;
    node.settings
        .update(
            CentrumSettings::new(JOB).with_mode(CentrumMode::CentralCommand, CentrumMode::Manual),
        )
        .await
        .unwrap();

    let err = node
        .dispatches
        .take_dispatch(JOB, unit.id, &[dsp.id], TakeResponse::Accept, Some(7))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModeForbidsAction);
}

#[tokio::test]
async fn test_storage_failure_aborts_and_keeps_live_state() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let dsp = police_dispatch(&node, 0.0, 0.0).await;

    env.repo.set_failing(true);
    let err = node
        .dispatches
        .update_assignments(dsp.id, &[unit.id], &[], pending_expiry(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackingStoreFailure);
    assert!(err.to_string().contains("dispatch="));

    let take_err = node
        .dispatches
        .take_dispatch(JOB, unit.id, &[dsp.id], TakeResponse::Accept, None)
        .await
        .unwrap_err();
    assert_eq!(take_err.kind(), ErrorKind::BackingStoreFailure);
    env.repo.set_failing(false);

    let dsp = node.dispatches.get(dsp.id).await.unwrap();
    assert!(dsp.units.is_empty());
    assert_eq!(dsp.current_status(), DispatchStatusKind::New);
}

#[tokio::test]
async fn test_update_changes_location_and_moves_geo_point() {
    let env = TestEnv::new();
    let node = env.node();
    let mut dsp = police_dispatch(&node, 0.0, 0.0).await;

    dsp.message = "Shots fired, suspect fled".to_string();
    dsp.x = 300.0;
    dsp.y = -150.0;
    let updated = node.dispatches.update(dsp).await.unwrap();
    assert_eq!(updated.message, "Shots fired, suspect fled");

    let index = node.dispatches.geo().get(JOB).await.unwrap();
    let near_new = index.k_nearest(300.0, -150.0, 1, 1.0, |_| true).await;
    assert_eq!(near_new.len(), 1);
    assert!(index.k_nearest(0.0, 0.0, 1, 1.0, |_| true).await.is_empty());
}

#[tokio::test]
async fn test_delete_and_purge() {
    let env = TestEnv::new();
    let node = env.node();
    let deleted = police_dispatch(&node, 0.0, 0.0).await;
    let purged = police_dispatch(&node, 100.0, 0.0).await;

    node.dispatches.delete(deleted.id).await.unwrap();
    node.dispatches.purge(purged.id).await.unwrap();

    assert!(node.dispatches.list(&[JOB.to_string()]).await.is_empty());
    assert_eq!(node.dispatches.geo().get(JOB).await.unwrap().len().await, 0);
    assert_eq!(env.publisher.count("centrum.police.dispatch.deleted").await, 2);

    // Purged dispatches stay durable and load back on demand
    let reloaded = node.dispatches.get(purged.id).await.unwrap();
    assert_eq!(reloaded.current_status(), DispatchStatusKind::New);
    assert_eq!(
        node.dispatches.get(deleted.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_load_from_repository_skips_terminal_dispatches() {
    let env = TestEnv::new();
    let writer = env.node();
    let unit = staffed_unit(&env, &writer, JOB, "Adam 1", &[7]).await;
    let open = police_dispatch(&writer, 0.0, 0.0).await;
    let done = police_dispatch(&writer, 200.0, 0.0).await;
    writer
        .dispatches
        .update_assignments(open.id, &[unit.id], &[], None, None)
        .await
        .unwrap();
    writer
        .dispatches
        .update_status(done.id, DispatchStatusInput::new(DispatchStatusKind::Completed))
        .await
        .unwrap();

    // Fresh backend, same durable storage
    let fresh = TestEnv::with_repo(env.repo.clone());
    let reader = fresh.node();
    reader.units.load_from_repository().await.unwrap();
    let loaded = reader
        .dispatches
        .load_from_repository(Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();

    assert_eq!(loaded, 1);
    let restored = reader.dispatches.get(open.id).await.unwrap();
    assert!(restored.has_unit(unit.id));
    assert_eq!(restored.current_status(), DispatchStatusKind::UnitAssigned);
    assert_eq!(reader.dispatches.list(&[JOB.to_string()]).await.len(), 1);
}
