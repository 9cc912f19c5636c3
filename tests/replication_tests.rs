mod test_harness;

use std::time::Duration;

use centrum::model::dispatch::{DispatchAttribute, DispatchStatusInput, DispatchStatusKind};
use centrum::node::Node;
use test_harness::{assert_eventually, police_dispatch, staffed_unit, TestEnv, JOB};

const WAIT: Duration = Duration::from_secs(3);

async fn wait_for_dispatch(node: &Node, dispatch_id: u64) {
    let dispatches = node.dispatches.clone();
    assert_eventually(
        || {
            let dispatches = dispatches.clone();
            async move {
                dispatches
                    .list(&[JOB.to_string()])
                    .await
                    .iter()
                    .any(|d| d.id == dispatch_id)
            }
        },
        WAIT,
        "dispatch should replicate",
    )
    .await;
}

#[tokio::test]
async fn test_created_dispatch_reaches_other_replica() {
    let env = TestEnv::new();
    let a = env.replica(1);
    let b = env.replica(2);

    let dsp = police_dispatch(&a, 120.0, -40.0).await;
    wait_for_dispatch(&b, dsp.id).await;

    let seen = b.dispatches.get(dsp.id).await.unwrap();
    assert_eq!(seen.message, dsp.message);
    assert_eq!(seen.current_status(), DispatchStatusKind::New);

    let index = b.dispatches.geo().get(JOB).await.unwrap();
    let near = index.k_nearest(120.0, -40.0, 1, 1.0, |_| true).await;
    assert_eq!(near.len(), 1);
    assert_eq!(near[0].id, dsp.id);
}

#[tokio::test]
async fn test_status_written_on_one_replica_is_seen_by_the_other() {
    let env = TestEnv::new();
    let a = env.replica(1);
    let b = env.replica(2);
    let dsp = police_dispatch(&a, 0.0, 0.0).await;
    wait_for_dispatch(&b, dsp.id).await;

    b.dispatches
        .update_status(dsp.id, DispatchStatusInput::new(DispatchStatusKind::EnRoute))
        .await
        .unwrap()
        .unwrap();

    let dispatch_id = dsp.id;
    let dispatches = a.dispatches.clone();
    assert_eventually(
        || {
            let dispatches = dispatches.clone();
            async move {
                dispatches
                    .get(dispatch_id)
                    .await
                    .map(|d| d.current_status() == DispatchStatusKind::EnRoute)
                    .unwrap_or(false)
            }
        },
        WAIT,
        "status should replicate back",
    )
    .await;
}

#[tokio::test]
async fn test_concurrent_attribute_adds_both_survive() {
    let env = TestEnv::new();
    let a = env.replica(1);
    let b = env.replica(2);
    let dsp = police_dispatch(&a, 0.0, 0.0).await;
    wait_for_dispatch(&b, dsp.id).await;

    let (left, right) = tokio::join!(
        a.dispatches.add_attribute(dsp.id, DispatchAttribute::Multiple),
        b.dispatches.add_attribute(dsp.id, DispatchAttribute::TooOld),
    );
    assert!(left.unwrap());
    assert!(right.unwrap());

    for node in [&a, &b] {
        let dispatch_id = dsp.id;
        let dispatches = node.dispatches.clone();
        assert_eventually(
            || {
                let dispatches = dispatches.clone();
                async move {
                    dispatches
                        .get(dispatch_id)
                        .await
                        .map(|d| {
                            d.attributes.contains(&DispatchAttribute::Multiple)
                                && d.attributes.contains(&DispatchAttribute::TooOld)
                        })
                        .unwrap_or(false)
                }
            },
            WAIT,
            "both attributes should be present on every replica",
        )
        .await;
    }
}

#[tokio::test]
async fn test_assignment_made_on_other_replica_uses_replicated_unit() {
    let env = TestEnv::new();
    let a = env.replica(1);
    let b = env.replica(2);
    let unit = staffed_unit(&env, &a, JOB, "Adam 1", &[7]).await;
    let dsp = police_dispatch(&a, 0.0, 0.0).await;
    wait_for_dispatch(&b, dsp.id).await;

    let updated = b
        .dispatches
        .update_assignments(dsp.id, &[unit.id], &[], None, None)
        .await
        .unwrap();
    assert!(updated.has_unit(unit.id));
    assert_eq!(
        updated.assignment(unit.id).unwrap().unit.as_ref().unwrap().name,
        "Adam 1"
    );

    let unit_id = unit.id;
    let dispatch_id = dsp.id;
    let dispatches = a.dispatches.clone();
    assert_eventually(
        || {
            let dispatches = dispatches.clone();
            async move {
                dispatches
                    .get(dispatch_id)
                    .await
                    .map(|d| d.has_unit(unit_id))
                    .unwrap_or(false)
            }
        },
        WAIT,
        "assignment should replicate",
    )
    .await;
}

#[tokio::test]
async fn test_delete_clears_remote_geo_index() {
    let env = TestEnv::new();
    let a = env.replica(1);
    let b = env.replica(2);
    let dsp = police_dispatch(&a, 0.0, 0.0).await;
    wait_for_dispatch(&b, dsp.id).await;

    a.dispatches.delete(dsp.id).await.unwrap();

    let dispatches = b.dispatches.clone();
    assert_eventually(
        || {
            let dispatches = dispatches.clone();
            async move {
                let listed = dispatches.list(&[JOB.to_string()]).await.is_empty();
                let indexed = match dispatches.geo().get(JOB).await {
                    Some(index) => index.is_empty().await,
                    None => true,
                };
                listed && indexed
            }
        },
        WAIT,
        "delete should replicate",
    )
    .await;
}

#[tokio::test]
async fn test_racing_assignments_record_one_offer() {
    let env = TestEnv::new();
    let a = env.replica(1);
    let b = env.replica(2);
    let unit = staffed_unit(&env, &a, JOB, "Adam 1", &[7]).await;
    let dsp = police_dispatch(&a, 0.0, 0.0).await;
    wait_for_dispatch(&b, dsp.id).await;

    let units = [unit.id];
    let (left, right) = tokio::join!(
        a.dispatches.update_assignments(dsp.id, &units, &[], None, None),
        b.dispatches.update_assignments(dsp.id, &units, &[], None, None),
    );
    assert!(left.unwrap().has_unit(unit.id));
    assert!(right.unwrap().has_unit(unit.id));

    let offers = env
        .repo
        .dispatch_status_history(dsp.id)
        .await
        .iter()
        .filter(|s| s.status == DispatchStatusKind::UnitAssigned && s.unit_id == Some(unit.id))
        .count();
    assert_eq!(offers, 1);
    assert_eq!(a.dispatches.get(dsp.id).await.unwrap().units.len(), 1);
}
