mod test_harness;

use centrum::error::ErrorKind;
use centrum::model::access::{AccessLevel, UnitJobAccess};
use centrum::model::unit::{Unit, UnitAttribute, UnitStatusInput, UnitStatusKind};
use centrum::model::user::UserInfo;
use test_harness::{staffed_unit, TestEnv, JOB};

fn restricted_unit(name: &str, minimum_grade: i32) -> Unit {
    let mut unit = Unit::new(JOB, name, name);
    unit.access.jobs.push(UnitJobAccess {
        id: 0,
        target_id: 0,
        job: JOB.to_string(),
        minimum_grade,
        access: AccessLevel::Join,
    });
    unit
}

#[tokio::test]
async fn test_new_unit_starts_unavailable() {
    let env = TestEnv::new();
    let node = env.node();

    let unit = node.units.create(Unit::new(JOB, "Adam 1", "A1")).await.unwrap();
    assert_eq!(unit.current_status(), UnitStatusKind::Unavailable);
    assert!(unit.is_empty());
    assert_eq!(node.units.list(&[JOB.to_string()]).await.len(), 1);
    assert_eq!(env.publisher.count("centrum.police.unit.created").await, 1);
}

#[tokio::test]
async fn test_first_member_makes_unit_available() {
    let env = TestEnv::new();
    let node = env.node();

    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7, 8]).await;
    assert_eq!(unit.current_status(), UnitStatusKind::Available);
    assert_eq!(unit.user_ids(), vec![7, 8]);

    let mapping = node.units.user_mapping(7).await.unwrap();
    assert_eq!(mapping.unit_id, unit.id);
    assert_eq!(mapping.job, JOB);
}

#[tokio::test]
async fn test_last_member_leaving_makes_unit_unavailable() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7, 8]).await;

    let after_first = node.units.leave_unit(JOB, 7).await.unwrap().unwrap();
    assert_eq!(after_first.current_status(), UnitStatusKind::Available);

    let after_last = node.units.leave_unit(JOB, 8).await.unwrap().unwrap();
    assert!(after_last.is_empty());
    assert_eq!(after_last.current_status(), UnitStatusKind::Unavailable);
    assert!(node.units.user_mapping(8).await.is_none());

    // Leaving again is a no-op
    assert!(node.units.leave_unit(JOB, 8).await.unwrap().is_none());
    let status = node.units.get(unit.id).await.unwrap().current_status();
    assert_eq!(status, UnitStatusKind::Unavailable);
}

#[tokio::test]
async fn test_membership_pseudo_statuses_go_to_history_only() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;

    let history = env.repo.unit_status_history(unit.id).await;
    let added: Vec<_> = history
        .iter()
        .filter(|s| s.status == UnitStatusKind::UserAdded)
        .collect();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].user_id, Some(7));
    assert!(added[0].user.is_some());

    assert_eq!(node.units.get(unit.id).await.unwrap().current_status(), UnitStatusKind::Available);
}

#[tokio::test]
async fn test_joining_another_unit_leaves_the_first() {
    let env = TestEnv::new();
    let node = env.node();
    let first = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let second = node.units.create(Unit::new(JOB, "Adam 2", "A2")).await.unwrap();

    let second = node
        .units
        .update_unit_assignments(JOB, second.id, &[7], &[], None)
        .await
        .unwrap();
    assert!(second.has_user(7));
    assert_eq!(second.current_status(), UnitStatusKind::Available);

    let first = node.units.get(first.id).await.unwrap();
    assert!(first.is_empty());
    assert_eq!(first.current_status(), UnitStatusKind::Unavailable);
    assert_eq!(node.units.user_mapping(7).await.unwrap().unit_id, second.id);

    let removed = env
        .repo
        .unit_status_history(first.id)
        .await
        .into_iter()
        .filter(|s| s.status == UnitStatusKind::UserRemoved)
        .count();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn test_off_duty_users_are_skipped() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = node.units.create(Unit::new(JOB, "Adam 1", "A1")).await.unwrap();

    let unit = node
        .units
        .update_unit_assignments(JOB, unit.id, &[42], &[], None)
        .await
        .unwrap();
    assert!(unit.is_empty());
    assert_eq!(unit.current_status(), UnitStatusKind::Unavailable);
    assert!(node.units.user_mapping(42).await.is_none());
}

#[tokio::test]
async fn test_unit_of_other_job_is_not_found() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = node.units.create(Unit::new("ambulance", "Medic 1", "M1")).await.unwrap();

    let err = node
        .units
        .update_unit_assignments(JOB, unit.id, &[7], &[], None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_static_unit_refuses_available() {
    let env = TestEnv::new();
    let node = env.node();
    let mut unit = Unit::new(JOB, "Dispatch Desk", "DD");
    unit.attributes.insert(UnitAttribute::Static);
    let unit = node.units.create(unit).await.unwrap();
    env.on_duty(7, JOB).await;

    let unit = node
        .units
        .update_unit_assignments(JOB, unit.id, &[7], &[], None)
        .await
        .unwrap();
    assert!(unit.has_user(7));
    assert_eq!(unit.current_status(), UnitStatusKind::Unavailable);

    let dropped = node
        .units
        .update_status(unit.id, UnitStatusInput::new(UnitStatusKind::Available))
        .await
        .unwrap();
    assert!(dropped.is_none());

    let busy = node
        .units
        .update_status(unit.id, UnitStatusInput::new(UnitStatusKind::Busy))
        .await
        .unwrap();
    assert!(busy.is_some());
    assert_eq!(node.units.get(unit.id).await.unwrap().current_status(), UnitStatusKind::Busy);
}

#[tokio::test]
async fn test_repeated_availability_status_is_dropped() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;

    node.units
        .update_status(unit.id, UnitStatusInput::new(UnitStatusKind::OnBreak))
        .await
        .unwrap()
        .unwrap();
    let repeated = node
        .units
        .update_status(unit.id, UnitStatusInput::new(UnitStatusKind::OnBreak))
        .await
        .unwrap();
    assert!(repeated.is_none());
}

#[tokio::test]
async fn test_join_requires_access_grant() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = node.units.create(restricted_unit("SWAT", 3)).await.unwrap();
    assert_eq!(unit.access.jobs.len(), 1);
    assert!(unit.access.jobs[0].id > 0);
    env.on_duty(7, JOB).await;
    env.on_duty(8, JOB).await;

    let err = node
        .units
        .join_unit(JOB, &UserInfo::new(7, JOB, 1), unit.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let joined = node
        .units
        .join_unit(JOB, &UserInfo::new(8, JOB, 3), unit.id)
        .await
        .unwrap();
    assert!(joined.has_user(8));
    assert_eq!(joined.current_status(), UnitStatusKind::Available);
}

#[tokio::test]
async fn test_join_requires_duty() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = node.units.create(Unit::new(JOB, "Adam 1", "A1")).await.unwrap();

    let err = node
        .units
        .join_unit(JOB, &UserInfo::new(9, JOB, 1), unit.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotOnDuty);
}

#[tokio::test]
async fn test_update_keeps_members_and_reconciles_access() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = node.units.create(restricted_unit("SWAT", 3)).await.unwrap();
    env.on_duty(7, JOB).await;
    let unit = node
        .units
        .update_unit_assignments(JOB, unit.id, &[7], &[], None)
        .await
        .unwrap();

    let mut changed = unit.clone();
    changed.name = "SWAT Alpha".to_string();
    changed.users.clear();
    changed.access.jobs[0].minimum_grade = 5;
    let updated = node.units.update(changed).await.unwrap();

    assert_eq!(updated.name, "SWAT Alpha");
    assert!(updated.has_user(7));
    assert_eq!(updated.current_status(), UnitStatusKind::Available);
    assert_eq!(updated.access.jobs.len(), 1);
    assert_eq!(updated.access.jobs[0].minimum_grade, 5);
}

#[tokio::test]
async fn test_available_list_excludes_opted_out_units() {
    let env = TestEnv::new();
    let node = env.node();
    let pooled = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let opted_out = staffed_unit(&env, &node, JOB, "Adam 2", &[8]).await;
    let mut manual = opted_out.clone();
    manual.attributes.insert(UnitAttribute::NoDispatchAutoAssign);
    node.units.update(manual).await.unwrap();

    let available: Vec<u64> = node.units.list_available(JOB).await.iter().map(|u| u.id).collect();
    assert_eq!(available, vec![pooled.id]);
}

#[tokio::test]
async fn test_delete_clears_mappings() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;

    node.units.delete(unit.id).await.unwrap();
    assert!(node.units.user_mapping(7).await.is_none());
    assert_eq!(node.units.get(unit.id).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert!(node.units.list(&[JOB.to_string()]).await.is_empty());
}
