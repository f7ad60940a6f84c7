//! The atomic claim protocol and completion propagation.

mod common;

use common::{repo, spec, submit_service, test_db};
use taskmill::models::TaskStatus;
use taskmill::TaskmillError;

#[tokio::test]
async fn claim_orders_by_created_at_then_id() {
    let db = test_db().await;
    let submit = submit_service(&db);
    let repo = repo(&db);

    // "late" is oldest by creation time despite its id; "a2"/"a1" tie on
    // created_at and fall back to id order.
    submit.submit(&spec("late", 50, &[]), 1_000).await.unwrap();
    submit.submit(&spec("a2", 50, &[]), 2_000).await.unwrap();
    submit.submit(&spec("a1", 50, &[]), 2_000).await.unwrap();

    let claimed = repo.claim_runnable(3_000, 60_000, 10).await.unwrap();
    let ids: Vec<&str> = claimed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["late", "a1", "a2"]);
}

#[tokio::test]
async fn claim_respects_limit_and_sets_lease_fields() {
    let db = test_db().await;
    let submit = submit_service(&db);
    let repo = repo(&db);

    for id in ["a", "b", "c"] {
        submit.submit(&spec(id, 50, &[]), 1_000).await.unwrap();
    }

    let claimed = repo.claim_runnable(2_000, 60_000, 2).await.unwrap();
    assert_eq!(claimed.len(), 2);

    for claimed_task in &claimed {
        let task = repo.get_task(&claimed_task.id).await.unwrap().task;
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.started_at, Some(2_000));
        assert_eq!(task.lease_expires_at, Some(62_000));
        assert_eq!(task.updated_at, 2_000);
    }

    let c = repo.get_task("c").await.unwrap().task;
    assert_eq!(c.status, TaskStatus::Queued);
    assert_eq!(c.attempts, 0);
}

#[tokio::test]
async fn claim_skips_tasks_with_remaining_dependencies() {
    let db = test_db().await;
    let submit = submit_service(&db);
    let repo = repo(&db);

    submit.submit(&spec("a", 50, &[]), 1_000).await.unwrap();
    submit.submit(&spec("b", 50, &["a"]), 1_000).await.unwrap();

    let claimed = repo.claim_runnable(2_000, 60_000, 10).await.unwrap();
    let ids: Vec<&str> = claimed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["a"]);
}

#[tokio::test]
async fn running_tasks_are_not_claimed_again() {
    let db = test_db().await;
    let submit = submit_service(&db);
    let repo = repo(&db);

    submit.submit(&spec("a", 50, &[]), 1_000).await.unwrap();
    assert_eq!(repo.claim_runnable(2_000, 60_000, 10).await.unwrap().len(), 1);
    assert!(repo.claim_runnable(2_100, 60_000, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn completion_unblocks_dependents_exactly_once() {
    let db = test_db().await;
    let submit = submit_service(&db);
    let repo = repo(&db);

    submit.submit(&spec("a", 50, &[]), 1_000).await.unwrap();
    submit.submit(&spec("b", 50, &["a"]), 1_000).await.unwrap();
    submit
        .submit(&spec("c", 50, &["a", "b"]), 1_000)
        .await
        .unwrap();

    repo.claim_runnable(2_000, 60_000, 1).await.unwrap();
    repo.mark_completed("a", 2_100).await.unwrap();

    let a = repo.get_task("a").await.unwrap().task;
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.finished_at, Some(2_100));
    assert_eq!(a.lease_expires_at, None);

    assert_eq!(repo.get_task("b").await.unwrap().task.remaining_deps, 0);
    assert_eq!(repo.get_task("c").await.unwrap().task.remaining_deps, 1);

    // Only b is runnable now.
    let claimed = repo.claim_runnable(2_200, 60_000, 10).await.unwrap();
    let ids: Vec<&str> = claimed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["b"]);

    repo.mark_completed("b", 2_300).await.unwrap();
    assert_eq!(repo.get_task("c").await.unwrap().task.remaining_deps, 0);
}

#[tokio::test]
async fn mark_completed_requires_running_state() {
    let db = test_db().await;
    let submit = submit_service(&db);
    let repo = repo(&db);

    submit.submit(&spec("a", 50, &[]), 1_000).await.unwrap();

    let err = repo.mark_completed("a", 2_000).await.unwrap_err();
    assert!(
        matches!(&err, TaskmillError::StateConflict { status, .. } if status == "QUEUED")
    );

    let err = repo.mark_completed("missing", 2_000).await.unwrap_err();
    assert!(matches!(err, TaskmillError::NotFound { .. }));
}

#[tokio::test]
async fn double_completion_is_a_state_conflict() {
    let db = test_db().await;
    let submit = submit_service(&db);
    let repo = repo(&db);

    submit.submit(&spec("a", 50, &[]), 1_000).await.unwrap();
    repo.claim_runnable(2_000, 60_000, 1).await.unwrap();
    repo.mark_completed("a", 2_100).await.unwrap();

    let err = repo.mark_completed("a", 2_200).await.unwrap_err();
    assert!(
        matches!(&err, TaskmillError::StateConflict { status, .. } if status == "COMPLETED")
    );
}

#[tokio::test]
async fn count_running_ignores_expired_leases() {
    let db = test_db().await;
    let submit = submit_service(&db);
    let repo = repo(&db);

    submit.submit(&spec("a", 50, &[]), 1_000).await.unwrap();
    repo.claim_runnable(2_000, 500, 1).await.unwrap(); // lease expires at 2_500

    assert_eq!(repo.count_running(2_400).await.unwrap(), 1);
    assert_eq!(repo.count_running(2_500).await.unwrap(), 1); // boundary: still live
    assert_eq!(repo.count_running(2_501).await.unwrap(), 0);
}
