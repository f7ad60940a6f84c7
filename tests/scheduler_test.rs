//! End-to-end engine behavior: the control loop claiming, dispatching,
//! recovering, and draining real workers.

mod common;

use std::time::{Duration, Instant};

use common::{repo, spec, submit_service, test_db, wait_for_status};
use taskmill::models::TaskStatus;
use taskmill::scheduler::{Scheduler, SchedulerConfig};
use taskmill::time::now_ms;

fn fast_config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_tasks: max_concurrent,
        sched_tick_ms: 50,
        lease_ms: 60_000,
        recovery_interval_ms: 1_000,
        claim_batch_size: 50,
    }
}

#[tokio::test]
async fn linear_chain_runs_in_dependency_order() {
    let db = test_db().await;
    let submit = submit_service(&db);
    let repo = repo(&db);

    let now = now_ms();
    submit.submit(&spec("a", 50, &[]), now).await.unwrap();
    submit.submit(&spec("b", 50, &["a"]), now).await.unwrap();
    submit.submit(&spec("c", 50, &["b"]), now).await.unwrap();

    let mut scheduler = Scheduler::new(repo.clone(), fast_config(1));
    scheduler.start().await;

    assert!(wait_for_status(&repo, "c", TaskStatus::Completed, Duration::from_secs(10)).await);
    scheduler.stop(Duration::from_secs(2)).await;

    let a = repo.get_task("a").await.unwrap().task;
    let b = repo.get_task("b").await.unwrap().task;
    let c = repo.get_task("c").await.unwrap().task;

    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(b.status, TaskStatus::Completed);
    assert_eq!(c.status, TaskStatus::Completed);

    // Millisecond clocks may tie at the boundary, never invert.
    assert!(a.finished_at.unwrap() <= b.started_at.unwrap());
    assert!(b.started_at.unwrap() <= b.finished_at.unwrap());
    assert!(b.finished_at.unwrap() <= c.started_at.unwrap());
}

#[tokio::test]
async fn concurrency_ceiling_is_never_exceeded() {
    let db = test_db().await;
    let submit = submit_service(&db);
    let repo = repo(&db);

    let now = now_ms();
    for id in ["x", "y", "z"] {
        submit.submit(&spec(id, 200, &[]), now).await.unwrap();
    }

    let started = Instant::now();
    let mut scheduler = Scheduler::new(repo.clone(), fast_config(2));
    scheduler.start().await;

    let mut max_observed = 0;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let running = repo.count_running(now_ms()).await.unwrap();
        max_observed = max_observed.max(running);

        let mut all_done = true;
        for id in ["x", "y", "z"] {
            let done = repo
                .get_task(id)
                .await
                .map(|d| d.task.status == TaskStatus::Completed)
                .unwrap_or(false);
            if !done {
                all_done = false;
                break;
            }
        }
        if all_done || Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let elapsed = started.elapsed();
    scheduler.stop(Duration::from_secs(2)).await;

    for id in ["x", "y", "z"] {
        assert_eq!(
            repo.get_task(id).await.unwrap().task.status,
            TaskStatus::Completed
        );
    }
    assert!(max_observed <= 2, "observed {max_observed} running tasks");
    // Three 200 ms tasks through two slots need at least two rounds.
    assert!(elapsed >= Duration::from_millis(400), "finished in {elapsed:?}");
}

#[tokio::test]
async fn stop_drains_in_flight_work_and_restart_resumes() {
    let db = test_db().await;
    let submit = submit_service(&db);
    let repo = repo(&db);

    submit.submit(&spec("t", 300, &[]), now_ms()).await.unwrap();

    let mut scheduler = Scheduler::new(repo.clone(), fast_config(1));
    scheduler.start().await;
    assert!(wait_for_status(&repo, "t", TaskStatus::Running, Duration::from_secs(5)).await);

    // The in-flight worker finishes inside the drain window.
    scheduler.stop(Duration::from_secs(2)).await;
    assert!(!scheduler.is_running());
    assert_eq!(repo.get_task("t").await.unwrap().task.status, TaskStatus::Completed);

    // No new claims while stopped.
    submit.submit(&spec("u", 50, &[]), now_ms()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(repo.get_task("u").await.unwrap().task.status, TaskStatus::Queued);

    // A second start after stop must succeed.
    scheduler.start().await;
    assert!(scheduler.is_running());
    assert!(wait_for_status(&repo, "u", TaskStatus::Completed, Duration::from_secs(5)).await);
    scheduler.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn stale_running_task_from_dead_process_is_recovered() {
    let db = test_db().await;
    let repo = repo(&db);

    // Simulate a crash: a RUNNING row whose lease expired long ago.
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO tasks (id, type, duration_ms, status, remaining_deps,
                           attempts, max_attempts, created_at, updated_at,
                           started_at, lease_expires_at, last_error)
        VALUES (?, 'sleep', 50, 'RUNNING', 0, 0, 3, ?, ?, ?, ?, 'simulated crash')
        "#,
    )
    .bind("stale")
    .bind(now)
    .bind(now)
    .bind(now - 5_000)
    .bind(now - 1_000)
    .execute(&db.pool)
    .await
    .unwrap();

    let config = SchedulerConfig {
        recovery_interval_ms: 100,
        ..fast_config(1)
    };
    let mut scheduler = Scheduler::new(repo.clone(), config);
    scheduler.start().await;

    assert!(wait_for_status(&repo, "stale", TaskStatus::Completed, Duration::from_secs(10)).await);
    scheduler.stop(Duration::from_secs(2)).await;

    let task = repo.get_task("stale").await.unwrap().task;
    assert!(task.attempts >= 1);
    assert_eq!(task.status, TaskStatus::Completed);
}
