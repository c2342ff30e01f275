// Leasing-protocol tests against the in-memory store.
//
// The in-memory store mirrors the Postgres semantics, so these pin the
// observable contract: exclusive leases, lease-lost commit rejection,
// ordering, dedupe and concurrency-key admission.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metronome_core::{
    Backoff, ErrorKind, Pipeline, Schedule, ScheduleKind, Task, TaskPayload, TaskPolicy,
    TaskStatus,
};
use metronome_storage::{
    CommitOutcome, EnqueueOutcome, FailOutcome, InMemoryWorkStore, LeasedWork, NewRun, RunFilter,
    WorkQueue, WorkStore,
};
use uuid::Uuid;

fn fixture_task(policy: TaskPolicy) -> Task {
    let now = Utc::now();
    Task {
        id: Uuid::now_v7(),
        title: "fixture".to_string(),
        description: "queue protocol fixture".to_string(),
        created_by: "agent-test".to_string(),
        schedule: Schedule::new(ScheduleKind::Event, "test.topic", "UTC"),
        payload: TaskPayload {
            pipeline: Pipeline { steps: vec![] },
            params: serde_json::Map::new(),
        },
        policy,
        status: TaskStatus::Active,
        catch_up: Default::default(),
        next_run: None,
        last_enqueued_at: None,
        snoozed_until: None,
        created_at: now,
        updated_at: now,
    }
}

fn run_for(work: &LeasedWork, worker: &str, success: bool, kind: Option<ErrorKind>) -> NewRun {
    let now = Utc::now();
    NewRun {
        task_id: work.task_id,
        lease_owner: Some(worker.to_string()),
        leased_until: Some(work.locked_until),
        attempt: work.attempt,
        started_at: now,
        finished_at: now,
        success,
        skipped: false,
        error_kind: kind,
        error: kind.map(|k| format!("{} failure", k)),
        output: None,
    }
}

async fn queue_with_task(policy: TaskPolicy) -> (WorkQueue, Arc<InMemoryWorkStore>, Task) {
    let store = Arc::new(InMemoryWorkStore::new());
    let task = fixture_task(policy);
    store.create_task(&task).await.unwrap();
    let queue = WorkQueue::new(store.clone())
        .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_secs(1)));
    (queue, store, task)
}

#[tokio::test]
async fn contended_lease_is_exclusive() {
    let (queue, store, task) = queue_with_task(TaskPolicy::default()).await;
    queue.enqueue(&task, Utc::now(), 1).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..50 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue
                .lease(&format!("worker-{}", i), Duration::from_secs(30))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one of 50 workers may lease the row");
    assert_eq!(store.due_work_count(), 1);
}

#[tokio::test]
async fn expired_lease_is_recovered_and_stale_commit_rejected() {
    let (queue, store, task) = queue_with_task(TaskPolicy::default()).await;
    queue.enqueue(&task, Utc::now(), 1).await.unwrap();

    let w1 = queue
        .lease("w1", Duration::from_millis(50))
        .await
        .unwrap()
        .expect("w1 leases the row");

    // Let w1's lease expire, then w2 takes the row over.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let w2 = queue
        .lease("w2", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("expired lease is available again");
    assert_eq!(w2.id, w1.id);
    assert_eq!(w2.attempt, w1.attempt, "recovery does not consume an attempt");

    // w1's commit arrives late and must be rejected without a run.
    let stale = queue
        .complete(w1.id, "w1", run_for(&w1, "w1", true, None))
        .await
        .unwrap();
    assert_eq!(stale, CommitOutcome::LeaseLost);
    assert_eq!(store.run_count(), 0);

    let committed = queue
        .complete(w2.id, "w2", run_for(&w2, "w2", true, None))
        .await
        .unwrap();
    assert_eq!(committed, CommitOutcome::Committed);

    let runs = store
        .list_runs(RunFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].lease_owner.as_deref(), Some("w2"));
    assert_eq!(store.due_work_count(), 0);
}

#[tokio::test]
async fn fifo_within_priority_band() {
    let (queue, _store, task) = queue_with_task(TaskPolicy::default()).await;

    let base = Utc::now() - chrono::Duration::seconds(30);
    let mut expected = Vec::new();
    for i in 0..3 {
        let run_at = base + chrono::Duration::seconds(i);
        let outcome = queue.enqueue(&task, run_at, 1).await.unwrap();
        let EnqueueOutcome::Created(id) = outcome else {
            panic!("row should insert");
        };
        expected.push((id, run_at));
    }

    for (id, run_at) in expected {
        let leased = queue
            .lease("w", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("row available");
        assert_eq!(leased.id, id, "older run_at leases first");
        assert_eq!(leased.run_at, run_at);
        queue
            .complete(leased.id, "w", run_for(&leased, "w", true, None))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn higher_priority_leases_first() {
    let store = Arc::new(InMemoryWorkStore::new());
    let queue = WorkQueue::new(store.clone());

    let low = fixture_task(TaskPolicy {
        priority: 2,
        ..Default::default()
    });
    let high = fixture_task(TaskPolicy {
        priority: 8,
        ..Default::default()
    });
    store.create_task(&low).await.unwrap();
    store.create_task(&high).await.unwrap();

    // The low-priority row is older, but priority outranks age.
    queue
        .enqueue(&low, Utc::now() - chrono::Duration::seconds(60), 1)
        .await
        .unwrap();
    queue.enqueue(&high, Utc::now(), 1).await.unwrap();

    let first = queue
        .lease("w", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.task_id, high.id);
}

#[tokio::test]
async fn future_rows_are_not_leasable() {
    let (queue, _store, task) = queue_with_task(TaskPolicy::default()).await;
    queue
        .enqueue(&task, Utc::now() + chrono::Duration::seconds(60), 1)
        .await
        .unwrap();

    assert!(queue
        .lease("w", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn dedupe_key_suppresses_second_row() {
    let (queue, _store, task) = queue_with_task(TaskPolicy {
        dedupe_key: Some("nightly".to_string()),
        dedupe_window_seconds: Some(300),
        ..Default::default()
    })
    .await;

    // Two run_now calls: with a dedupe key set, exactly one row.
    let first = queue.enqueue(&task, Utc::now(), 1).await.unwrap();
    assert!(first.is_created());
    let second = queue
        .enqueue(&task, Utc::now() + chrono::Duration::milliseconds(5), 1)
        .await
        .unwrap();
    assert_eq!(second, EnqueueOutcome::Duplicate);
}

#[tokio::test]
async fn dedupe_window_covers_finished_runs() {
    let (queue, _store, task) = queue_with_task(TaskPolicy {
        dedupe_key: Some("nightly".to_string()),
        dedupe_window_seconds: Some(300),
        ..Default::default()
    })
    .await;

    let outcome = queue.enqueue(&task, Utc::now(), 1).await.unwrap();
    assert!(outcome.is_created());
    let leased = queue
        .lease("w", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    queue
        .complete(leased.id, "w", run_for(&leased, "w", true, None))
        .await
        .unwrap();

    // The run finished moments ago, inside the 300s window.
    let suppressed = queue
        .enqueue(&task, Utc::now() + chrono::Duration::milliseconds(5), 1)
        .await
        .unwrap();
    assert_eq!(suppressed, EnqueueOutcome::Duplicate);
}

#[tokio::test]
async fn without_dedupe_key_two_rows_coexist() {
    let (queue, _store, task) = queue_with_task(TaskPolicy::default()).await;
    assert!(queue.enqueue(&task, Utc::now(), 1).await.unwrap().is_created());
    assert!(queue
        .enqueue(&task, Utc::now() + chrono::Duration::milliseconds(5), 1)
        .await
        .unwrap()
        .is_created());
}

#[tokio::test]
async fn concurrency_key_is_an_admission_check_not_a_wait() {
    let store = Arc::new(InMemoryWorkStore::new());
    let queue = WorkQueue::new(store.clone());

    let serial = fixture_task(TaskPolicy {
        concurrency_key: Some("serial-flow".to_string()),
        ..Default::default()
    });
    let other = fixture_task(TaskPolicy::default());
    store.create_task(&serial).await.unwrap();
    store.create_task(&other).await.unwrap();

    queue
        .enqueue(&serial, Utc::now() - chrono::Duration::seconds(20), 1)
        .await
        .unwrap();
    queue
        .enqueue(&serial, Utc::now() - chrono::Duration::seconds(10), 1)
        .await
        .unwrap();
    queue.enqueue(&other, Utc::now(), 1).await.unwrap();

    let first = queue
        .lease("w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.task_id, serial.id);

    // The second occurrence of the serial task is blocked, but unrelated
    // work is not: the leaser skips to the next candidate.
    let second = queue
        .lease("w2", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.task_id, other.id);
    assert!(queue
        .lease("w3", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());

    // Completing the first occurrence unblocks the key.
    queue
        .complete(first.id, "w1", run_for(&first, "w1", true, None))
        .await
        .unwrap();
    let third = queue
        .lease("w3", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third.task_id, serial.id);
}

#[tokio::test]
async fn fail_rearms_with_attempt_increment() {
    let (queue, store, task) = queue_with_task(TaskPolicy::default()).await;
    queue.enqueue(&task, Utc::now(), 1).await.unwrap();

    let leased = queue
        .lease("w", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let outcome = queue
        .fail(
            &leased,
            "w",
            &task.policy,
            ErrorKind::Tool,
            run_for(&leased, "w", false, Some(ErrorKind::Tool)),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, FailOutcome::Rearmed { .. }));

    // The failed attempt is observable as a run, and the row survives with
    // attempt bumped.
    assert_eq!(store.run_count(), 1);
    let rows = store.list_due_work_for_task(task.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempt, 2);
    assert!(rows[0].lease_owner.is_none());
}

#[tokio::test]
async fn fail_is_terminal_when_budget_exhausted() {
    let (queue, store, task) = queue_with_task(TaskPolicy {
        max_retries: 1,
        ..Default::default()
    })
    .await;
    queue.enqueue(&task, Utc::now(), 1).await.unwrap();

    // attempt 1 -> re-arm
    let leased = queue
        .lease("w", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    queue
        .fail(
            &leased,
            "w",
            &task.policy,
            ErrorKind::Tool,
            run_for(&leased, "w", false, Some(ErrorKind::Tool)),
        )
        .await
        .unwrap();

    // Wait out the (shrunken) backoff, then attempt 2 -> terminal.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let leased = queue
        .lease("w", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("re-armed row becomes available");
    assert_eq!(leased.attempt, 2);
    let outcome = queue
        .fail(
            &leased,
            "w",
            &task.policy,
            ErrorKind::Tool,
            run_for(&leased, "w", false, Some(ErrorKind::Tool)),
        )
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::Terminal);
    assert_eq!(store.due_work_count(), 0);
    assert_eq!(store.run_count(), 2);
}

#[tokio::test]
async fn template_errors_never_retry() {
    let (queue, store, task) = queue_with_task(TaskPolicy::default()).await;
    queue.enqueue(&task, Utc::now(), 1).await.unwrap();

    let leased = queue
        .lease("w", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    // Plenty of retry budget left, but template errors are pipeline-terminal.
    let outcome = queue
        .fail(
            &leased,
            "w",
            &task.policy,
            ErrorKind::Template,
            run_for(&leased, "w", false, Some(ErrorKind::Template)),
        )
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::Terminal);
    assert_eq!(store.due_work_count(), 0);

    let runs = store
        .list_runs(RunFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].error_kind.as_deref(), Some("template"));
}

#[tokio::test]
async fn released_lease_is_immediately_available() {
    let (queue, _store, task) = queue_with_task(TaskPolicy::default()).await;
    queue.enqueue(&task, Utc::now(), 1).await.unwrap();

    let leased = queue
        .lease("w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert!(queue.release(leased.id, "w1").await.unwrap());

    let retaken = queue.lease("w2", Duration::from_secs(30)).await.unwrap();
    assert!(retaken.is_some());
}

#[tokio::test]
async fn expired_lease_cannot_be_extended() {
    let (queue, _store, task) = queue_with_task(TaskPolicy::default()).await;
    queue.enqueue(&task, Utc::now(), 1).await.unwrap();

    let leased = queue
        .lease("w1", Duration::from_millis(30))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!queue
        .extend_lease(leased.id, "w1", Duration::from_secs(30))
        .await
        .unwrap());
}
