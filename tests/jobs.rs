//! Job registry and runner lifecycle tests.

mod common;

use common::wait_until;
use gridbot::error::EngineError;
use gridbot::job::{JobKind, JobRunner, JobState};
use gridbot::shutdown::StopToken;
use gridbot::store::Store;

async fn runner() -> (JobRunner, StopToken) {
    let store = Store::open_in_memory().await.unwrap();
    let root = StopToken::new();
    (JobRunner::new(store, root.child()), root)
}

#[tokio::test]
async fn add_is_rejected_for_duplicate_uids() {
    let (runner, _root) = runner().await;

    runner.add("job-1", JobKind::Limiter).await.unwrap();
    assert!(matches!(
        runner.add("job-1", JobKind::Limiter).await,
        Err(EngineError::Exists(_))
    ));

    let record = runner.get("job-1").await.unwrap();
    assert_eq!(record.state, JobState::Paused);
    assert_eq!(record.kind, JobKind::Limiter);
}

#[tokio::test]
async fn a_returning_job_completes() {
    let (runner, _root) = runner().await;
    runner.add("job-ok", JobKind::Limiter).await.unwrap();

    runner
        .resume("job-ok", |_stop| async move { Ok(()) })
        .await
        .unwrap();

    wait_until("the job to complete", || !runner.is_active("job-ok")).await;
    wait_for_state(&runner, "job-ok", JobState::Completed).await;

    // Terminal jobs cannot be resumed again.
    assert!(matches!(
        runner.resume("job-ok", |_stop| async move { Ok(()) }).await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn a_failing_job_records_the_error() {
    let (runner, _root) = runner().await;
    runner.add("job-bad", JobKind::Looper).await.unwrap();

    runner
        .resume("job-bad", |_stop| async move {
            Err(EngineError::Invariant("holding went negative".to_owned()))
        })
        .await
        .unwrap();

    wait_for_state(&runner, "job-bad", JobState::Failed).await;
    let record = runner.get("job-bad").await.unwrap();
    assert!(record
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("holding went negative"));
}

#[tokio::test]
async fn pause_and_cancel_map_to_their_states() {
    let (runner, _root) = runner().await;
    runner.add("job-p", JobKind::Waller).await.unwrap();

    // A job that runs until told to stop.
    runner
        .resume("job-p", |stop| async move {
            stop.stopped().await;
            Err(EngineError::Stopped(stop.cause()))
        })
        .await
        .unwrap();
    assert!(runner.is_active("job-p"));
    assert_eq!(runner.get("job-p").await.unwrap().state, JobState::Running);

    // Pause waits for the task and persists PAUSED.
    runner.pause("job-p").await.unwrap();
    assert!(!runner.is_active("job-p"));
    assert_eq!(runner.get("job-p").await.unwrap().state, JobState::Paused);

    // Resume again, then cancel; canceled is terminal.
    runner
        .resume("job-p", |stop| async move {
            stop.stopped().await;
            Err(EngineError::Stopped(stop.cause()))
        })
        .await
        .unwrap();
    runner.cancel("job-p").await.unwrap();
    assert_eq!(runner.get("job-p").await.unwrap().state, JobState::Canceled);

    assert!(matches!(
        runner.resume("job-p", |_stop| async move { Ok(()) }).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        runner.pause("job-p").await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn pause_of_a_non_running_job_is_transactional() {
    let (runner, _root) = runner().await;
    runner.add("job-idle", JobKind::Limiter).await.unwrap();

    runner.pause("job-idle").await.unwrap();
    assert_eq!(runner.get("job-idle").await.unwrap().state, JobState::Paused);

    runner.cancel("job-idle").await.unwrap();
    assert_eq!(
        runner.get("job-idle").await.unwrap().state,
        JobState::Canceled
    );
}

#[tokio::test]
async fn remove_only_deletes_non_running_jobs() {
    let (runner, _root) = runner().await;
    runner.add("job-rm", JobKind::Limiter).await.unwrap();

    runner
        .resume("job-rm", |stop| async move {
            stop.stopped().await;
            Err(EngineError::Stopped(stop.cause()))
        })
        .await
        .unwrap();
    assert!(matches!(
        runner.remove("job-rm").await,
        Err(EngineError::Invalid(_))
    ));

    runner.pause("job-rm").await.unwrap();
    runner.remove("job-rm").await.unwrap();
    assert!(matches!(
        runner.get("job-rm").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn pause_all_stops_every_running_job() {
    let (runner, _root) = runner().await;

    for uid in ["job-a", "job-b", "job-c"] {
        runner.add(uid, JobKind::Looper).await.unwrap();
        runner
            .resume(uid, |stop| async move {
                stop.stopped().await;
                Err(EngineError::Stopped(stop.cause()))
            })
            .await
            .unwrap();
    }

    runner.pause_all().await;

    for uid in ["job-a", "job-b", "job-c"] {
        assert!(!runner.is_active(uid));
        assert_eq!(runner.get(uid).await.unwrap().state, JobState::Paused);
    }
}

#[tokio::test]
async fn scan_returns_jobs_in_uid_order() {
    let (runner, _root) = runner().await;

    for uid in ["zeta", "alpha", "mike"] {
        runner.add(uid, JobKind::Limiter).await.unwrap();
    }

    let jobs = runner.scan().await.unwrap();
    let uids: Vec<&str> = jobs.iter().map(|(uid, _)| uid.as_str()).collect();
    assert_eq!(uids, vec!["alpha", "mike", "zeta"]);
}

#[tokio::test]
async fn user_flags_persist_verbatim() {
    let (runner, _root) = runner().await;
    runner.add("job-f", JobKind::Limiter).await.unwrap();

    runner.set_flags("job-f", 0b1010).await.unwrap();
    assert_eq!(runner.get("job-f").await.unwrap().flags, 0b1010);
}

async fn wait_for_state(runner: &JobRunner, uid: &str, state: JobState) {
    for _ in 0..2000 {
        if runner.get(uid).await.unwrap().state == state {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("job {uid} never reached {state:?}");
}
