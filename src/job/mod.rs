//! Durable job registry and runner.
//!
//! Every supervisor runs as a job keyed by uid at `/jobs/{uid}`. The
//! runner flips job states transactionally, launches job functions in
//! cooperatively cancellable tasks, and maps how a function returned —
//! completed, paused, cancelled, failed — onto the persisted state so a
//! restart knows exactly what to relaunch.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::EngineError;
use crate::shutdown::{StopCause, StopToken};
use crate::store::{keys, Store};

/// What kind of supervisor a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// A single-price-point limiter.
    Limiter,
    /// A buy/sell pair looper.
    Looper,
    /// A grid waller.
    Waller,
}

/// Durable job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    /// Not running; resumable.
    Paused,
    /// Running (or crashed while running).
    Running,
    /// The job function returned successfully. Terminal.
    Completed,
    /// Cancelled by the operator. Terminal.
    Canceled,
    /// The job function returned an error. Terminal.
    Failed,
}

impl JobState {
    /// Whether the job can never run again.
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Canceled | JobState::Failed
        )
    }
}

/// The persisted job record at `/jobs/{uid}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// What kind of supervisor the job runs.
    pub kind: JobKind,
    /// Opaque user-set flags, persisted verbatim.
    pub flags: u64,
    /// Lifecycle state.
    pub state: JobState,
    /// Error message of the last failure, if the job failed.
    #[serde(default)]
    pub error: Option<String>,
}

struct ActiveJob {
    stop: StopToken,
    done: watch::Receiver<bool>,
}

/// The job registry and runner.
pub struct JobRunner {
    store: Store,
    root: StopToken,
    active: Arc<DashMap<String, ActiveJob>>,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    /// A runner over `store`; job tasks stop when `root` fires.
    #[must_use]
    pub fn new(store: Store, root: StopToken) -> Self {
        Self {
            store,
            root,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Register a new job in the PAUSED state.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Exists`] when the uid is taken.
    pub async fn add(&self, uid: &str, kind: JobKind) -> Result<(), EngineError> {
        let key = keys::job(uid);
        let mut tx = self.store.begin().await?;
        if tx.get::<JobRecord>(&key).await?.is_some() {
            return Err(EngineError::Exists(format!("job {uid}")));
        }

        let record = JobRecord {
            kind,
            flags: 0,
            state: JobState::Paused,
            error: None,
        };
        tx.set(&key, &record).await?;
        tx.commit().await
    }

    /// Fetch a job record.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::NotFound`] when the uid is unknown.
    pub async fn get(&self, uid: &str) -> Result<JobRecord, EngineError> {
        self.store
            .get::<JobRecord>(&keys::job(uid))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {uid}")))
    }

    /// Overwrite a job's user flags.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::NotFound`] when the uid is unknown.
    pub async fn set_flags(&self, uid: &str, flags: u64) -> Result<(), EngineError> {
        let key = keys::job(uid);
        let mut tx = self.store.begin().await?;
        let Some(mut record) = tx.get::<JobRecord>(&key).await? else {
            return Err(EngineError::NotFound(format!("job {uid}")));
        };
        record.flags = flags;
        tx.set(&key, &record).await?;
        tx.commit().await
    }

    /// Delete a non-running job.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Invalid`] when the job is running and
    /// [`EngineError::NotFound`] when the uid is unknown.
    pub async fn remove(&self, uid: &str) -> Result<(), EngineError> {
        if self.active.contains_key(uid) {
            return Err(EngineError::invalid(format!("job {uid} is running")));
        }

        let key = keys::job(uid);
        let mut tx = self.store.begin().await?;
        let Some(record) = tx.get::<JobRecord>(&key).await? else {
            return Err(EngineError::NotFound(format!("job {uid}")));
        };
        if record.state == JobState::Running {
            return Err(EngineError::invalid(format!(
                "job {uid} is marked running; pause it first"
            )));
        }
        tx.delete(&key).await?;
        tx.commit().await
    }

    /// Flip the job to RUNNING and launch `job` in its own task.
    ///
    /// When the function returns, the final state is persisted
    /// transactionally: COMPLETED on success, PAUSED or CANCELED when it
    /// observed the matching stop cause, FAILED (with the message)
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Exists`] when the job is already
    /// running, [`EngineError::Invalid`] when it is in a terminal state
    /// and [`EngineError::NotFound`] when the uid is unknown.
    pub async fn resume<F, Fut>(&self, uid: &str, job: F) -> Result<(), EngineError>
    where
        F: FnOnce(StopToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let stop = self.root.child();
        let (done_tx, done_rx) = watch::channel(false);

        // Reserve the uid before touching the store so two concurrent
        // resumes cannot both launch a task.
        match self.active.entry(uid.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::Exists(format!("job {uid} is already running")));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(ActiveJob {
                    stop: stop.clone(),
                    done: done_rx,
                });
            }
        }

        let key = keys::job(uid);
        let flip = async {
            let mut tx = self.store.begin().await?;
            let Some(mut record) = tx.get::<JobRecord>(&key).await? else {
                return Err(EngineError::NotFound(format!("job {uid}")));
            };
            if record.state.is_done() {
                return Err(EngineError::invalid(format!(
                    "job {uid} is {:?} and cannot be resumed",
                    record.state
                )));
            }
            record.state = JobState::Running;
            record.error = None;
            tx.set(&key, &record).await?;
            tx.commit().await
        };
        if let Err(err) = flip.await {
            self.active.remove(uid);
            return Err(err);
        }

        let store = self.store.clone();
        let active = Arc::clone(&self.active);
        let uid = uid.to_owned();
        tokio::spawn(async move {
            let result = job(stop.clone()).await;

            let (state, error) = match result {
                Ok(()) => (JobState::Completed, None),
                Err(err) if err.is_stopped() => match stop.cause() {
                    Some(StopCause::Pause) => (JobState::Paused, None),
                    Some(StopCause::Cancel) | None => (JobState::Canceled, None),
                },
                Err(err) => {
                    log::error!("Job {uid} failed: {err}");
                    (JobState::Failed, Some(err.to_string()))
                }
            };

            if let Err(err) = persist_final_state(&store, &uid, state, error).await {
                log::error!("Could not persist final state of job {uid}: {err}");
            }

            active.remove(&uid);
            let _ = done_tx.send(true);
        });

        Ok(())
    }

    /// Pause a job: signal a running one and wait for it to return, or
    /// flip a non-running one transactionally.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Invalid`] when the job is in a
    /// terminal state and [`EngineError::NotFound`] when the uid is
    /// unknown.
    pub async fn pause(&self, uid: &str) -> Result<(), EngineError> {
        self.stop_job(uid, StopCause::Pause, JobState::Paused).await
    }

    /// Cancel a job: signal a running one and wait for it to return, or
    /// flip a non-running one transactionally. Canceled jobs are
    /// terminal.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Invalid`] when the job is already in a
    /// terminal state and [`EngineError::NotFound`] when the uid is
    /// unknown.
    pub async fn cancel(&self, uid: &str) -> Result<(), EngineError> {
        self.stop_job(uid, StopCause::Cancel, JobState::Canceled)
            .await
    }

    async fn stop_job(
        &self,
        uid: &str,
        cause: StopCause,
        target: JobState,
    ) -> Result<(), EngineError> {
        if let Some(entry) = self.active.get(uid) {
            let stop = entry.stop.clone();
            let mut done = entry.done.clone();
            drop(entry);

            stop.signal(cause);
            // The job task persists the final state before reporting.
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
            return Ok(());
        }

        let key = keys::job(uid);
        let mut tx = self.store.begin().await?;
        let Some(mut record) = tx.get::<JobRecord>(&key).await? else {
            return Err(EngineError::NotFound(format!("job {uid}")));
        };
        if record.state.is_done() {
            return Err(EngineError::invalid(format!(
                "job {uid} is {:?}",
                record.state
            )));
        }
        record.state = target;
        tx.set(&key, &record).await?;
        tx.commit().await
    }

    /// Pause every running job and wait for all of them.
    pub async fn pause_all(&self) {
        let running: Vec<String> = self
            .active
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for uid in running {
            if let Err(err) = self.pause(&uid).await {
                log::warn!("Could not pause job {uid}: {err}");
            }
        }
    }

    /// All job records in uid order, read under one snapshot.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] on a database failure.
    pub async fn scan(&self) -> Result<Vec<(String, JobRecord)>, EngineError> {
        let mut tx = self.store.begin().await?;
        let entries = tx.scan_prefix(keys::JOBS).await?;
        tx.commit().await?;

        let mut jobs = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let uid = key
                .strip_prefix(keys::JOBS)
                .unwrap_or(key.as_str())
                .to_owned();
            jobs.push((uid, serde_json::from_value(value)?));
        }

        Ok(jobs)
    }

    /// Whether the job currently has a live task.
    #[must_use]
    pub fn is_active(&self, uid: &str) -> bool {
        self.active.contains_key(uid)
    }
}

async fn persist_final_state(
    store: &Store,
    uid: &str,
    state: JobState,
    error: Option<String>,
) -> Result<(), EngineError> {
    let key = keys::job(uid);
    let mut tx = store.begin().await?;
    let Some(mut record) = tx.get::<JobRecord>(&key).await? else {
        return Err(EngineError::NotFound(format!("job {uid}")));
    };
    record.state = state;
    record.error = error;
    tx.set(&key, &record).await?;
    tx.commit().await
}
