use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use futures_util::FutureExt;
use serde::Serialize;
use uuid::Uuid;

use crate::database::establish_connection;
use crate::errors::QueueError;
use crate::models::{Job, JobStats, JobStatus, NewJob};
use crate::retry::{Immediate, RetryPolicy};
use crate::schema::job_queue;

pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const MAX_RETRIES_LIMIT: i32 = 64;

/// Per-call overrides for [`JobQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub run_at: Option<NaiveDateTime>,
    pub max_retries: Option<i32>,
}

impl EnqueueOptions {
    pub fn run_at(mut self, run_at: NaiveDateTime) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Handle on the durable job table.
///
/// Cloning is cheap. Every operation opens its own connection, so clones can
/// be handed to independent workers; all coordination happens in SQLite.
#[derive(Clone)]
pub struct JobQueue {
    database_url: String,
    known_types: Option<Arc<HashSet<String>>>,
    retry_policy: Arc<dyn RetryPolicy>,
    default_max_retries: i32,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("database_url", &self.database_url)
            .field("known_types", &self.known_types)
            .field("default_max_retries", &self.default_max_retries)
            .finish()
    }
}

impl JobQueue {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            known_types: None,
            retry_policy: Arc::new(Immediate),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Rejects any job type outside `known_types` at enqueue time.
    pub fn with_known_types<I, S>(mut self, known_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_types = Some(Arc::new(known_types.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: impl RetryPolicy) -> Self {
        self.retry_policy = Arc::new(retry_policy);
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn connect(&self) -> Result<SqliteConnection, QueueError> {
        establish_connection(&self.database_url)
    }

    pub fn enqueue<T: Serialize + ?Sized>(
        &self,
        job_type: &str,
        data: &T,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        self.check_known_type(job_type)?;
        let data = serde_json::to_string(data)?;

        self.insert(job_type, &data, options)
    }

    pub fn enqueue_json(
        &self,
        job_type: &str,
        data: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        self.enqueue(job_type, &data, options)
    }

    fn check_known_type(&self, job_type: &str) -> Result<(), QueueError> {
        match &self.known_types {
            Some(known_types) if !known_types.contains(job_type) => {
                Err(QueueError::UnknownJobType(job_type.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn insert(
        &self,
        job_type: &str,
        data: &str,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let max_retries = options.max_retries.unwrap_or(self.default_max_retries);

        if !(1..=MAX_RETRIES_LIMIT).contains(&max_retries) {
            return Err(QueueError::InvalidMaxRetries {
                value: max_retries,
                max: MAX_RETRIES_LIMIT,
            });
        }

        let now = now();
        let id = Uuid::new_v4().to_string();

        let new_job = NewJob {
            id: &id,
            job_type,
            data,
            status: JobStatus::Pending,
            run_at: options.run_at.unwrap_or(now),
            attempts: 0,
            max_retries,
            created_at: now,
        };

        let connection = &mut self.connect()?;

        diesel::insert_into(job_queue::table)
            .values(&new_job)
            .execute(connection)?;

        log::info!("Enqueued {} job {}.", job_type, id);

        Ok(id)
    }

    /// Claims the next due job, runs `handler` on it and records the outcome.
    ///
    /// Returns `Ok(false)` when nothing was due. Handler errors and panics are
    /// written to the job row and still count as processed.
    pub async fn process_next<F, Fut>(&self, handler: F) -> Result<bool, QueueError>
    where
        F: FnOnce(Job) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let job = {
            let connection = &mut self.connect()?;
            claim_next_job(connection)?
        };

        let Some(job) = job else {
            log::trace!("There are no available jobs to claim.");
            return Ok(false);
        };

        log::info!(
            "Claimed {} job {} (attempt {}/{}).",
            job.job_type,
            job.id,
            job.attempts,
            job.max_retries
        );

        let outcome = AssertUnwindSafe(async { handler(job.clone()).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(&*panic))));

        let connection = &mut self.connect()?;

        match outcome {
            Ok(()) => self.mark_completed(connection, &job)?,
            Err(error) => self.mark_failed(connection, &job, &format!("{error:#}"))?,
        }

        Ok(true)
    }

    fn mark_completed(
        &self,
        connection: &mut SqliteConnection,
        job: &Job,
    ) -> Result<(), QueueError> {
        let updated = diesel::update(job_queue::table.find(job.id.as_str()))
            .filter(job_queue::status.eq(JobStatus::Running))
            .filter(job_queue::attempts.eq(job.attempts))
            .set((
                job_queue::status.eq(JobStatus::Completed),
                job_queue::completed_at.eq(now()),
            ))
            .execute(connection)?;

        if updated == 0 {
            log::warn!(
                "Job {} finished after its claim was recovered; leaving the row untouched.",
                job.id
            );
        } else {
            log::info!("Completed {} job {}.", job.job_type, job.id);
        }

        Ok(())
    }

    fn mark_failed(
        &self,
        connection: &mut SqliteConnection,
        job: &Job,
        error: &str,
    ) -> Result<(), QueueError> {
        let failed_at = now();

        let updated = if job.is_exhausted() {
            diesel::update(job_queue::table.find(job.id.as_str()))
                .filter(job_queue::status.eq(JobStatus::Running))
                .filter(job_queue::attempts.eq(job.attempts))
                .set((
                    job_queue::status.eq(JobStatus::Dead),
                    job_queue::last_error.eq(error),
                    job_queue::failed_at.eq(failed_at),
                ))
                .execute(connection)?
        } else {
            let run_at = self
                .retry_policy
                .retry_at(job, failed_at)
                .unwrap_or(job.run_at);

            diesel::update(job_queue::table.find(job.id.as_str()))
                .filter(job_queue::status.eq(JobStatus::Running))
                .filter(job_queue::attempts.eq(job.attempts))
                .set((
                    job_queue::status.eq(JobStatus::Failed),
                    job_queue::last_error.eq(error),
                    job_queue::failed_at.eq(failed_at),
                    job_queue::run_at.eq(run_at),
                ))
                .execute(connection)?
        };

        if updated == 0 {
            log::warn!(
                "Job {} failed after its claim was recovered; leaving the row untouched.",
                job.id
            );
        } else if job.is_exhausted() {
            log::error!(
                "{} job {} is dead after {} attempts: {}",
                job.job_type,
                job.id,
                job.attempts,
                error
            );
        } else {
            log::warn!(
                "{} job {} failed (attempt {}/{}): {}",
                job.job_type,
                job.id,
                job.attempts,
                job.max_retries,
                error
            );
        }

        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let connection = &mut self.connect()?;

        let job = find_job(connection, id).optional()?;

        Ok(job)
    }

    pub fn get_stats(&self) -> Result<JobStats, QueueError> {
        let connection = &mut self.connect()?;

        let counts = job_queue::table
            .group_by(job_queue::status)
            .select((job_queue::status, diesel::dsl::count_star()))
            .load::<(JobStatus, i64)>(connection)?;

        let mut stats = JobStats::default();
        for (status, count) in counts {
            stats.add(status, count);
        }

        Ok(stats)
    }

    /// Failed and dead jobs, most recent failure first.
    pub fn get_recent_failed(&self, limit: i64) -> Result<Vec<Job>, QueueError> {
        let connection = &mut self.connect()?;

        let jobs = job_queue::table
            .filter(job_queue::status.eq_any([JobStatus::Failed, JobStatus::Dead]))
            .order((job_queue::failed_at.desc(), job_queue::id.asc()))
            .limit(limit.max(0))
            .select(Job::as_select())
            .load(connection)?;

        Ok(jobs)
    }

    /// Gives every dead job a fresh retry budget.
    pub fn retry_dead(&self) -> Result<usize, QueueError> {
        let connection = &mut self.connect()?;

        let requeued = diesel::update(job_queue::table)
            .filter(job_queue::status.eq(JobStatus::Dead))
            .set((
                job_queue::status.eq(JobStatus::Pending),
                job_queue::attempts.eq(0),
                job_queue::last_error.eq(None::<String>),
                job_queue::failed_at.eq(None::<NaiveDateTime>),
                job_queue::started_at.eq(None::<NaiveDateTime>),
                job_queue::run_at.eq(now()),
            ))
            .execute(connection)?;

        if requeued > 0 {
            log::info!("Requeued {} dead jobs.", requeued);
        }

        Ok(requeued)
    }

    /// Deletes completed jobs whose `completed_at` is before `cutoff`.
    pub fn purge_completed(&self, cutoff: NaiveDateTime) -> Result<usize, QueueError> {
        let connection = &mut self.connect()?;

        let purged = diesel::delete(
            job_queue::table
                .filter(job_queue::status.eq(JobStatus::Completed))
                .filter(job_queue::completed_at.lt(cutoff)),
        )
        .execute(connection)?;

        if purged > 0 {
            log::info!("Purged {} completed jobs older than {}.", purged, cutoff);
        }

        Ok(purged)
    }

    /// Puts jobs that have been `running` for longer than `timeout` back to `pending`.
    ///
    /// Attempts are left alone: the interrupted attempt still counts.
    pub fn recover_stale(&self, timeout: Duration) -> Result<usize, QueueError> {
        let cutoff = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|timeout| now().checked_sub_signed(timeout))
            .ok_or(QueueError::InvalidDuration(timeout))?;

        let connection = &mut self.connect()?;

        let recovered = diesel::update(job_queue::table)
            .filter(job_queue::status.eq(JobStatus::Running))
            .filter(job_queue::started_at.lt(cutoff))
            .set((
                job_queue::status.eq(JobStatus::Pending),
                job_queue::started_at.eq(None::<NaiveDateTime>),
            ))
            .execute(connection)?;

        if recovered > 0 {
            log::warn!(
                "Recovered {} jobs stuck in running for more than {:?}.",
                recovered,
                timeout
            );
        }

        Ok(recovered)
    }
}

/// Atomically moves the earliest due job to `running`.
///
/// The select and the update share one `BEGIN IMMEDIATE` transaction, so the
/// write lock is held from the moment the candidate is read. The update is
/// still guarded on the eligible statuses.
fn claim_next_job(connection: &mut SqliteConnection) -> Result<Option<Job>, QueueError> {
    connection.immediate_transaction::<_, QueueError, _>(|connection| {
        let now = now();

        let candidate = job_queue::table
            .filter(job_queue::status.eq_any(JobStatus::ELIGIBLE))
            .filter(job_queue::run_at.le(now))
            .order((job_queue::run_at.asc(), job_queue::id.asc()))
            .select(job_queue::id)
            .first::<String>(connection)
            .optional()?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let claimed = diesel::update(job_queue::table.find(id.as_str()))
            .filter(job_queue::status.eq_any(JobStatus::ELIGIBLE))
            .set((
                job_queue::status.eq(JobStatus::Running),
                job_queue::started_at.eq(now),
                job_queue::attempts.eq(job_queue::attempts + 1),
            ))
            .execute(connection)?;

        if claimed == 0 {
            return Ok(None);
        }

        Ok(Some(find_job(connection, &id)?))
    })
}

fn find_job(connection: &mut SqliteConnection, id: &str) -> QueryResult<Job> {
    job_queue::table
        .find(id)
        .select(Job::as_select())
        .first(connection)
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("Job panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("Job panicked: {message}")
    } else {
        "Job panicked".to_string()
    }
}
