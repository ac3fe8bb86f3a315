//! Shared fixtures for the unit tests.

use std::future::{ready, Ready};

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use tempfile::TempDir;

use crate::database::{establish_connection, run_migrations};
use crate::models::{Job, JobStatus};
use crate::queue::JobQueue;
use crate::schema::job_queue;

/// A migrated SQLite file that lives as long as the fixture.
pub struct TestDatabase {
    _dir: TempDir,
    url: String,
}

impl TestDatabase {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let url = dir.path().join("jobs.db").display().to_string();

        let connection = &mut establish_connection(&url).expect("failed to open test database");
        run_migrations(connection).expect("failed to migrate test database");

        Self { _dir: dir, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.url.clone())
    }

    pub fn connection(&self) -> SqliteConnection {
        establish_connection(&self.url).expect("failed to open test database")
    }

    /// Forces a job into `running`, as if a worker claimed it at `started_at`.
    pub fn set_running(&self, id: &str, started_at: NaiveDateTime, attempts: i32) {
        diesel::update(job_queue::table.find(id))
            .set((
                job_queue::status.eq(JobStatus::Running),
                job_queue::started_at.eq(started_at),
                job_queue::attempts.eq(attempts),
            ))
            .execute(&mut self.connection())
            .expect("failed to mark job running");
    }

    pub fn reschedule_failed(&self, run_at: NaiveDateTime) {
        diesel::update(job_queue::table.filter(job_queue::status.eq(JobStatus::Failed)))
            .set(job_queue::run_at.eq(run_at))
            .execute(&mut self.connection())
            .expect("failed to reschedule failed jobs");
    }

    pub fn backdate_completed(&self, completed_at: NaiveDateTime) {
        diesel::update(job_queue::table.filter(job_queue::status.eq(JobStatus::Completed)))
            .set(job_queue::completed_at.eq(completed_at))
            .execute(&mut self.connection())
            .expect("failed to backdate completed jobs");
    }
}

pub async fn succeed(_job: Job) -> anyhow::Result<()> {
    Ok(())
}

pub async fn explode(_job: Job) -> anyhow::Result<()> {
    panic!("handler blew up")
}

pub fn fail_with(message: &'static str) -> impl FnOnce(Job) -> Ready<anyhow::Result<()>> {
    move |_| ready(Err(anyhow::anyhow!(message)))
}
