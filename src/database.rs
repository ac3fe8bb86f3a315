use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::errors::QueueError;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT_MS: u32 = 5_000;

const JOB_QUEUE_DDL: &str = "
CREATE TABLE IF NOT EXISTS job_queue (
    id TEXT PRIMARY KEY NOT NULL,
    type TEXT NOT NULL,
    data TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    run_at TIMESTAMP NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    last_error TEXT,
    created_at TIMESTAMP NOT NULL,
    started_at TIMESTAMP,
    completed_at TIMESTAMP,
    failed_at TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_job_queue_status_run_at ON job_queue(status, run_at);
CREATE INDEX IF NOT EXISTS idx_job_queue_type ON job_queue(type);
";

pub fn establish_connection(database_url: &str) -> Result<SqliteConnection, QueueError> {
    let mut connection =
        SqliteConnection::establish(database_url).map_err(|source| QueueError::Connection {
            url: database_url.to_string(),
            source,
        })?;

    // busy_timeout has to come first so the WAL switch itself waits on a busy file.
    connection.batch_execute(&format!(
        "PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}; PRAGMA journal_mode = WAL;"
    ))?;

    Ok(connection)
}

/// Creates the `job_queue` table and its indexes if they are missing.
pub fn run_migrations(connection: &mut SqliteConnection) -> Result<(), QueueError> {
    connection.batch_execute(JOB_QUEUE_DDL)?;

    log::debug!("job_queue schema is up to date.");

    Ok(())
}
