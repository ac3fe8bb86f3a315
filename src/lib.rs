//! A durable, SQLite-backed background job queue.
//!
//! Jobs are rows in a single `job_queue` table. Workers claim due jobs one at
//! a time with [`JobQueue::process_next`]; the claim is a single immediate
//! transaction, so any number of workers (threads or processes) can share one
//! database file. Delivery is at-least-once: a job whose worker crashed is put
//! back by [`JobQueue::recover_stale`] and will run again.

#[macro_use]
extern crate diesel;

pub mod config;
pub mod database;
pub mod errors;
pub mod jobs;
pub mod logger;
pub mod maintenance;
pub mod models;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod schema;

#[cfg(test)]
mod test_helpers;

pub use self::errors::QueueError;
pub use self::maintenance::{Maintenance, MaintenanceReport};
pub use self::models::{Job, JobStats, JobStatus};
pub use self::processor::{JobHandler, JobProcessor};
pub use self::queue::{EnqueueOptions, JobQueue, DEFAULT_MAX_RETRIES};
pub use self::retry::{ExponentialBackoff, Immediate, RetryPolicy};
