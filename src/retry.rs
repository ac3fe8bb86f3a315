//! Retry timing for jobs that failed but still have budget left.
//!
//! The queue decides *whether* a job is retried (attempts vs. `max_retries`).
//! A [`RetryPolicy`] only decides *when* it becomes eligible again.

use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};

use crate::models::Job;

pub trait RetryPolicy: Send + Sync + 'static {
    /// New `run_at` for a job that just failed at `failed_at`.
    ///
    /// `None` leaves `run_at` untouched, which makes the job claimable again
    /// right away.
    fn retry_at(&self, job: &Job, failed_at: NaiveDateTime) -> Option<NaiveDateTime>;
}

/// Failed jobs are eligible again immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl RetryPolicy for Immediate {
    fn retry_at(&self, _job: &Job, _failed_at: NaiveDateTime) -> Option<NaiveDateTime> {
        None
    }
}

/// Delays the next attempt by `base * 2^(attempts - 1)`, optionally capped.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn delay_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 31) as u32;
        let delay = self.base.saturating_mul(2u32.saturating_pow(exponent));

        match self.max_delay {
            Some(max_delay) => delay.min(max_delay),
            None => delay,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn retry_at(&self, job: &Job, failed_at: NaiveDateTime) -> Option<NaiveDateTime> {
        let delay = TimeDelta::from_std(self.delay_for(job.attempts)).ok()?;

        failed_at.checked_add_signed(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use chrono::Utc;

    fn job_with_attempts(attempts: i32) -> Job {
        let now = Utc::now().naive_utc();

        Job {
            id: "job-1".into(),
            job_type: "email.send".into(),
            data: "{}".into(),
            status: JobStatus::Running,
            run_at: now,
            attempts,
            max_retries: 5,
            last_error: None,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            failed_at: None,
        }
    }

    #[test]
    fn immediate_keeps_run_at() {
        let now = Utc::now().naive_utc();

        assert_eq!(Immediate.retry_at(&job_with_attempts(1), now), None);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let backoff = ExponentialBackoff::default();

        assert_eq!(backoff.delay_for(1), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(120));
    }

    #[test]
    fn backoff_respects_the_cap() {
        let backoff =
            ExponentialBackoff::new(Duration::from_secs(30)).with_max_delay(Duration::from_secs(90));

        assert_eq!(backoff.delay_for(3), Duration::from_secs(90));
        assert_eq!(backoff.delay_for(40), Duration::from_secs(90));
    }

    #[test]
    fn backoff_moves_run_at_forward() {
        let now = Utc::now().naive_utc();
        let backoff = ExponentialBackoff::new(Duration::from_secs(10));

        let retry_at = backoff.retry_at(&job_with_attempts(2), now).unwrap();

        assert_eq!(retry_at - now, TimeDelta::seconds(20));
    }
}
