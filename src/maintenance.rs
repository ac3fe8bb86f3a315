use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::watch;

use crate::errors::QueueError;
use crate::models::JobStats;
use crate::queue::JobQueue;

/// What a single maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub recovered: usize,
    pub purged: usize,
    pub stats: JobStats,
}

/// Periodic upkeep: stale claim recovery, completed-job purge and a stats snapshot.
#[derive(Debug, Clone)]
pub struct Maintenance {
    queue: JobQueue,
    stale_timeout: Duration,
    completed_retention: Duration,
}

impl Maintenance {
    pub fn new(queue: JobQueue, stale_timeout: Duration, completed_retention: Duration) -> Self {
        Self {
            queue,
            stale_timeout,
            completed_retention,
        }
    }

    pub fn run_once(&self) -> Result<MaintenanceReport, QueueError> {
        let recovered = self.queue.recover_stale(self.stale_timeout)?;

        let cutoff = TimeDelta::from_std(self.completed_retention)
            .ok()
            .and_then(|retention| Utc::now().naive_utc().checked_sub_signed(retention))
            .ok_or(QueueError::InvalidDuration(self.completed_retention))?;
        let purged = self.queue.purge_completed(cutoff)?;

        let stats = self.queue.get_stats()?;

        log::info!(
            "Queue: {} pending, {} running, {} completed, {} failed, {} dead.",
            stats.pending,
            stats.running,
            stats.completed,
            stats.failed,
            stats.dead
        );

        if stats.dead > 0 {
            log::warn!("{} dead jobs are waiting for an operator.", stats.dead);
        }

        Ok(MaintenanceReport {
            recovered,
            purged,
            stats,
        })
    }

    /// Runs a pass every `interval` until `shutdown` flips to `true`.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let maintenance = self.clone();
            let result = tokio::task::spawn_blocking(move || maintenance.run_once()).await;

            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => log::error!("Maintenance pass failed. {}", e),
                Err(e) => log::error!("Maintenance task panicked. {}", e),
            }
        }

        log::info!("Maintenance loop stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use crate::queue::EnqueueOptions;
    use crate::test_helpers::{succeed, TestDatabase};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[tokio::test]
    async fn a_pass_recovers_purges_and_reports() {
        let db = TestDatabase::new();
        let queue = db.queue();

        let stuck = queue.enqueue("stuck", &(), EnqueueOptions::default()).unwrap();
        db.set_running(&stuck, Utc::now().naive_utc() - TimeDelta::hours(2), 1);

        queue
            .enqueue(
                "old",
                &(),
                EnqueueOptions::default().run_at(Utc::now().naive_utc() - TimeDelta::days(30)),
            )
            .unwrap();
        queue.process_next(succeed).await.unwrap();
        db.backdate_completed(Utc::now().naive_utc() - TimeDelta::days(30));

        let maintenance = Maintenance::new(queue.clone(), Duration::from_secs(60), 7 * DAY);
        let report = maintenance.run_once().unwrap();

        assert_eq!(report.recovered, 1);
        assert_eq!(report.purged, 1);
        assert_eq!(report.stats.pending, 1);
        assert_eq!(report.stats.total(), 1);
        assert_eq!(queue.get_job(&stuck).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn the_loop_exits_on_shutdown() {
        let db = TestDatabase::new();
        let maintenance = Maintenance::new(db.queue(), Duration::from_secs(60), DAY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            maintenance.run(Duration::from_millis(10), shutdown_rx).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("maintenance loop did not stop")
            .unwrap();
    }
}
