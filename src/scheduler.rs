//! REST collection scheduling (spec §4.1 "Scheduling"): a periodic tick
//! polls each enabled market/timeframe, but a pending high-priority
//! backfill task preempts the next tick rather than queueing behind it.
//!
//! The teacher's `backfill.rs` ran backfill and the periodic retrieval as
//! entirely separate CLI invocations; here both share one scheduler loop
//! so backfill work never starves behind a slow periodic pass.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::shutdown::ShutdownHandle;

/// Work item handed to the REST collector: either the regular poll or a
/// specific backfill task to run before the next poll.
#[derive(Debug, Clone)]
pub enum Job {
    Poll,
    Backfill { task_id: i64, priority: i32 },
}

/// Drives the tick/preemption policy. Consumers read jobs off `rx`.
pub struct Scheduler {
    poll_interval: Duration,
    priority_floor: i32,
}

impl Scheduler {
    pub fn new(poll_interval: Duration, priority_floor: i32) -> Self {
        Self {
            poll_interval,
            priority_floor,
        }
    }

    /// Runs until `shutdown` fires. `pending_backfill` is polled for the
    /// next high-priority task before each periodic tick; a task at or
    /// above `priority_floor` is dispatched immediately instead of waiting
    /// out the rest of the interval.
    pub async fn run(
        &self,
        jobs_tx: mpsc::Sender<Job>,
        mut pending_backfill: mpsc::Receiver<(i64, i32)>,
        mut shutdown: ShutdownHandle,
    ) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.triggered() => {
                    debug!("scheduler observed shutdown signal");
                    return;
                }

                Some((task_id, priority)) = pending_backfill.recv() => {
                    if priority >= self.priority_floor {
                        if jobs_tx.send(Job::Backfill { task_id, priority }).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    // below the floor: let it wait for the sweeper's own cadence
                }

                _ = ticker.tick() => {
                    if jobs_tx.send(Job::Poll).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn high_priority_backfill_preempts_tick() {
        let scheduler = Scheduler::new(Duration::from_secs(3600), 10);
        let (jobs_tx, mut jobs_rx) = mpsc::channel(4);
        let (backfill_tx, backfill_rx) = mpsc::channel(4);
        let coordinator = crate::shutdown::Coordinator::new(Duration::from_millis(50));
        let handle = coordinator.handle();

        backfill_tx.send((42, 20)).await.unwrap();

        let run = tokio::spawn(async move {
            scheduler.run(jobs_tx, backfill_rx, handle).await;
        });

        let job = jobs_rx.recv().await.unwrap();
        match job {
            Job::Backfill { task_id, .. } => assert_eq!(task_id, 42),
            Job::Poll => panic!("expected preemptive backfill job"),
        }

        coordinator.shutdown().await;
        run.await.unwrap();
    }
}
