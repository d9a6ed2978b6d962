//! Graceful shutdown (spec §5, Non-goals: "no orchestration of the process
//! lifecycle beyond accepting a shutdown signal and draining in-flight
//! work").
//!
//! `ShutdownHandle` wraps a `tokio::sync::watch<bool>` broadcast: every
//! long-running task (stream sessions, the writer, the backfill sweeper,
//! the scheduler) holds a receiver and checks it in its `select!` loop.
//! `Coordinator::shutdown` flips the signal, then waits up to a grace
//! period for tasks to report they've drained before returning.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::warn;

#[derive(Clone)]
pub struct ShutdownHandle {
    rx: watch::Receiver<bool>,
}

impl ShutdownHandle {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal flips. Intended for use inside
    /// `tokio::select!` alongside the task's normal work.
    pub async fn triggered(&mut self) {
        let _ = self.rx.changed().await;
    }
}

pub struct Coordinator {
    tx: watch::Sender<bool>,
    grace_period: Duration,
    drain_rx: tokio::sync::mpsc::Receiver<()>,
    drain_tx: tokio::sync::mpsc::Sender<()>,
}

impl Coordinator {
    pub fn new(grace_period: Duration) -> Self {
        let (tx, _rx) = watch::channel(false);
        let (drain_tx, drain_rx) = tokio::sync::mpsc::channel(1);
        Self {
            tx,
            grace_period,
            drain_rx,
            drain_tx,
        }
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Clone to hand to a task that should report completion via `drop`
    /// once it has finished draining.
    pub fn drain_token(&self) -> tokio::sync::mpsc::Sender<()> {
        self.drain_tx.clone()
    }

    /// Flips the signal and waits up to `grace_period` for every
    /// outstanding drain token to be dropped. Tasks that haven't finished
    /// when the grace period elapses are logged and left to be reaped by
    /// process exit.
    pub async fn shutdown(mut self) {
        let _ = self.tx.send(true);
        drop(self.drain_tx);

        let drained = timeout(self.grace_period, async {
            while self.drain_rx.recv().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("shutdown grace period elapsed with tasks still draining");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_observes_shutdown() {
        let coordinator = Coordinator::new(Duration::from_millis(100));
        let mut handle = coordinator.handle();
        assert!(!handle.is_triggered());

        let shutdown = tokio::spawn(coordinator.shutdown());
        handle.triggered().await;
        assert!(handle.is_triggered());
        shutdown.await.unwrap();
    }

    #[tokio::test]
    async fn waits_for_drain_token_drop() {
        let coordinator = Coordinator::new(Duration::from_millis(200));
        let token = coordinator.drain_token();

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(token);
        });

        coordinator.shutdown().await;
        task.await.unwrap();
    }
}
