//! Background outbox drain worker
//!
//! Runs the drain loop on an interval with exponential backoff while the
//! queue is empty or the index is failing. Cancellation via `stop()`
//! finishes the in-flight pass and releases any claimed entries back to
//! `pending`; nothing is ever left half-marked.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;

use super::{drain, release_claimed, GraphIndexSink};
use crate::error::{CortexError, Result};
use crate::storage::Storage;

/// Commands for the outbox worker
#[derive(Debug)]
enum WorkerCommand {
    /// Run a drain pass now
    Drain,
    /// Stop the worker
    Stop,
}

/// Configuration for the drain loop
#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    /// Entries claimed per pass
    pub batch_size: i64,
    /// Base tick between passes
    pub poll_interval: Duration,
    /// Backoff ceiling after repeated empty/failing passes
    pub max_backoff: Duration,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Handle to the background drain task
///
/// Dropping the handle closes the command channel, which the task treats
/// the same as `stop()`.
pub struct OutboxWorker {
    sender: mpsc::Sender<WorkerCommand>,
    handle: tokio::task::JoinHandle<()>,
}

impl OutboxWorker {
    /// Start the worker
    ///
    /// Claimed-but-undelivered entries from a previous crash are released
    /// before the first pass.
    pub fn start(
        storage: Storage,
        sink: Arc<dyn GraphIndexSink>,
        config: OutboxWorkerConfig,
    ) -> Result<Self> {
        let (sender, mut receiver) = mpsc::channel::<WorkerCommand>(16);

        storage.with_transaction(|conn| {
            let released = release_claimed(conn)?;
            if released > 0 {
                tracing::info!(released, "released stranded outbox entries on startup");
            }
            Ok(())
        })?;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(config.poll_interval);
            let max_skip = (config.max_backoff.as_millis()
                / config.poll_interval.as_millis().max(1)) as u32;
            let mut idle_streak: u32 = 0;
            let mut skip_ticks: u32 = 0;

            loop {
                tokio::select! {
                    cmd = receiver.recv() => {
                        match cmd {
                            Some(WorkerCommand::Drain) => {
                                idle_streak = 0;
                                skip_ticks = 0;
                                Self::run_pass(&storage, sink.as_ref(), config.batch_size);
                            }
                            // A closed channel means every handle is gone
                            Some(WorkerCommand::Stop) | None => {
                                let _ = storage.with_transaction(release_claimed);
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if skip_ticks > 0 {
                            skip_ticks -= 1;
                            continue;
                        }
                        if Self::run_pass(&storage, sink.as_ref(), config.batch_size) {
                            idle_streak = 0;
                        } else {
                            // Exponential backoff while empty or failing
                            idle_streak = idle_streak.saturating_add(1);
                            skip_ticks = (1u32 << idle_streak.min(16)).min(max_skip.max(1));
                        }
                    }
                }
            }

            tracing::info!("Outbox worker stopped");
        });

        Ok(Self { sender, handle })
    }

    /// Run one pass; returns true when any entry was delivered
    fn run_pass(storage: &Storage, sink: &dyn GraphIndexSink, batch_size: i64) -> bool {
        match drain(storage, sink, batch_size) {
            Ok(report) => report.delivered > 0,
            Err(e) => {
                tracing::error!(error = %e, "outbox drain pass failed");
                false
            }
        }
    }

    /// Trigger a drain pass immediately
    pub async fn drain_now(&self) -> Result<()> {
        self.sender
            .send(WorkerCommand::Drain)
            .await
            .map_err(|_| CortexError::Replication("Worker channel closed".to_string()))?;
        Ok(())
    }

    /// Stop the worker, leaving undelivered entries pending
    pub async fn stop(&self) -> Result<()> {
        self.sender
            .send(WorkerCommand::Stop)
            .await
            .map_err(|_| CortexError::Replication("Worker channel closed".to_string()))?;
        Ok(())
    }

    /// Close the command channel and wait for the task to exit
    pub async fn join(self) -> Result<()> {
        let Self { sender, handle } = self;
        drop(sender);
        handle
            .await
            .map_err(|_| CortexError::Replication("Worker task panicked".to_string()))
    }
}
