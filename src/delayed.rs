//! Background promotion of due delayed messages.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    address::AddressTranslator,
    connection::ConnectionFactory,
    db::{delayed::DelayedMessageTable, queue::TableQueueCache},
    error::Error,
    receive::circuit_breaker::CircuitBreaker,
};

#[derive(Clone, Copy, Debug)]
pub struct DueMessageSettings {
    pub batch_size: u32,
    pub poll_interval: Duration,
    /// How far a row that cannot be moved is pushed back.
    pub retry_delay: Duration,
    pub circuit_breaker_trigger: Duration,
}

/// Moves delayed messages into their destination queues once they are due.
///
/// After a full batch the processor goes again right away. Otherwise it sleeps until the next
/// due time, the poll interval, or until a new delayed message is stored, whichever comes first.
pub struct DueDelayedMessageProcessor {
    table: Arc<DelayedMessageTable>,
    connections: ConnectionFactory,
    queues: Arc<TableQueueCache>,
    translator: Arc<AddressTranslator>,
    settings: DueMessageSettings,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl DueDelayedMessageProcessor {
    pub fn new(
        table: Arc<DelayedMessageTable>,
        connections: ConnectionFactory,
        queues: Arc<TableQueueCache>,
        translator: Arc<AddressTranslator>,
        settings: DueMessageSettings,
    ) -> Self {
        Self {
            table,
            connections,
            queues,
            translator,
            settings,
            running: Mutex::new(None),
        }
    }

    pub fn table(&self) -> &DelayedMessageTable {
        &self.table
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Starts the processing loop. Starting a running processor does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let worker = Worker {
            table: self.table.clone(),
            connections: self.connections.clone(),
            queues: self.queues.clone(),
            translator: self.translator.clone(),
            settings: self.settings,
            breaker: CircuitBreaker::new(
                "delayed message processor",
                self.settings.circuit_breaker_trigger,
            ),
            cancel: cancel.clone(),
        };

        tracing::debug!(table = %self.table.address(), "Starting due delayed message processor");

        *running = Some((cancel, tokio::spawn(worker.run())));
    }

    /// Stops the loop, letting a row that is being moved finish first.
    pub async fn stop(&self) {
        let Some((cancel, handle)) = self.running.lock().take() else {
            return;
        };

        cancel.cancel();

        if let Err(e) = handle.await {
            tracing::error!("Due delayed message processor panicked: {e}");
        }
    }
}

struct Worker {
    table: Arc<DelayedMessageTable>,
    connections: ConnectionFactory,
    queues: Arc<TableQueueCache>,
    translator: Arc<AddressTranslator>,
    settings: DueMessageSettings,
    breaker: CircuitBreaker,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        while !self.cancel.is_cancelled() {
            let moved = self
                .table
                .move_due_messages(
                    &self.connections,
                    &self.queues,
                    &self.translator,
                    self.settings.batch_size,
                    self.settings.retry_delay,
                    &self.cancel,
                )
                .await;

            match moved {
                Ok(batch) => {
                    self.breaker.success();
                    for destination in &batch.moved {
                        self.queues.get(destination).notify_arrival();
                    }
                    if batch.is_full(self.settings.batch_size) {
                        continue;
                    }
                }
                Err(Error::Cancelled) => break,
                Err(e) => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.breaker.failure(&e) => {}
                    }
                    continue;
                }
            }

            let wait = match self.table.next_due(&self.connections, &self.cancel).await {
                Ok(next) => self.wait_for(next),
                Err(Error::Cancelled) => break,
                Err(e) => {
                    tracing::warn!("Failed to read the next delayed message due time: {e}");
                    self.settings.poll_interval
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.table.stored() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::debug!(table = %self.table.address(), "Due delayed message processor stopped");
    }

    /// Time until `next` is due, capped by the poll interval. A due time that has already passed
    /// means another processor is behind, so it falls back to the poll interval.
    fn wait_for(&self, next: Option<chrono::DateTime<Utc>>) -> Duration {
        let poll = self.settings.poll_interval;

        next.and_then(|due| (due - Utc::now()).to_std().ok())
            .filter(|until| !until.is_zero())
            .map_or(poll, |until| until.min(poll))
    }
}
