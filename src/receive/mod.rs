//! Receive loops.
//!
//! A [`MessageReceiver`] owns one input queue. Once started it runs a loop that peeks the queue,
//! and for every message it expects spawns a task (bounded by `max_concurrency`) that lets the
//! configured [`strategy`] receive and process one message.

use std::sync::Arc;

use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::Config,
    connection::ConnectionFactory,
    db::queue::TableQueue,
    dispatch::MessageDispatcher,
    error::Error,
    failure_info::FailureInfoStorage,
    handler::MessageHandler,
    transaction::{MultiResourceEnlistment, TransactionMode},
};

pub mod circuit_breaker;
pub mod peeker;
pub mod purger;
pub mod strategy;

use circuit_breaker::CircuitBreaker;
use peeker::{PeekSettings, QueuePeeker};
use purger::ExpiredMessagesPurger;
use strategy::{Outcome, ProcessStrategy, Processing};

/// Per-receiver settings. Unset values fall back to the transport configuration.
#[derive(Clone, Debug)]
pub struct ReceiveSettings {
    pub id: String,
    pub receive_address: String,
    pub error_queue: Option<String>,
    pub purge_on_startup: Option<bool>,
}

impl ReceiveSettings {
    pub fn new(id: impl Into<String>, receive_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            receive_address: receive_address.into(),
            error_queue: None,
            purge_on_startup: None,
        }
    }

    pub fn error_queue(mut self, error_queue: impl Into<String>) -> Self {
        self.error_queue = Some(error_queue.into());
        self
    }

    pub fn purge_on_startup(mut self, purge: bool) -> Self {
        self.purge_on_startup = Some(purge);
        self
    }
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
    receive_loop: JoinHandle<()>,
    purger: Option<JoinHandle<()>>,
}

pub struct MessageReceiver {
    id: String,
    queue: Arc<TableQueue>,
    error_queue: Arc<TableQueue>,
    connections: ConnectionFactory,
    dispatcher: MessageDispatcher,
    config: Arc<Config>,
    mode: TransactionMode,
    enlistment: MultiResourceEnlistment,
    purge_on_startup: bool,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl MessageReceiver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        queue: Arc<TableQueue>,
        error_queue: Arc<TableQueue>,
        connections: ConnectionFactory,
        dispatcher: MessageDispatcher,
        config: Arc<Config>,
        mode: TransactionMode,
        enlistment: MultiResourceEnlistment,
        purge_on_startup: bool,
    ) -> Self {
        Self {
            id,
            queue,
            error_queue,
            connections,
            dispatcher,
            config,
            mode,
            enlistment,
            purge_on_startup,
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &TableQueue {
        &self.queue
    }

    pub fn transaction_mode(&self) -> TransactionMode {
        self.mode
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Runs the startup purges and starts receiving.
    pub async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<(), Error> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::invalid_parameter(format!(
                "receiver {} is already started",
                self.id
            )));
        }

        let cancel = CancellationToken::new();
        self.prepare(&cancel).await?;

        let processing = Processing {
            connections: self.connections.clone(),
            queue: self.queue.clone(),
            error_queue: self.error_queue.clone(),
            failures: Arc::new(FailureInfoStorage::new(
                self.config.failure_info_capacity(),
                self.config.max_failures(),
            )),
            dispatcher: self.dispatcher.clone(),
            handler,
            transaction_timeout: self.config.transaction_timeout(),
            enlistment: self.enlistment,
        };
        let strategy = strategy::select(self.mode, Arc::new(processing));

        let peeker = QueuePeeker::new(
            PeekSettings {
                min_delay: self.config.peek_delay(),
                max_delay: self.config.max_peek_delay(),
                max_records: self.config.max_records_to_peek(),
            },
            CircuitBreaker::new(
                format!("{} peek", self.id),
                self.config.circuit_breaker_trigger(),
            ),
        );

        let tracker = TaskTracker::new();
        let receive_loop = tokio::spawn(
            ReceiveLoop {
                queue: self.queue.clone(),
                connections: self.connections.clone(),
                strategy,
                peeker,
                breaker: Arc::new(CircuitBreaker::new(
                    format!("{} receive", self.id),
                    self.config.circuit_breaker_trigger(),
                )),
                concurrency: Arc::new(Semaphore::new(self.config.max_concurrency())),
                tracker: tracker.clone(),
                cancel: cancel.clone(),
            }
            .run(),
        );

        let purger = self.config.expired_purge_interval().map(|interval| {
            let purger = ExpiredMessagesPurger::new(
                self.queue.clone(),
                self.connections.clone(),
                self.config.purge_batch_size(),
            );
            tokio::spawn(purger.run_periodically(interval, cancel.clone()))
        });

        tracing::info!(
            receiver = %self.id,
            queue = %self.queue.address(),
            mode = %self.mode,
            "Receiver started"
        );

        *running = Some(Running {
            cancel,
            tracker,
            receive_loop,
            purger,
        });

        Ok(())
    }

    async fn prepare(&self, cancel: &CancellationToken) -> Result<(), Error> {
        if self.purge_on_startup {
            let mut conn = self.connections.open_connection(cancel).await?;
            let purged = self.queue.purge(&mut conn).await?;
            tracing::info!(queue = %self.queue.address(), purged, "Purged queue on startup");
        }

        let purge_expired = self.config.purge_expired_on_startup();

        if purge_expired || self.config.expired_purge_interval().is_some() {
            let mut conn = self.connections.open_connection(cancel).await?;
            self.queue.log_warning_when_index_is_missing(&mut conn).await?;
        }

        if purge_expired {
            ExpiredMessagesPurger::new(
                self.queue.clone(),
                self.connections.clone(),
                self.config.purge_batch_size(),
            )
            .purge(cancel)
            .await?;
        }

        Ok(())
    }

    /// Stops receiving and waits for in-flight messages to finish.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.cancel.cancel();

        if let Err(e) = running.receive_loop.await {
            tracing::error!(receiver = %self.id, "Receive loop panicked: {e}");
        }
        if let Some(purger) = running.purger {
            if let Err(e) = purger.await {
                tracing::error!(receiver = %self.id, "Expired message purger panicked: {e}");
            }
        }

        running.tracker.close();
        running.tracker.wait().await;

        tracing::info!(receiver = %self.id, "Receiver stopped");
    }
}

struct ReceiveLoop {
    queue: Arc<TableQueue>,
    connections: ConnectionFactory,
    strategy: Arc<dyn ProcessStrategy>,
    peeker: QueuePeeker,
    breaker: Arc<CircuitBreaker>,
    concurrency: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    async fn run(mut self) {
        loop {
            let depth = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                depth = self.peeker.peek(&self.queue, &self.connections, &self.cancel) => depth,
            };

            let Ok(depth) = depth else {
                break;
            };

            for _ in 0..depth {
                let permit = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    permit = self.concurrency.clone().acquire_owned() => permit,
                };

                let Ok(permit) = permit else {
                    return;
                };

                let strategy = self.strategy.clone();
                let breaker = self.breaker.clone();
                let queue = self.queue.clone();
                let cancel = self.cancel.clone();

                self.tracker.spawn(async move {
                    process_one(strategy.as_ref(), &breaker, &queue, &cancel).await;
                    drop(permit);
                });
            }
        }
    }
}

async fn process_one(
    strategy: &dyn ProcessStrategy,
    breaker: &CircuitBreaker,
    queue: &TableQueue,
    cancel: &CancellationToken,
) {
    match strategy.process_message(cancel).await {
        Ok(Outcome::Processed) => {
            breaker.success();
            tracing::trace!(queue = %queue.address(), "Processed message");
        }
        Ok(_) => breaker.success(),
        Err(Error::Cancelled) => {}
        Err(e) => breaker.failure(&e).await,
    }
}
