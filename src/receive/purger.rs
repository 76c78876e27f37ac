use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{connection::ConnectionFactory, db::queue::TableQueue, error::Error};

/// Removes expired messages in bounded batches so a large backlog never holds the write lock for
/// long.
pub struct ExpiredMessagesPurger {
    queue: Arc<TableQueue>,
    connections: ConnectionFactory,
    batch_size: u32,
}

impl ExpiredMessagesPurger {
    pub fn new(queue: Arc<TableQueue>, connections: ConnectionFactory, batch_size: u32) -> Self {
        Self {
            queue,
            connections,
            batch_size: batch_size.max(1),
        }
    }

    /// Purges batch after batch until one comes back short. Returns the total removed.
    pub async fn purge(&self, cancel: &CancellationToken) -> Result<u64, Error> {
        let mut total = 0;

        loop {
            let mut conn = self.connections.open_connection(cancel).await?;
            let purged = self
                .queue
                .purge_expired_batch(&mut conn, self.batch_size)
                .await?;
            total += purged;

            tracing::debug!(queue = %self.queue.address(), purged, "Purged batch of expired messages");

            if purged < self.batch_size as u64 || cancel.is_cancelled() {
                break;
            }
        }

        if total > 0 {
            tracing::info!(queue = %self.queue.address(), total, "Purged expired messages");
        }

        Ok(total)
    }

    /// Purges every `interval` until cancelled. Failures are logged and retried on the next tick.
    pub async fn run_periodically(self, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.purge(&cancel).await {
                Ok(_) | Err(Error::Cancelled) => {}
                Err(e) => tracing::warn!(
                    queue = %self.queue.address(),
                    "Purging expired messages failed: {e}"
                ),
            }
        }
    }
}
