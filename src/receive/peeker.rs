use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{connection::ConnectionFactory, db::queue::TableQueue, error::Error};

use super::circuit_breaker::CircuitBreaker;

#[derive(Clone, Copy, Debug)]
pub struct PeekSettings {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_records: u32,
}

/// Decides when a receive loop should try to receive.
///
/// An empty queue is re-checked with a geometrically growing delay. Finding messages, or a local
/// send to the queue, brings the delay back to the minimum.
pub struct QueuePeeker {
    settings: PeekSettings,
    delay: Duration,
    breaker: CircuitBreaker,
}

impl QueuePeeker {
    pub fn new(settings: PeekSettings, breaker: CircuitBreaker) -> Self {
        Self {
            delay: settings.min_delay,
            settings,
            breaker,
        }
    }

    pub fn reset(&mut self) {
        self.delay = self.settings.min_delay;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = self
            .delay
            .saturating_mul(2)
            .min(self.settings.max_delay)
            .max(self.settings.min_delay);
        delay
    }

    /// Waits until `queue` holds at least one message and returns the approximate depth, which
    /// the caller uses as its budget of receive attempts. Only returns an error when cancelled.
    pub async fn peek(
        &mut self,
        queue: &TableQueue,
        connections: &ConnectionFactory,
        cancel: &CancellationToken,
    ) -> Result<u32, Error> {
        loop {
            let depth = match self.try_peek(queue, connections, cancel).await {
                Ok(depth) => {
                    self.breaker.success();
                    depth
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    self.breaker.failure(&e).await;
                    continue;
                }
            };

            if depth > 0 {
                self.reset();
                return Ok(depth);
            }

            let delay = self.next_delay();
            tracing::trace!(
                queue = %queue.address(),
                delay_ms = delay.as_millis() as u64,
                "Queue is empty, waiting before peeking again"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = queue.arrival() => self.reset(),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn try_peek(
        &self,
        queue: &TableQueue,
        connections: &ConnectionFactory,
        cancel: &CancellationToken,
    ) -> Result<u32, Error> {
        let mut conn = connections.open_connection(cancel).await?;
        queue.try_peek(&mut conn, self.settings.max_records).await
    }
}
