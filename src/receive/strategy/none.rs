use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{error::Error, transaction::TransportTransaction};

use super::{Outcome, ProcessStrategy, Processing};

/// Receive and sends are separate autocommit statements.
///
/// A failed message is put back at the end of the input queue until it has failed
/// `max_failures` times, then it goes to the error queue.
pub struct NoTransactionStrategy {
    processing: Arc<Processing>,
}

impl NoTransactionStrategy {
    pub fn new(processing: Arc<Processing>) -> Self {
        Self { processing }
    }

    async fn process(&self, cancel: &CancellationToken) -> Result<Outcome, Error> {
        let p = &self.processing;
        let mut conn = p.connections.open_connection(cancel).await?;

        let Some(message) = p.queue.try_receive(&mut conn).await? else {
            return Ok(Outcome::NoMessage);
        };

        if message.is_expired(Utc::now()) {
            return Ok(p.discard_expired(&message));
        }

        let mut ctx = p.context(&message, TransportTransaction::None);
        let e = match p.invoke(&mut ctx).await {
            Ok(()) => {
                p.failures.clear(&message.id);
                return Ok(Outcome::Processed);
            }
            Err(e) => e,
        };

        let info = p.failures.record_failure(&message.id, &e);

        if p.failures.is_exhausted(&info) {
            p.move_to_error_queue(&message, &info.last_error, info.last_seen, info.count, &mut conn)
                .await?;
            p.failures.clear(&message.id);
            return Ok(Outcome::DeadLettered);
        }

        tracing::warn!(
            queue = %p.queue.address(),
            message_id = %message.id,
            failures = info.count,
            "Handler failed, returning the message to the queue: {e:#}"
        );

        let returned = p
            .queue
            .send(&message.to_outgoing(), message.expires, &mut conn)
            .await;

        if let Err(send_error) = returned {
            // the row is already gone, the error queue is the only place left for it
            tracing::error!(
                queue = %p.queue.address(),
                message_id = %message.id,
                "Could not return the message to the queue: {send_error}"
            );
            p.move_to_error_queue(&message, &info.last_error, info.last_seen, info.count, &mut conn)
                .await?;
            p.failures.clear(&message.id);
            return Ok(Outcome::DeadLettered);
        }

        p.queue.notify_arrival();

        Ok(Outcome::Failed(e))
    }
}

impl ProcessStrategy for NoTransactionStrategy {
    fn process_message<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Outcome, Error>> {
        Box::pin(self.process(cancel))
    }
}
