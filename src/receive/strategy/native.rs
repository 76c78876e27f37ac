use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{error::Error, transaction::TransportTransaction};

use super::{Outcome, ProcessStrategy, Processing};

/// One local transaction covers the receive and every default-consistency send.
pub struct SendsAtomicWithReceiveStrategy {
    processing: Arc<Processing>,
}

impl SendsAtomicWithReceiveStrategy {
    pub fn new(processing: Arc<Processing>) -> Self {
        Self { processing }
    }

    async fn process(&self, cancel: &CancellationToken) -> Result<Outcome, Error> {
        let p = &self.processing;
        let mut tx = match p.connections.begin(cancel).await {
            // another receive holds the write lock
            Err(Error::Busy) => return Ok(Outcome::NoMessage),
            tx => tx?,
        };

        let Some(message) = p.queue.try_receive(&mut tx).await? else {
            tx.rollback().await?;
            return Ok(Outcome::NoMessage);
        };

        if message.is_expired(Utc::now()) {
            tx.commit().await?;
            return Ok(p.discard_expired(&message));
        }

        if let Some(info) = p.failures.exhausted(&message.id) {
            p.move_to_error_queue(&message, &info.last_error, info.last_seen, info.count, &mut tx)
                .await?;
            tx.commit().await?;
            p.failures.clear(&message.id);
            return Ok(Outcome::DeadLettered);
        }

        let mut ctx = p.context(&message, TransportTransaction::Native(&mut tx));
        let result = p.invoke(&mut ctx).await;
        let deferred = ctx.into_deferred();

        match result {
            Ok(()) => {
                tx.commit().await?;
                p.failures.clear(&message.id);
                p.dispatch_deferred(&message, deferred).await?;
                Ok(Outcome::Processed)
            }
            Err(e) => {
                tx.rollback().await?;
                let info = p.failures.record_failure(&message.id, &e);
                tracing::warn!(
                    queue = %p.queue.address(),
                    message_id = %message.id,
                    failures = info.count,
                    "Handler failed, the message will be retried: {e:#}"
                );
                p.dispatch_deferred(&message, deferred).await?;
                Ok(Outcome::Failed(e))
            }
        }
    }
}

impl ProcessStrategy for SendsAtomicWithReceiveStrategy {
    fn process_message<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Outcome, Error>> {
        Box::pin(self.process(cancel))
    }
}
