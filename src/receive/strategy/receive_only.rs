use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{error::Error, transaction::TransportTransaction};

use super::{Outcome, ProcessStrategy, Processing};

/// The receive commits before the handler runs and sends are independent of it.
///
/// There is nothing to roll back into, so a failed message goes straight to the error queue
/// instead of being retried.
pub struct ReceiveOnlyStrategy {
    processing: Arc<Processing>,
}

impl ReceiveOnlyStrategy {
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
        match p.invoke(&mut ctx).await {
            Ok(()) => Ok(Outcome::Processed),
            Err(e) => {
                p.move_to_error_queue(&message, &format!("{e:#}"), Utc::now(), 1, &mut conn)
                    .await?;
                Ok(Outcome::DeadLettered)
            }
        }
    }
}

impl ProcessStrategy for ReceiveOnlyStrategy {
    fn process_message<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Outcome, Error>> {
        Box::pin(self.process(cancel))
    }
}
