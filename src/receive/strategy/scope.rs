use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{
    error::Error,
    transaction::{TransactionScope, TransportTransaction},
};

use super::{Outcome, ProcessStrategy, Processing};

/// Receive, sends and enlisted resources commit together. The handler must finish within the
/// transaction timeout.
pub struct TransactionScopeStrategy {
    processing: Arc<Processing>,
}

impl TransactionScopeStrategy {
    pub fn new(processing: Arc<Processing>) -> Self {
        Self { processing }
    }

    async fn process(&self, cancel: &CancellationToken) -> Result<Outcome, Error> {
        let p = &self.processing;
        let mut scope = match TransactionScope::begin(&p.connections, p.enlistment, cancel).await {
            // another receive holds the write lock
            Err(Error::Busy) => return Ok(Outcome::NoMessage),
            scope => scope?,
        };

        let Some(message) = p.queue.try_receive(scope.connection()).await? else {
            scope.rollback().await?;
            return Ok(Outcome::NoMessage);
        };

        if message.is_expired(Utc::now()) {
            scope.commit().await?;
            return Ok(p.discard_expired(&message));
        }

        if let Some(info) = p.failures.exhausted(&message.id) {
            p.move_to_error_queue(
                &message,
                &info.last_error,
                info.last_seen,
                info.count,
                scope.connection(),
            )
            .await?;
            scope.commit().await?;
            p.failures.clear(&message.id);
            return Ok(Outcome::DeadLettered);
        }

        let timeout = p.transaction_timeout;
        let mut ctx = p.context(&message, TransportTransaction::Scope(&mut scope));
        let result = tokio::time::timeout(timeout, p.invoke(&mut ctx))
            .await
            .unwrap_or_else(|_| Err(eyre::eyre!("transaction timed out after {timeout:?}")));
        let deferred = ctx.into_deferred();

        let result = match result {
            Ok(()) => match scope.commit().await {
                Ok(()) => Ok(()),
                // the store itself failed, let the circuit breaker see it
                Err(e @ Error::Sqlx { .. }) => {
                    p.dispatch_deferred(&message, deferred).await?;
                    return Err(e);
                }
                Err(e) => Err(eyre::Report::new(e)),
            },
            Err(e) => {
                scope.rollback().await?;
                Err(e)
            }
        };

        p.dispatch_deferred(&message, deferred).await?;

        match result {
            Ok(()) => {
                p.failures.clear(&message.id);
                Ok(Outcome::Processed)
            }
            Err(e) => {
                let info = p.failures.record_failure(&message.id, &e);
                tracing::warn!(
                    queue = %p.queue.address(),
                    message_id = %message.id,
                    failures = info.count,
                    "Handler failed, the message will be retried: {e:#}"
                );
                Ok(Outcome::Failed(e))
            }
        }
    }
}

impl ProcessStrategy for TransactionScopeStrategy {
    fn process_message<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Outcome, Error>> {
        Box::pin(self.process(cancel))
    }
}
