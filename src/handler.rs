use futures_util::future::BoxFuture;

use crate::{
    address::QueueAddress,
    dispatch::{DispatchConsistency, MessageDispatcher, TransportOperation},
    error::Error,
    message::IncomingMessage,
    transaction::{Enlistment, TransportTransaction},
};

/// Business logic invoked for every received message.
///
/// Returning an error (or panicking) counts as a processing failure; what happens next depends on
/// the receiver's transaction mode.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, ctx: &'a mut MessageContext<'_, '_>) -> BoxFuture<'a, eyre::Result<()>>;
}

/// What a handler sees of the message being processed.
pub struct MessageContext<'a, 't> {
    message: &'a IncomingMessage,
    receive_address: &'a QueueAddress,
    dispatcher: &'a MessageDispatcher,
    transaction: TransportTransaction<'t>,
    deferred: Vec<TransportOperation>,
}

impl<'a, 't> MessageContext<'a, 't> {
    pub(crate) fn new(
        message: &'a IncomingMessage,
        receive_address: &'a QueueAddress,
        dispatcher: &'a MessageDispatcher,
        transaction: TransportTransaction<'t>,
    ) -> Self {
        Self {
            message,
            receive_address,
            dispatcher,
            transaction,
            deferred: Vec::new(),
        }
    }

    pub fn message(&self) -> &IncomingMessage {
        self.message
    }

    pub fn receive_address(&self) -> &QueueAddress {
        self.receive_address
    }

    /// Dispatches outgoing operations. Default-consistency operations commit or roll back
    /// together with the receive, when the transaction mode has one.
    ///
    /// Isolated operations are written in a transaction of their own once the receive
    /// transaction has ended, whatever its outcome. Without a receive transaction they are
    /// written immediately.
    pub async fn dispatch(&mut self, operations: Vec<TransportOperation>) -> Result<(), Error> {
        if self.transaction.connection().is_none() {
            return self
                .dispatcher
                .dispatch(operations, &mut self.transaction)
                .await;
        }

        let (isolated, joined): (Vec<_>, Vec<_>) = operations
            .into_iter()
            .partition(|op| op.consistency == DispatchConsistency::Isolated);
        self.deferred.extend(isolated);

        self.dispatcher
            .dispatch(joined, &mut self.transaction)
            .await
    }

    /// Enlists an additional resource in the receive transaction. Only possible in the
    /// `transaction_scope` mode with multi-resource enlistment enabled.
    pub fn enlist(&mut self, enlistment: Box<dyn Enlistment>) -> Result<(), Error> {
        self.transaction.enlist(enlistment)
    }

    /// Isolated operations waiting for the receive transaction to end.
    pub(crate) fn into_deferred(self) -> Vec<TransportOperation> {
        self.deferred
    }
}
