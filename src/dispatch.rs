//! Outgoing operations: sends, publishes and delayed deliveries.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tokio_util::sync::CancellationToken;

use crate::{
    address::{AddressTranslator, QueueAddress},
    connection::ConnectionFactory,
    db::{delayed::DelayedMessageTable, queue::TableQueueCache},
    error::Error,
    message::{headers, OutgoingMessage},
    pubsub::MulticastToUnicastConverter,
    transaction::TransportTransaction,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// A logical queue address.
    Unicast(String),
    /// A topic, resolved to its subscribers at dispatch time.
    Multicast(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchProperties {
    pub delay: Option<Duration>,
    pub do_not_deliver_before: Option<DateTime<Utc>>,
    /// Time to be received. The message is discarded if it is still queued after this long.
    pub discard_if_not_received_before: Option<Duration>,
}

impl DispatchProperties {
    fn is_delayed(&self) -> bool {
        self.delay.is_some() || self.do_not_deliver_before.is_some()
    }

    /// Due time for a delayed operation. `do_not_deliver_before` wins over `delay` when both are
    /// set.
    fn due(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
        if let Some(at) = self.do_not_deliver_before {
            return Ok(Some(at));
        }

        self.delay
            .map(|delay| to_chrono(delay).map(|delay| now + delay))
            .transpose()
    }

    fn expires(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
        self.discard_if_not_received_before
            .map(|ttbr| to_chrono(ttbr).map(|ttbr| now + ttbr))
            .transpose()
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, Error> {
    chrono::Duration::from_std(duration)
        .map_err(|_| Error::invalid_parameter(format!("duration {duration:?} is out of range")))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchConsistency {
    /// Joins the receive transaction when dispatched from a handler.
    #[default]
    Default,
    /// Always committed on its own, independent of any receive transaction.
    Isolated,
}

#[derive(Clone, Debug)]
pub struct TransportOperation {
    pub message: OutgoingMessage,
    pub destination: Destination,
    pub properties: DispatchProperties,
    pub consistency: DispatchConsistency,
}

impl TransportOperation {
    pub fn send(message: OutgoingMessage, address: impl Into<String>) -> Self {
        Self {
            message,
            destination: Destination::Unicast(address.into()),
            properties: DispatchProperties::default(),
            consistency: DispatchConsistency::Default,
        }
    }

    pub fn publish(message: OutgoingMessage, topic: impl Into<String>) -> Self {
        Self {
            message,
            destination: Destination::Multicast(topic.into()),
            properties: DispatchProperties::default(),
            consistency: DispatchConsistency::Default,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.properties.delay = Some(delay);
        self
    }

    pub fn do_not_deliver_before(mut self, at: DateTime<Utc>) -> Self {
        self.properties.do_not_deliver_before = Some(at);
        self
    }

    pub fn discard_if_not_received_before(mut self, ttbr: Duration) -> Self {
        self.properties.discard_if_not_received_before = Some(ttbr);
        self
    }

    pub fn isolated(mut self) -> Self {
        self.consistency = DispatchConsistency::Isolated;
        self
    }
}

/// A single-destination operation, as produced by the multicast converter.
#[derive(Clone, Debug)]
pub struct UnicastOperation {
    pub message: OutgoingMessage,
    pub destination: String,
    pub properties: DispatchProperties,
    pub consistency: DispatchConsistency,
}

/// Where a successfully written operation ended up.
enum Written {
    Queue(QueueAddress),
    Delayed,
}

#[derive(Clone)]
pub struct MessageDispatcher {
    connections: ConnectionFactory,
    translator: Arc<AddressTranslator>,
    queues: Arc<TableQueueCache>,
    converter: MulticastToUnicastConverter,
    delayed: Option<Arc<DelayedMessageTable>>,
    cancel: CancellationToken,
}

impl MessageDispatcher {
    pub fn new(
        connections: ConnectionFactory,
        translator: Arc<AddressTranslator>,
        queues: Arc<TableQueueCache>,
        converter: MulticastToUnicastConverter,
        delayed: Option<Arc<DelayedMessageTable>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connections,
            translator,
            queues,
            converter,
            delayed,
            cancel,
        }
    }

    /// Writes `operations`.
    ///
    /// Operations with [`DispatchConsistency::Default`] join `transaction` when it carries a
    /// connection; otherwise they are committed together in a transaction of their own.
    ///
    /// Isolated operations need a transaction of their own, which cannot be opened while
    /// `transaction` holds the write lock. Passing them together with an open transaction is an
    /// error; a [`crate::handler::MessageContext`] defers them until the receive has finished.
    pub async fn dispatch(
        &self,
        operations: Vec<TransportOperation>,
        transaction: &mut TransportTransaction<'_>,
    ) -> Result<(), Error> {
        let mut default = Vec::new();
        let mut isolated = Vec::new();

        for operation in operations {
            for unicast in self.converter.convert(operation).await? {
                match unicast.consistency {
                    DispatchConsistency::Default => default.push(unicast),
                    DispatchConsistency::Isolated => isolated.push(unicast),
                }
            }
        }

        let mut written = Vec::with_capacity(default.len() + isolated.len());

        match transaction.connection() {
            Some(_) if !isolated.is_empty() => {
                return Err(Error::invalid_parameter(
                    "isolated operations cannot be written inside an open receive transaction",
                ));
            }
            Some(conn) => {
                for op in &default {
                    written.push(self.write(op, conn).await?);
                }
            }
            None => isolated.append(&mut default),
        }

        if !isolated.is_empty() {
            let mut tx = self.connections.begin(&self.cancel).await?;
            for op in &isolated {
                written.push(self.write(op, &mut tx).await?);
            }
            tx.commit().await?;
        }

        for target in written {
            match target {
                Written::Queue(address) => self.queues.get(&address).notify_arrival(),
                Written::Delayed => {
                    if let Some(delayed) = &self.delayed {
                        delayed.notify_stored();
                    }
                }
            }
        }

        Ok(())
    }

    async fn write(
        &self,
        op: &UnicastOperation,
        conn: &mut SqliteConnection,
    ) -> Result<Written, Error> {
        let now = Utc::now();
        let address = self.translator.parse(&op.destination)?;

        if op.properties.is_delayed() {
            if op.properties.discard_if_not_received_before.is_some() {
                return Err(Error::invalid_parameter(
                    "delayed delivery cannot be combined with discard_if_not_received_before",
                ));
            }

            let Some(delayed) = &self.delayed else {
                return Err(Error::DelayedDeliveryDisabled);
            };

            if let Some(due) = op.properties.due(now)?.filter(|due| *due > now) {
                let message = op
                    .message
                    .clone()
                    .with_header(headers::DELIVER_AT, due.to_rfc3339());
                delayed.store(&message, due, &address, conn).await?;

                tracing::debug!(
                    message_id = %op.message.id,
                    destination = %address,
                    %due,
                    "Stored delayed message"
                );

                return Ok(Written::Delayed);
            }
        }

        let expires = op.properties.expires(now)?;
        self.queues
            .get(&address)
            .send(&op.message, expires, conn)
            .await?;

        tracing::trace!(message_id = %op.message.id, destination = %address, "Sent message");

        Ok(Written::Queue(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn do_not_deliver_before_wins_over_delay() {
        let now = Utc::now();
        let at = now + chrono::Duration::minutes(5);
        let props = DispatchProperties {
            delay: Some(Duration::from_secs(1)),
            do_not_deliver_before: Some(at),
            discard_if_not_received_before: None,
        };

        assert!(props.is_delayed());
        assert_eq!(props.due(now).unwrap(), Some(at));
    }

    #[test]
    fn expiry_is_relative_to_dispatch_time() {
        let now = Utc::now();
        let props = DispatchProperties {
            discard_if_not_received_before: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        assert!(!props.is_delayed());
        assert_eq!(
            props.expires(now).unwrap(),
            Some(now + chrono::Duration::seconds(30))
        );
        assert_eq!(DispatchProperties::default().expires(now).unwrap(), None);
    }

    #[test]
    fn builder_methods_set_properties() {
        let op = TransportOperation::send(OutgoingMessage::with_body("x"), "orders")
            .delay(Duration::from_secs(10))
            .isolated();

        assert_eq!(op.destination, Destination::Unicast("orders".to_owned()));
        assert_eq!(op.properties.delay, Some(Duration::from_secs(10)));
        assert_eq!(op.consistency, DispatchConsistency::Isolated);
    }
}
