use std::{collections::HashSet, sync::Arc};

use crate::{
    dispatch::{Destination, TransportOperation, UnicastOperation},
    error::Error,
};

use super::SubscriptionStore;

/// Expands published messages into one send per subscriber.
#[derive(Clone)]
pub struct MulticastToUnicastConverter {
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl MulticastToUnicastConverter {
    pub fn new(subscriptions: Arc<dyn SubscriptionStore>) -> Self {
        Self { subscriptions }
    }

    /// A unicast operation passes through unchanged. A multicast operation becomes one unicast
    /// operation per distinct subscriber, or none at all when nobody subscribed.
    pub async fn convert(&self, operation: TransportOperation) -> Result<Vec<UnicastOperation>, Error> {
        let TransportOperation {
            message,
            destination,
            properties,
            consistency,
        } = operation;

        let topic = match destination {
            Destination::Unicast(address) => {
                return Ok(vec![UnicastOperation {
                    message,
                    destination: address,
                    properties,
                    consistency,
                }]);
            }
            Destination::Multicast(topic) => topic,
        };

        let subscribers = self.subscriptions.get_subscribers(&topic).await?;

        let mut seen = HashSet::with_capacity(subscribers.len());
        let operations: Vec<_> = subscribers
            .into_iter()
            .filter(|address| seen.insert(address.clone()))
            .map(|address| UnicastOperation {
                message: message.clone(),
                destination: address,
                properties: properties.clone(),
                consistency,
            })
            .collect();

        if operations.is_empty() {
            tracing::debug!(topic, message_id = %message.id, "No subscribers for published message");
        }

        Ok(operations)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::future::BoxFuture;

    use super::*;
    use crate::{dispatch::DispatchConsistency, message::OutgoingMessage};

    struct Fixed(Vec<String>);

    impl SubscriptionStore for Fixed {
        fn get_subscribers<'a>(
            &'a self,
            _topic: &'a str,
        ) -> BoxFuture<'a, Result<Vec<String>, Error>> {
            Box::pin(async move { Ok(self.0.clone()) })
        }

        fn subscribe<'a>(
            &'a self,
            _endpoint: &'a str,
            _queue_address: &'a str,
            _topic: &'a str,
        ) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn unsubscribe<'a>(
            &'a self,
            _endpoint: &'a str,
            _topic: &'a str,
        ) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn converter(subscribers: &[&str]) -> MulticastToUnicastConverter {
        MulticastToUnicastConverter::new(Arc::new(Fixed(
            subscribers.iter().map(|s| s.to_string()).collect(),
        )))
    }

    #[tokio::test]
    async fn fans_out_to_distinct_subscribers() {
        let converter = converter(&["billing", "shipping", "billing"]);
        let op = TransportOperation::publish(OutgoingMessage::with_body("x"), "OrderPlaced");

        let ops = converter.convert(op).await.unwrap();
        let destinations: Vec<_> = ops.iter().map(|op| op.destination.as_str()).collect();

        assert_eq!(destinations, vec!["billing", "shipping"]);
        assert!(ops.iter().all(|op| op.consistency == DispatchConsistency::Default));
    }

    #[tokio::test]
    async fn no_subscribers_means_no_sends() {
        let converter = converter(&[]);
        let op = TransportOperation::publish(OutgoingMessage::with_body("x"), "OrderPlaced");

        assert!(converter.convert(op).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unicast_passes_through() {
        let converter = converter(&["billing"]);
        let op = TransportOperation::send(OutgoingMessage::with_body("x"), "orders");

        let ops = converter.convert(op).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].destination, "orders");
    }
}
