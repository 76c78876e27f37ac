use futures_util::future::BoxFuture;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    address::QueueAddress, connection::ConnectionFactory, error::Error,
    pubsub::SubscriptionStore,
};

/// Subscriptions read and written straight from the routing table.
pub struct SubscriptionTable {
    connections: ConnectionFactory,
    address: QueueAddress,
    cancel: CancellationToken,
}

impl SubscriptionTable {
    pub fn new(
        connections: ConnectionFactory,
        address: QueueAddress,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connections,
            address,
            cancel,
        }
    }

    pub fn address(&self) -> &QueueAddress {
        &self.address
    }

    async fn subscribers(&self, topic: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.connections.open_connection(&self.cancel).await?;

        let sql = format!(
            "SELECT DISTINCT queue_address FROM {} WHERE topic = $1 ORDER BY queue_address",
            self.address.qualified_table_name()
        );
        let mut stream = sqlx::query_scalar::<_, String>(&sql).bind(topic).fetch(&mut *conn);

        let mut subscribers = Vec::new();

        while let Some(address) = stream.next().await.transpose()? {
            subscribers.push(address);
        }

        Ok(subscribers)
    }

    async fn upsert(&self, endpoint: &str, queue_address: &str, topic: &str) -> Result<(), Error> {
        let mut conn = self.connections.open_connection(&self.cancel).await?;

        sqlx::query(&format!(
            "
            INSERT INTO {} (queue_address, endpoint, topic) VALUES ($1, $2, $3)
            ON CONFLICT (endpoint, topic) DO UPDATE SET queue_address = excluded.queue_address
            ",
            self.address.qualified_table_name()
        ))
        .bind(queue_address)
        .bind(endpoint)
        .bind(topic)
        .execute(&mut *conn)
        .await?;

        tracing::debug!(endpoint, topic, queue_address, "Subscribed");

        Ok(())
    }

    async fn delete(&self, endpoint: &str, topic: &str) -> Result<(), Error> {
        let mut conn = self.connections.open_connection(&self.cancel).await?;

        sqlx::query(&format!(
            "DELETE FROM {} WHERE endpoint = $1 AND topic = $2",
            self.address.qualified_table_name()
        ))
        .bind(endpoint)
        .bind(topic)
        .execute(&mut *conn)
        .await?;

        tracing::debug!(endpoint, topic, "Unsubscribed");

        Ok(())
    }
}

impl SubscriptionStore for SubscriptionTable {
    fn get_subscribers<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<Vec<String>, Error>> {
        Box::pin(self.subscribers(topic))
    }

    fn subscribe<'a>(
        &'a self,
        endpoint: &'a str,
        queue_address: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(self.upsert(endpoint, queue_address, topic))
    }

    fn unsubscribe<'a>(
        &'a self,
        endpoint: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(self.delete(endpoint, topic))
    }
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::db::creator::QueueCreator;

    async fn setup() -> SubscriptionTable {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let address = QueueAddress::new("SubscriptionRouting", "main");

        QueueCreator::new(db.clone())
            .create_subscription_table_if_necessary(&address)
            .await
            .unwrap();

        SubscriptionTable::new(
            ConnectionFactory::from_pool(db),
            address,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn subscribe_is_unique_per_endpoint_and_topic() {
        let table = setup().await;

        table.subscribe("billing", "billing@main", "OrderPlaced").await.unwrap();
        table.subscribe("billing", "billing-v2@main", "OrderPlaced").await.unwrap();
        table.subscribe("shipping", "shipping@main", "OrderPlaced").await.unwrap();
        table.subscribe("shipping", "shipping@main", "OrderCancelled").await.unwrap();

        assert_eq!(
            table.get_subscribers("OrderPlaced").await.unwrap(),
            vec!["billing-v2@main".to_owned(), "shipping@main".to_owned()]
        );

        table.unsubscribe("billing", "OrderPlaced").await.unwrap();
        assert_eq!(
            table.get_subscribers("OrderPlaced").await.unwrap(),
            vec!["shipping@main".to_owned()]
        );
        assert!(table.get_subscribers("Unknown").await.unwrap().is_empty());
    }
}
