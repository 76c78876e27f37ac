use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use tokio::time::Instant;

use crate::error::Error;

use super::SubscriptionStore;

#[derive(Clone)]
struct CacheItem {
    stored: Instant,
    subscribers: Arc<Vec<String>>,
}

/// Read-through cache in front of another [`SubscriptionStore`].
///
/// A topic's entry is served until it is older than the TTL, then refreshed on the next read.
/// Subscribing or unsubscribing drops the entry for that topic in this process; other processes
/// see the change once their entry expires. Entries are always replaced whole, so concurrent
/// refreshes of the same topic simply let the last writer win.
pub struct CachedSubscriptionStore<S> {
    inner: S,
    ttl: Duration,
    entries: papaya::HashMap<String, CacheItem>,
}

impl<S: SubscriptionStore> CachedSubscriptionStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: papaya::HashMap::new(),
        }
    }

    fn fresh(&self, topic: &str) -> Option<Arc<Vec<String>>> {
        let entries = self.entries.pin();
        let subscribers = entries
            .get(topic)
            .filter(|item| item.stored.elapsed() < self.ttl)
            .map(|item| item.subscribers.clone());
        subscribers
    }

    async fn subscribers(&self, topic: &str) -> Result<Vec<String>, Error> {
        if let Some(subscribers) = self.fresh(topic) {
            return Ok(subscribers.as_ref().clone());
        }

        let subscribers = self.inner.get_subscribers(topic).await?;

        self.entries.pin().insert(
            topic.to_owned(),
            CacheItem {
                stored: Instant::now(),
                subscribers: Arc::new(subscribers.clone()),
            },
        );

        Ok(subscribers)
    }

    fn invalidate(&self, topic: &str) {
        self.entries.pin().remove(topic);
    }
}

impl<S: SubscriptionStore> SubscriptionStore for CachedSubscriptionStore<S> {
    fn get_subscribers<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<Vec<String>, Error>> {
        Box::pin(self.subscribers(topic))
    }

    fn subscribe<'a>(
        &'a self,
        endpoint: &'a str,
        queue_address: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.inner.subscribe(endpoint, queue_address, topic).await?;
            self.invalidate(topic);
            Ok(())
        })
    }

    fn unsubscribe<'a>(
        &'a self,
        endpoint: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.inner.unsubscribe(endpoint, topic).await?;
            self.invalidate(topic);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct CountingStore {
        reads: AtomicUsize,
        rows: Mutex<Vec<(String, String, String)>>,
    }

    impl SubscriptionStore for CountingStore {
        fn get_subscribers<'a>(
            &'a self,
            topic: &'a str,
        ) -> BoxFuture<'a, Result<Vec<String>, Error>> {
            Box::pin(async move {
                self.reads.fetch_add(1, Ordering::SeqCst);
                Ok(self
                    .rows
                    .lock()
                    .iter()
                    .filter(|(_, _, t)| t == topic)
                    .map(|(_, address, _)| address.clone())
                    .collect())
            })
        }

        fn subscribe<'a>(
            &'a self,
            endpoint: &'a str,
            queue_address: &'a str,
            topic: &'a str,
        ) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async move {
                self.rows.lock().push((
                    endpoint.to_owned(),
                    queue_address.to_owned(),
                    topic.to_owned(),
                ));
                Ok(())
            })
        }

        fn unsubscribe<'a>(
            &'a self,
            endpoint: &'a str,
            topic: &'a str,
        ) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async move {
                self.rows
                    .lock()
                    .retain(|(e, _, t)| !(e == endpoint && t == topic));
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serves_from_cache_until_ttl_expires() {
        let inner = Arc::new(CountingStore::default());
        let cache = CachedSubscriptionStore::new(inner.clone(), Duration::from_secs(5));
        inner
            .subscribe("billing", "billing@main", "OrderPlaced")
            .await
            .unwrap();

        assert_eq!(cache.get_subscribers("OrderPlaced").await.unwrap().len(), 1);
        assert_eq!(cache.get_subscribers("OrderPlaced").await.unwrap().len(), 1);
        assert_eq!(inner.reads.load(Ordering::SeqCst), 1);

        // a subscription made behind the cache's back is invisible until the entry expires
        inner
            .subscribe("shipping", "shipping@main", "OrderPlaced")
            .await
            .unwrap();
        assert_eq!(cache.get_subscribers("OrderPlaced").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.get_subscribers("OrderPlaced").await.unwrap().len(), 2);
        assert_eq!(inner.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribing_invalidates_the_topic() {
        let inner = Arc::new(CountingStore::default());
        let cache = CachedSubscriptionStore::new(inner.clone(), Duration::from_secs(60));

        assert!(cache.get_subscribers("OrderPlaced").await.unwrap().is_empty());
        assert!(cache.get_subscribers("OrderShipped").await.unwrap().is_empty());

        cache
            .subscribe("billing", "billing@main", "OrderPlaced")
            .await
            .unwrap();

        assert_eq!(
            cache.get_subscribers("OrderPlaced").await.unwrap(),
            vec!["billing@main".to_owned()]
        );
        // other topics stay cached
        assert!(cache.get_subscribers("OrderShipped").await.unwrap().is_empty());
        assert_eq!(inner.reads.load(Ordering::SeqCst), 3);

        cache.unsubscribe("billing", "OrderPlaced").await.unwrap();
        assert!(cache.get_subscribers("OrderPlaced").await.unwrap().is_empty());
    }
}
