//! Publish/subscribe routing.
//!
//! Subscriptions map a topic (event type) to the queue addresses of the endpoints that want it.
//! Publishing resolves the topic through a [`SubscriptionStore`] and fans the message out as one
//! unicast send per subscriber.

use futures_util::future::BoxFuture;

use crate::error::Error;

pub mod cache;
pub mod converter;

pub use cache::CachedSubscriptionStore;
pub use converter::MulticastToUnicastConverter;

pub trait SubscriptionStore: Send + Sync {
    /// Queue addresses subscribed to `topic`, without duplicates.
    fn get_subscribers<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<Vec<String>, Error>>;

    /// Subscribes `endpoint`, receiving at `queue_address`, to `topic`. Subscribing again
    /// replaces the address.
    fn subscribe<'a>(
        &'a self,
        endpoint: &'a str,
        queue_address: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>>;

    fn unsubscribe<'a>(&'a self, endpoint: &'a str, topic: &'a str)
        -> BoxFuture<'a, Result<(), Error>>;
}

impl<S: SubscriptionStore + ?Sized> SubscriptionStore for std::sync::Arc<S> {
    fn get_subscribers<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<Vec<String>, Error>> {
        (**self).get_subscribers(topic)
    }

    fn subscribe<'a>(
        &'a self,
        endpoint: &'a str,
        queue_address: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        (**self).subscribe(endpoint, queue_address, topic)
    }

    fn unsubscribe<'a>(
        &'a self,
        endpoint: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        (**self).unsubscribe(endpoint, topic)
    }
}
