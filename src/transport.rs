use std::{collections::HashMap, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    address::{AddressTranslator, QueueAddress},
    config::Config,
    connection::ConnectionFactory,
    db::{
        creator::QueueCreator, delayed::DelayedMessageTable, queue::TableQueueCache,
        subscription::SubscriptionTable,
    },
    delayed::{DueDelayedMessageProcessor, DueMessageSettings},
    dispatch::{MessageDispatcher, TransportOperation},
    error::Error,
    pubsub::{CachedSubscriptionStore, MulticastToUnicastConverter, SubscriptionStore},
    receive::{MessageReceiver, ReceiveSettings},
    transaction::{probe_enlistment, TransactionMode, TransportTransaction},
};

/// A connected transport: receivers, dispatcher, subscriptions and the delayed message
/// processor, all sharing one connection pool.
pub struct Transport {
    endpoint_name: String,
    local_address: String,
    connections: ConnectionFactory,
    dispatcher: MessageDispatcher,
    subscriptions: Arc<dyn SubscriptionStore>,
    receivers: HashMap<String, Arc<MessageReceiver>>,
    delayed: Option<DueDelayedMessageProcessor>,
    transaction_mode: TransactionMode,
    cancel: CancellationToken,
}

#[bon::bon]
impl Transport {
    #[builder(finish_fn = connect)]
    pub async fn new(
        config: Config,
        #[builder(into)] endpoint_name: Option<String>,
        #[builder(default)] receivers: Vec<ReceiveSettings>,
        #[builder(default)] sending_addresses: Vec<String>,
    ) -> Result<Self, Error> {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let endpoint_name = endpoint_name.unwrap_or_else(|| config.endpoint_name().to_owned());

        let connections = ConnectionFactory::connect(&config).await?;
        connections.verify_access(&cancel).await?;

        let translator = Arc::new(AddressTranslator::new(config.default_schema()));

        let mut queue_addresses: Vec<QueueAddress> = Vec::new();
        let mut receive_addresses = Vec::with_capacity(receivers.len());
        for settings in &receivers {
            let input = translator.register(&settings.receive_address)?;
            let error = translator.register(
                settings
                    .error_queue
                    .as_deref()
                    .unwrap_or(config.error_queue()),
            )?;
            queue_addresses.extend([input.clone(), error.clone()]);
            receive_addresses.push((input, error));
        }
        queue_addresses.push(translator.register(config.error_queue())?);
        for address in &sending_addresses {
            queue_addresses.push(translator.register(address)?);
        }

        let delayed_address = config
            .delayed_delivery_enabled()
            .then(|| {
                translator.register(
                    &translator.generate(&endpoint_name, Some(config.delayed_table_suffix())),
                )
            })
            .transpose()?;
        let subscription_address = translator.register(config.subscription_table())?;

        let transaction_mode =
            Self::effective_transaction_mode(&config, &connections, &cancel).await?;

        let creator = QueueCreator::new(connections.pool().clone());
        if config.setup_infrastructure() {
            for address in &queue_addresses {
                creator.create_queue_if_necessary(address).await?;
            }
            if let Some(address) = &delayed_address {
                creator.create_delayed_table_if_necessary(address).await?;
            }
            creator
                .create_subscription_table_if_necessary(&subscription_address)
                .await?;
        } else {
            let required = queue_addresses
                .iter()
                .chain(delayed_address.iter())
                .chain([&subscription_address]);
            for address in required {
                if !creator.table_exists(address).await? {
                    return Err(Error::queue_not_found(address.to_string()));
                }
            }
        }

        let table: Arc<dyn SubscriptionStore> = {
            let table =
                SubscriptionTable::new(connections.clone(), subscription_address, cancel.clone());
            if config.subscription_cache_enabled() {
                Arc::new(CachedSubscriptionStore::new(
                    table,
                    config.subscription_cache_ttl(),
                ))
            } else {
                Arc::new(table)
            }
        };

        let queues = Arc::new(TableQueueCache::new());
        let delayed_table =
            delayed_address.map(|address| Arc::new(DelayedMessageTable::new(address)));

        let dispatcher = MessageDispatcher::new(
            connections.clone(),
            translator.clone(),
            queues.clone(),
            MulticastToUnicastConverter::new(table.clone()),
            delayed_table.clone(),
            cancel.clone(),
        );

        let local_address = receivers
            .first()
            .map(|settings| settings.receive_address.clone())
            .unwrap_or_else(|| endpoint_name.clone());

        let receivers: HashMap<_, _> = receivers
            .into_iter()
            .zip(receive_addresses)
            .map(|(settings, (input, error))| {
                let receiver = MessageReceiver::new(
                    settings.id.clone(),
                    queues.get(&input),
                    queues.get(&error),
                    connections.clone(),
                    dispatcher.clone(),
                    config.clone(),
                    transaction_mode,
                    config.enlistment(),
                    settings
                        .purge_on_startup
                        .unwrap_or(config.purge_on_startup()),
                );
                (settings.id, Arc::new(receiver))
            })
            .collect();

        let delayed = delayed_table.map(|table| {
            let processor = DueDelayedMessageProcessor::new(
                table,
                connections.clone(),
                queues.clone(),
                translator.clone(),
                DueMessageSettings {
                    batch_size: config.delayed_batch_size(),
                    poll_interval: config.delayed_poll_interval(),
                    retry_delay: config.delayed_retry_delay(),
                    circuit_breaker_trigger: config.circuit_breaker_trigger(),
                },
            );
            processor.start();
            processor
        });

        tracing::info!(
            endpoint = %endpoint_name,
            mode = %transaction_mode,
            delayed_delivery = delayed.is_some(),
            "Transport connected"
        );

        Ok(Self {
            endpoint_name,
            local_address,
            connections,
            dispatcher,
            subscriptions: table,
            receivers,
            delayed,
            transaction_mode,
            cancel,
        })
    }
}

impl Transport {
    /// The configured mode, unless the store cannot carry a multi-resource scope, in which case
    /// the transport falls back to `sends_atomic_with_receive`.
    async fn effective_transaction_mode(
        config: &Config,
        connections: &ConnectionFactory,
        cancel: &CancellationToken,
    ) -> Result<TransactionMode, Error> {
        let mode = config.transaction_mode();
        if mode != TransactionMode::TransactionScope {
            return Ok(mode);
        }

        match probe_enlistment(connections, config.enlistment(), cancel).await {
            Ok(()) => Ok(mode),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                tracing::warn!(
                    "Multi-resource transactions are not available, falling back to {}: {e}",
                    TransactionMode::SendsAtomicWithReceive
                );
                Ok(TransactionMode::SendsAtomicWithReceive)
            }
        }
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    pub fn transaction_mode(&self) -> TransactionMode {
        self.transaction_mode
    }

    pub fn connections(&self) -> &ConnectionFactory {
        &self.connections
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }

    pub fn receiver(&self, id: &str) -> Option<&Arc<MessageReceiver>> {
        self.receivers.get(id)
    }

    pub fn delayed_processor(&self) -> Option<&DueDelayedMessageProcessor> {
        self.delayed.as_ref()
    }

    /// Dispatches operations outside of any receive transaction.
    pub async fn dispatch(&self, operations: Vec<TransportOperation>) -> Result<(), Error> {
        self.dispatcher
            .dispatch(operations, &mut TransportTransaction::None)
            .await
    }

    /// Subscribes this endpoint to `topic`.
    pub async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        self.subscriptions
            .subscribe(&self.endpoint_name, &self.local_address, topic)
            .await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        self.subscriptions
            .unsubscribe(&self.endpoint_name, topic)
            .await
    }

    /// Stops every receiver, then the delayed message processor, then closes the pool.
    pub async fn shutdown(&self) {
        for receiver in self.receivers.values() {
            receiver.stop().await;
        }

        if let Some(delayed) = &self.delayed {
            delayed.stop().await;
        }

        self.cancel.cancel();
        self.connections.close().await;

        tracing::info!(endpoint = %self.endpoint_name, "Transport shut down");
    }
}
