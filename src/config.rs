//! Environment-driven configuration.
//!
//! Every setting is read from a `TABLEMQ_`-prefixed environment variable and is optional; the
//! accessors below supply the defaults. Durations are expressed in milliseconds.

use std::time::Duration;

use serde::Deserialize;

use crate::transaction::{MultiResourceEnlistment, TransactionMode};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub default_schema: Option<String>,
    /// Additional databases attached to every connection, as `name:path` pairs.
    #[serde(default)]
    pub attach: Vec<String>,
    pub max_connections: Option<u32>,
    pub busy_timeout_ms: Option<u64>,

    pub endpoint_name: Option<String>,
    pub error_queue: Option<String>,
    pub setup_infrastructure: Option<bool>,

    pub transaction_mode: Option<TransactionMode>,
    pub transaction_timeout_ms: Option<u64>,
    pub enlistment: Option<MultiResourceEnlistment>,

    pub max_concurrency: Option<usize>,
    pub max_failures: Option<u32>,
    pub failure_info_capacity: Option<usize>,

    pub peek_delay_ms: Option<u64>,
    pub max_peek_delay_ms: Option<u64>,
    pub max_records_to_peek: Option<u32>,
    pub circuit_breaker_trigger_ms: Option<u64>,

    pub purge_on_startup: Option<bool>,
    pub purge_expired_on_startup: Option<bool>,
    pub purge_batch_size: Option<u32>,
    pub expired_purge_interval_ms: Option<u64>,

    pub disable_delayed_delivery: Option<bool>,
    pub delayed_table_suffix: Option<String>,
    pub delayed_batch_size: Option<u32>,
    pub delayed_poll_interval_ms: Option<u64>,
    pub delayed_retry_delay_ms: Option<u64>,

    pub subscription_table: Option<String>,
    pub disable_subscription_cache: Option<bool>,
    pub subscription_cache_ttl_ms: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("TABLEMQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("tablemq.db")
    }

    pub fn default_schema(&self) -> &str {
        self.default_schema.as_deref().unwrap_or("main")
    }

    /// Parsed `attach` entries. Entries without a `:` separator are ignored.
    pub fn attached_databases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attach
            .iter()
            .filter_map(|entry| entry.split_once(':'))
            .map(|(name, path)| (name.trim(), path.trim()))
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(10)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms.unwrap_or(5_000))
    }

    pub fn endpoint_name(&self) -> &str {
        self.endpoint_name.as_deref().unwrap_or("tablemq")
    }

    pub fn error_queue(&self) -> &str {
        self.error_queue.as_deref().unwrap_or("error")
    }

    pub fn setup_infrastructure(&self) -> bool {
        self.setup_infrastructure.unwrap_or(true)
    }

    pub fn transaction_mode(&self) -> TransactionMode {
        self.transaction_mode
            .unwrap_or(TransactionMode::SendsAtomicWithReceive)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms.unwrap_or(60_000))
    }

    pub fn enlistment(&self) -> MultiResourceEnlistment {
        self.enlistment
            .unwrap_or(MultiResourceEnlistment::Unsupported)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(1).max(1)
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures.unwrap_or(5).max(1)
    }

    pub fn failure_info_capacity(&self) -> usize {
        self.failure_info_capacity.unwrap_or(10_000)
    }

    pub fn peek_delay(&self) -> Duration {
        Duration::from_millis(self.peek_delay_ms.unwrap_or(1_000))
    }

    pub fn max_peek_delay(&self) -> Duration {
        Duration::from_millis(self.max_peek_delay_ms.unwrap_or(10_000)).max(self.peek_delay())
    }

    pub fn max_records_to_peek(&self) -> u32 {
        self.max_records_to_peek.unwrap_or(1_000).max(1)
    }

    pub fn circuit_breaker_trigger(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_trigger_ms.unwrap_or(120_000))
    }

    pub fn purge_on_startup(&self) -> bool {
        self.purge_on_startup.unwrap_or(false)
    }

    pub fn purge_expired_on_startup(&self) -> bool {
        self.purge_expired_on_startup.unwrap_or(true)
    }

    pub fn purge_batch_size(&self) -> u32 {
        self.purge_batch_size.unwrap_or(10_000).max(1)
    }

    pub fn expired_purge_interval(&self) -> Option<Duration> {
        self.expired_purge_interval_ms.map(Duration::from_millis)
    }

    pub fn delayed_delivery_enabled(&self) -> bool {
        !self.disable_delayed_delivery.unwrap_or(false)
    }

    pub fn delayed_table_suffix(&self) -> &str {
        self.delayed_table_suffix.as_deref().unwrap_or("Delayed")
    }

    pub fn delayed_batch_size(&self) -> u32 {
        self.delayed_batch_size.unwrap_or(100).max(1)
    }

    pub fn delayed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.delayed_poll_interval_ms.unwrap_or(1_000))
    }

    /// How far a due delayed message that cannot be moved is pushed back.
    pub fn delayed_retry_delay(&self) -> Duration {
        Duration::from_millis(self.delayed_retry_delay_ms.unwrap_or(60_000))
    }

    pub fn subscription_table(&self) -> &str {
        self.subscription_table
            .as_deref()
            .unwrap_or("SubscriptionRouting")
    }

    pub fn subscription_cache_enabled(&self) -> bool {
        !self.disable_subscription_cache.unwrap_or(false)
    }

    pub fn subscription_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.subscription_cache_ttl_ms.unwrap_or(5_000))
    }
}
