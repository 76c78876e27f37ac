//! Reliable queueing and publish/subscribe on top of SQLite tables.
//!
//! Every queue is a table. Receiving a message deletes its row, inside whatever transaction the
//! configured [`transaction::TransactionMode`] asks for, and hands it to a
//! [`handler::MessageHandler`]. Delayed messages wait in a per-endpoint table until a background
//! processor moves them to their destination, and publishing fans a message out to the queues
//! subscribed to its topic.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod address;
pub mod config;
pub mod connection;
pub mod db;
pub mod delayed;
pub mod dispatch;
pub mod error;
pub mod failure_info;
pub mod handler;
pub mod message;
pub mod pubsub;
pub mod receive;
pub mod transaction;
pub mod transport;
pub mod utils;

pub use error::Error;
pub use transport::Transport;

/// Installs the global tracing subscriber. The filter is read from `TABLEMQ_LOG` and defaults to
/// `info`.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("TABLEMQ_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
