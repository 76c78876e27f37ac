use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Duration,
};

use sqlx::{
    pool::PoolConnection,
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    Sqlite, SqliteConnection, SqlitePool, Transaction,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{config::Config, error::Error, utils::quote_identifier};

/// Hands out pooled connections and transactions. Every acquisition observes a cancellation
/// token so a stopping loop never waits on a saturated pool.
///
/// SQLite allows one writer at a time. Transactions from [`ConnectionFactory::begin`] take an
/// in-process write permit first, so tasks of this process queue on the runtime instead of
/// spinning in SQLite's busy handler while holding a pooled connection.
#[derive(Clone)]
pub struct ConnectionFactory {
    pool: SqlitePool,
    writer: Arc<Semaphore>,
    lock_wait: Duration,
}

impl ConnectionFactory {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .busy_timeout(config.busy_timeout())
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Incremental);

        let attachments: Arc<Vec<(String, String)>> = Arc::new(
            config
                .attached_databases()
                .map(|(name, path)| (name.to_owned(), path.to_owned()))
                .collect(),
        );

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections())
            .after_connect(move |conn, _meta| {
                let attachments = Arc::clone(&attachments);
                Box::pin(async move {
                    for (name, path) in attachments.iter() {
                        sqlx::query(&format!("ATTACH DATABASE $1 AS {}", quote_identifier(name)))
                            .bind(path)
                            .execute(&mut *conn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .connect_with(opts)
            .await?;

        Ok(Self::from_pool(pool).with_lock_wait(config.busy_timeout()))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::new(Semaphore::new(1)),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// How long [`ConnectionFactory::begin`] waits for the write permit before giving up with
    /// [`Error::Busy`].
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn open_connection(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PoolConnection<Sqlite>, Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            conn = self.pool.acquire() => Ok(conn?),
        }
    }

    /// Begins a write transaction. The write permit is held until the transaction commits,
    /// rolls back or is dropped, so a task holding one must not begin another.
    pub async fn begin(&self, cancel: &CancellationToken) -> Result<WriteTransaction, Error> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = tokio::time::timeout(self.lock_wait, self.writer.clone().acquire_owned()) => {
                match permit {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_closed)) => return Err(Error::Cancelled),
                    Err(_elapsed) => return Err(Error::Busy),
                }
            }
        };

        let tx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            tx = self.pool.begin() => tx?,
        };

        Ok(WriteTransaction {
            tx,
            _permit: permit,
        })
    }

    /// Opens and immediately releases one connection, turning a failure into a setup error with
    /// a readable message.
    pub async fn verify_access(&self, cancel: &CancellationToken) -> Result<(), Error> {
        match self.open_connection(cancel).await {
            Ok(_) => Ok(()),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => Err(Error::Whatever {
                message: "Could not open a connection to the database".to_owned(),
                source: Some(eyre::Report::new(e)),
            }),
        }
    }

    pub async fn close(&self) {
        self.writer.close();
        self.pool.close().await;
    }
}

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// A SQLite transaction holding the in-process write permit.
pub struct WriteTransaction {
    tx: Transaction<'static, Sqlite>,
    _permit: OwnedSemaphorePermit,
}

impl WriteTransaction {
    pub async fn commit(self) -> Result<(), Error> {
        Ok(self.tx.commit().await?)
    }

    pub async fn rollback(self) -> Result<(), Error> {
        Ok(self.tx.rollback().await?)
    }
}

impl Deref for WriteTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl DerefMut for WriteTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}
