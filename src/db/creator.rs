use sqlx::SqlitePool;

use crate::{address::QueueAddress, error::Error, utils::quote_identifier};

use super::queue::expires_index_name;

/// Creates the tables the transport needs. Every statement is idempotent, so running it against
/// an existing schema is a no-op.
pub struct QueueCreator {
    db: SqlitePool,
}

impl QueueCreator {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn create_queue_if_necessary(&self, address: &QueueAddress) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;

        sqlx::query(&format!(
            "
            CREATE TABLE IF NOT EXISTS {} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                expires INTEGER NULL,
                headers TEXT NOT NULL,
                body BLOB NULL
            )
            ",
            address.qualified_table_name()
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {}.{} ON {} (expires) WHERE expires IS NOT NULL",
            quote_identifier(address.schema()),
            quote_identifier(&expires_index_name(address)),
            quote_identifier(address.table()),
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(queue = %address, "Ensured queue table exists");

        Ok(())
    }

    pub async fn create_delayed_table_if_necessary(
        &self,
        address: &QueueAddress,
    ) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;

        sqlx::query(&format!(
            "
            CREATE TABLE IF NOT EXISTS {} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                headers TEXT NOT NULL,
                body BLOB NULL,
                due INTEGER NOT NULL,
                destination TEXT NOT NULL
            )
            ",
            address.qualified_table_name()
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {}.{} ON {} (due)",
            quote_identifier(address.schema()),
            quote_identifier(&format!("{}_Index_Due", address.table())),
            quote_identifier(address.table()),
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(table = %address, "Ensured delayed message table exists");

        Ok(())
    }

    pub async fn create_subscription_table_if_necessary(
        &self,
        address: &QueueAddress,
    ) -> Result<(), Error> {
        sqlx::query(&format!(
            "
            CREATE TABLE IF NOT EXISTS {} (
                queue_address TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                topic TEXT NOT NULL,
                PRIMARY KEY (endpoint, topic)
            )
            ",
            address.qualified_table_name()
        ))
        .execute(&self.db)
        .await?;

        tracing::debug!(table = %address, "Ensured subscription table exists");

        Ok(())
    }

    pub async fn table_exists(&self, address: &QueueAddress) -> Result<bool, Error> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = $1 COLLATE NOCASE",
            quote_identifier(address.schema())
        ))
        .bind(address.table())
        .fetch_one(&self.db)
        .await?;

        Ok(count > 0)
    }
}
