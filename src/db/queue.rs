use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tokio::sync::Notify;

use crate::{
    address::QueueAddress,
    error::{is_lock_contention, Error},
    message::{encode_headers, IncomingMessage, MessageRow, OutgoingMessage},
    utils::{self, quote_identifier},
};

/// Physical queue operations against one table.
///
/// Rows are consumed in insertion order (`seq`). A receive is a single `DELETE … RETURNING`
/// statement, so two receivers can never both observe the same row: SQLite serializes writers
/// and the losing receiver simply sees the next row, or none.
pub struct TableQueue {
    address: QueueAddress,
    peek_sql: String,
    receive_sql: String,
    send_sql: String,
    purge_sql: String,
    purge_expired_sql: String,
    index_check_sql: String,
    arrivals: Notify,
}

impl TableQueue {
    pub fn new(address: QueueAddress) -> Self {
        let table = address.qualified_table_name();
        let schema = quote_identifier(address.schema());

        Self {
            peek_sql: format!("SELECT COUNT(*) FROM (SELECT 1 FROM {table} LIMIT $1)"),
            receive_sql: format!(
                "
                DELETE FROM {table}
                WHERE seq = (SELECT seq FROM {table} ORDER BY seq LIMIT 1)
                RETURNING id, expires, headers, body
                "
            ),
            send_sql: format!(
                "INSERT INTO {table} (id, expires, headers, body) VALUES ($1, $2, $3, $4)"
            ),
            purge_sql: format!("DELETE FROM {table}"),
            purge_expired_sql: format!(
                "
                DELETE FROM {table}
                WHERE seq IN (
                    SELECT seq FROM {table}
                    WHERE expires IS NOT NULL AND expires < $1
                    LIMIT $2
                )
                "
            ),
            index_check_sql: format!(
                "
                SELECT COUNT(*) FROM {schema}.sqlite_master
                WHERE type = 'index' AND tbl_name = $1 AND name = $2
                "
            ),
            arrivals: Notify::new(),
            address,
        }
    }

    pub fn address(&self) -> &QueueAddress {
        &self.address
    }

    /// Signals a receive loop waiting on this queue that a message was just sent locally.
    pub fn notify_arrival(&self) {
        self.arrivals.notify_one();
    }

    pub async fn arrival(&self) {
        self.arrivals.notified().await
    }

    /// Name of the partial index on `expires` that keeps expiry purges off a full scan.
    pub fn expires_index_name(&self) -> String {
        expires_index_name(&self.address)
    }

    /// Approximate number of ready rows, counting at most `max_records`.
    pub async fn try_peek(&self, db: &mut SqliteConnection, max_records: u32) -> Result<u32, Error> {
        let count: i64 = sqlx::query_scalar(&self.peek_sql)
            .bind(max_records as i64)
            .fetch_one(db)
            .await?;

        Ok(count as u32)
    }

    /// Removes and returns the oldest row, or `None` when the table is empty or another
    /// connection holds the write lock.
    pub async fn try_receive(
        &self,
        db: &mut SqliteConnection,
    ) -> Result<Option<IncomingMessage>, Error> {
        let row: Option<MessageRow> = match sqlx::query_as(&self.receive_sql)
            .fetch_optional(db)
            .await
        {
            Ok(row) => row,
            // another connection holds the write lock, nothing can be taken right now
            Err(e) if is_lock_contention(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        row.map(|row| row.into_incoming(&self.address.to_string()))
            .transpose()
    }

    pub async fn send(
        &self,
        message: &OutgoingMessage,
        expires: Option<DateTime<Utc>>,
        db: &mut SqliteConnection,
    ) -> Result<(), Error> {
        let headers = encode_headers(&message.headers)?;

        sqlx::query(&self.send_sql)
            .bind(&message.id)
            .bind(expires.map(utils::to_millis))
            .bind(headers)
            .bind(message.body.as_ref())
            .execute(db)
            .await
            .map_err(|e| Error::send_failed(self.address.to_string(), e))?;

        Ok(())
    }

    /// Stores a poison message in this (error) queue. Dead letters never expire.
    pub async fn dead_letter(
        &self,
        message: &OutgoingMessage,
        db: &mut SqliteConnection,
    ) -> Result<(), Error> {
        self.send(message, None, db).await
    }

    pub async fn purge(&self, db: &mut SqliteConnection) -> Result<u64, Error> {
        let result = sqlx::query(&self.purge_sql).execute(db).await?;
        Ok(result.rows_affected())
    }

    /// Deletes at most `batch_size` rows whose expiry has passed. Live rows are never touched.
    pub async fn purge_expired_batch(
        &self,
        db: &mut SqliteConnection,
        batch_size: u32,
    ) -> Result<u64, Error> {
        let result = sqlx::query(&self.purge_expired_sql)
            .bind(utils::now_millis())
            .bind(batch_size as i64)
            .execute(db)
            .await?;

        Ok(result.rows_affected())
    }

    /// Logs a warning when the expiry index is missing. Purging still works without it, it just
    /// scans the whole table. Returns whether the index exists.
    pub async fn log_warning_when_index_is_missing(
        &self,
        db: &mut SqliteConnection,
    ) -> Result<bool, Error> {
        let index = self.expires_index_name();
        let count: i64 = sqlx::query_scalar(&self.index_check_sql)
            .bind(self.address.table())
            .bind(&index)
            .fetch_one(db)
            .await?;

        if count == 0 {
            tracing::warn!(
                queue = %self.address,
                index,
                "Table does not contain the expiry index. Adding it will speed up purging expired messages"
            );
        }

        Ok(count > 0)
    }
}

pub(crate) fn expires_index_name(address: &QueueAddress) -> String {
    format!("{}_Index_Expires", address.table())
}

/// One [`TableQueue`] per address, shared by every receiver and the dispatcher.
#[derive(Default)]
pub struct TableQueueCache {
    queues: papaya::HashMap<QueueAddress, Arc<TableQueue>>,
}

impl TableQueueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &QueueAddress) -> Arc<TableQueue> {
        self.queues
            .pin()
            .get_or_insert_with(address.clone(), || Arc::new(TableQueue::new(address.clone())))
            .clone()
    }
}
