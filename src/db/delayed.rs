use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    address::{AddressTranslator, QueueAddress},
    connection::{ConnectionFactory, WriteTransaction},
    error::Error,
    message::{encode_headers, Headers, OutgoingMessage},
    utils,
};

use super::queue::TableQueueCache;

#[derive(Debug, FromRow)]
struct DelayedRow {
    id: String,
    headers: String,
    body: Option<Vec<u8>>,
    destination: String,
}

/// Result of one pass over the due rows.
#[derive(Debug, Default)]
pub struct DueBatch {
    /// Number of due rows that were selected.
    pub selected: usize,
    /// Destination of every row that was moved, in move order.
    pub moved: Vec<QueueAddress>,
    /// Rows that could not be moved and were pushed back by the retry delay.
    pub deferred: usize,
}

impl DueBatch {
    /// Whether the pass selected as many rows as it could, so more may be due.
    pub fn is_full(&self, batch_size: u32) -> bool {
        self.selected >= batch_size as usize
    }
}

/// Messages waiting for their due time, kept in a table owned by the endpoint.
pub struct DelayedMessageTable {
    address: QueueAddress,
    store_sql: String,
    select_due_sql: String,
    take_sql: String,
    defer_sql: String,
    next_due_sql: String,
    stored: Notify,
}

impl DelayedMessageTable {
    pub fn new(address: QueueAddress) -> Self {
        let table = address.qualified_table_name();

        Self {
            store_sql: format!(
                "INSERT INTO {table} (id, headers, body, due, destination) VALUES ($1, $2, $3, $4, $5)"
            ),
            select_due_sql: format!(
                "SELECT seq FROM {table} WHERE due <= $1 ORDER BY due, seq LIMIT $2"
            ),
            take_sql: format!(
                "DELETE FROM {table} WHERE seq = $1 RETURNING id, headers, body, destination"
            ),
            defer_sql: format!("UPDATE {table} SET due = $2 WHERE seq = $1"),
            next_due_sql: format!("SELECT MIN(due) FROM {table}"),
            stored: Notify::new(),
            address,
        }
    }

    pub fn address(&self) -> &QueueAddress {
        &self.address
    }

    /// Wakes the due-message processor so it can re-evaluate the next due time.
    pub fn notify_stored(&self) {
        self.stored.notify_one();
    }

    pub async fn stored(&self) {
        self.stored.notified().await
    }

    pub async fn store(
        &self,
        message: &OutgoingMessage,
        due: DateTime<Utc>,
        destination: &QueueAddress,
        db: &mut SqliteConnection,
    ) -> Result<(), Error> {
        let headers = encode_headers(&message.headers)?;

        sqlx::query(&self.store_sql)
            .bind(&message.id)
            .bind(headers)
            .bind(message.body.as_ref())
            .bind(utils::to_millis(due))
            .bind(destination.to_string())
            .execute(db)
            .await
            .map_err(|e| Error::send_failed(self.address.to_string(), e))?;

        Ok(())
    }

    /// Moves up to `batch_size` due rows into their destination tables.
    ///
    /// Every row is moved in its own transaction: the row is deleted from this table and
    /// inserted into the destination, or neither happens. A row that cannot be moved (its
    /// destination table is missing, or the row itself is unreadable) stays in this table with
    /// its due time pushed back by `retry_delay`, so it never holds up the rows behind it.
    /// Cancellation is observed between rows, never inside one.
    #[allow(clippy::too_many_arguments)]
    pub async fn move_due_messages(
        &self,
        connections: &ConnectionFactory,
        queues: &TableQueueCache,
        translator: &AddressTranslator,
        batch_size: u32,
        retry_delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<DueBatch, Error> {
        let due: Vec<i64> = {
            let mut conn = connections.open_connection(cancel).await?;
            sqlx::query_scalar(&self.select_due_sql)
                .bind(utils::now_millis())
                .bind(batch_size as i64)
                .fetch_all(&mut *conn)
                .await?
        };

        let mut batch = DueBatch {
            selected: due.len(),
            moved: Vec::with_capacity(due.len()),
            deferred: 0,
        };

        for seq in due {
            if cancel.is_cancelled() {
                break;
            }

            let mut tx = connections.begin(cancel).await?;

            let row: Option<DelayedRow> = sqlx::query_as(&self.take_sql)
                .bind(seq)
                .fetch_optional(&mut *tx)
                .await?;

            // Another processor got there first.
            let Some(row) = row else {
                tx.rollback().await?;
                continue;
            };

            let id = row.id.clone();
            match self.move_row(row, queues, translator, &mut tx).await {
                Ok(destination) => {
                    tx.commit().await?;
                    tracing::debug!(
                        message_id = %id,
                        destination = %destination,
                        "Moved due delayed message"
                    );
                    batch.moved.push(destination);
                }
                Err(
                    e @ (Error::QueueNotFound { .. }
                    | Error::InvalidParameter { .. }
                    | Error::MalformedRow { .. }),
                ) => {
                    tx.rollback().await?;
                    let retry_at = self.defer(seq, retry_delay, connections, cancel).await?;
                    tracing::error!(
                        message_id = %id,
                        seq,
                        %retry_at,
                        "Cannot move due delayed message, leaving it in the delayed table: {e}"
                    );
                    batch.deferred += 1;
                }
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e);
                }
            }
        }

        Ok(batch)
    }

    async fn move_row(
        &self,
        row: DelayedRow,
        queues: &TableQueueCache,
        translator: &AddressTranslator,
        tx: &mut WriteTransaction,
    ) -> Result<QueueAddress, Error> {
        let destination = translator.parse(&row.destination)?;
        let headers: Headers =
            serde_json::from_str(&row.headers).map_err(|source| Error::MalformedRow {
                queue: self.address.to_string(),
                source,
            })?;
        let message = OutgoingMessage::new(row.id, headers, row.body.unwrap_or_default());

        queues.get(&destination).send(&message, None, tx).await?;

        Ok(destination)
    }

    /// Pushes the due time of row `seq` back by `delay`.
    async fn defer(
        &self,
        seq: i64,
        delay: Duration,
        connections: &ConnectionFactory,
        cancel: &CancellationToken,
    ) -> Result<DateTime<Utc>, Error> {
        let delay = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let retry_at = utils::now_millis().saturating_add(delay);

        let mut tx = connections.begin(cancel).await?;
        sqlx::query(&self.defer_sql)
            .bind(seq)
            .bind(retry_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(utils::from_millis(retry_at))
    }

    /// Due time of the earliest stored row.
    pub async fn next_due(
        &self,
        connections: &ConnectionFactory,
        cancel: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let mut conn = connections.open_connection(cancel).await?;
        let next: Option<i64> = sqlx::query_scalar(&self.next_due_sql)
            .fetch_one(&mut *conn)
            .await?;

        Ok(next.map(utils::from_millis))
    }

    pub async fn count(&self, db: &mut SqliteConnection) -> Result<u64, Error> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.address.qualified_table_name()))
                .fetch_one(db)
                .await?;

        Ok(count as u64)
    }
}
