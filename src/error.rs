use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The destination table does not exist. Usually a configuration problem rather than a
    /// transient fault.
    #[snafu(display("Queue {queue} does not exist"))]
    QueueNotFound { queue: String },

    #[snafu(display("Failed to send message to {queue}"))]
    SendFailed {
        queue: String,
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display(
        "Logical addresses {existing} and {requested} both map to table {table}"
    ))]
    AddressCollision {
        existing: String,
        requested: String,
        table: String,
    },

    #[snafu(display("Resource manager enlistment is not supported: {message}"))]
    EnlistmentNotSupported { message: String },

    #[snafu(display("Delayed delivery is disabled for this endpoint"))]
    DelayedDeliveryDisabled,

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Malformed message row in {queue}"))]
    MalformedRow {
        queue: String,
        #[snafu(source)]
        source: serde_json::Error,
    },

    /// Another transaction held the write lock for longer than the busy timeout.
    #[snafu(display("Timed out waiting for the database write lock"))]
    Busy,

    #[snafu(display("Operation cancelled"))]
    Cancelled,

    #[snafu(display("Internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn enlistment_not_supported(message: impl Into<String>) -> Self {
        Self::EnlistmentNotSupported {
            message: message.into(),
        }
    }

    /// Classifies a failed insert into `queue`. SQLite reports a missing table as a generic
    /// error whose message starts with "no such table".
    pub fn send_failed(queue: impl Into<String>, source: sqlx::Error) -> Self {
        let queue = queue.into();
        match &source {
            sqlx::Error::Database(db) if db.message().starts_with("no such table") => {
                Self::QueueNotFound { queue }
            }
            _ => Self::SendFailed { queue, source },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Whether `e` is SQLite refusing a lock another connection holds (`SQLITE_BUSY` or
/// `SQLITE_LOCKED`, including their extended codes).
pub(crate) fn is_lock_contention(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = e else {
        return false;
    };

    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}
