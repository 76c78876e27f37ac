//! Message types flowing into and out of queue tables.
//!
//! Outgoing messages are created by senders and are immutable once handed to the dispatcher.
//! Incoming messages are what a receive loop hands to a handler after a row has been removed
//! from its table. Headers are opaque text pairs and bodies are opaque bytes.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::{error::Error, utils};

/// Header names written by the transport itself.
pub mod headers {
    pub const MESSAGE_ID: &str = "tablemq.MessageId";
    pub const FAILED_QUEUE: &str = "tablemq.FailedQ";
    pub const EXCEPTION_MESSAGE: &str = "tablemq.ExceptionInfo.Message";
    pub const TIME_OF_FAILURE: &str = "tablemq.TimeOfFailure";
    pub const FAILURE_COUNT: &str = "tablemq.FailureCount";
    pub const DELIVER_AT: &str = "tablemq.DeliverAt";
}

pub type Headers = HashMap<String, String>;

/// A message on its way to a queue table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub id: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl OutgoingMessage {
    pub fn new(id: impl Into<String>, headers: Headers, body: impl Into<Bytes>) -> Self {
        let id = id.into();
        let mut headers = headers;
        headers
            .entry(headers::MESSAGE_ID.to_owned())
            .or_insert_with(|| id.clone());

        Self {
            id,
            headers,
            body: body.into(),
        }
    }

    /// Creates a message with a random identifier.
    pub fn with_body(body: impl Into<Bytes>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), Headers::new(), body)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message that has been removed from a queue table.
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingMessage {
    pub id: String,
    pub headers: Headers,
    pub body: Bytes,
    pub expires: Option<DateTime<Utc>>,
}

impl IncomingMessage {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// The message as it would be sent again, e.g. back to its input queue or to the error
    /// queue.
    pub fn to_outgoing(&self) -> OutgoingMessage {
        OutgoingMessage {
            id: self.id.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Raw row shape shared by every queue table.
#[derive(Debug, FromRow)]
pub(crate) struct MessageRow {
    pub id: String,
    pub expires: Option<i64>,
    pub headers: String,
    pub body: Option<Vec<u8>>,
}

impl MessageRow {
    pub fn into_incoming(self, queue: &str) -> Result<IncomingMessage, Error> {
        let headers: Headers =
            serde_json::from_str(&self.headers).map_err(|source| Error::MalformedRow {
                queue: queue.to_owned(),
                source,
            })?;

        Ok(IncomingMessage {
            id: self.id,
            headers,
            body: self.body.map(Bytes::from).unwrap_or_default(),
            expires: self.expires.map(utils::from_millis),
        })
    }
}

pub(crate) fn encode_headers(headers: &Headers) -> Result<String, Error> {
    Ok(serde_json::to_string(headers)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_records_its_id_header() {
        let msg = OutgoingMessage::new("abc", Headers::new(), "hello");
        assert_eq!(msg.headers.get(headers::MESSAGE_ID).unwrap(), "abc");
    }

    #[test]
    fn existing_id_header_is_kept() {
        let mut h = Headers::new();
        h.insert(headers::MESSAGE_ID.to_owned(), "original".to_owned());
        let msg = OutgoingMessage::new("copy", h, Bytes::new());
        assert_eq!(msg.headers.get(headers::MESSAGE_ID).unwrap(), "original");
    }

    #[test]
    fn rows_with_bad_headers_are_rejected() {
        let row = MessageRow {
            id: "1".to_owned(),
            expires: None,
            headers: "not json".to_owned(),
            body: None,
        };
        assert!(matches!(
            row.into_incoming("main.q"),
            Err(Error::MalformedRow { .. })
        ));
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = Utc::now();
        let msg = IncomingMessage {
            id: "1".to_owned(),
            headers: Headers::new(),
            body: Bytes::new(),
            expires: Some(now),
        };
        assert!(msg.is_expired(now));
        assert!(!IncomingMessage { expires: None, ..msg }.is_expired(now));
    }
}
