//! Transaction modes and the explicit transaction scope.
//!
//! SQLite has no distributed transaction coordinator. A [`TransactionScope`] therefore owns the
//! SQLite transaction and a list of additional [`Enlistment`]s, and commits them with a
//! last-resource protocol: every enlistment is prepared, SQLite commits, then every enlistment
//! commits. Whether enlisting anything at all is allowed is a configuration-time capability
//! ([`MultiResourceEnlistment`]), validated once at startup by [`probe_enlistment`].

use futures_util::future::BoxFuture;
use serde::Deserialize;
use sqlx::SqliteConnection;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{ConnectionFactory, WriteTransaction},
    error::Error,
};

/// Consistency level binding message receipt to handler execution.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionMode {
    /// Receive, handler, sends and any enlisted resources share one scope.
    TransactionScope,
    /// One local transaction covers the receive and the outgoing sends.
    SendsAtomicWithReceive,
    /// The receive commits before the handler runs.
    ReceiveOnly,
    /// Receive and sends are independent autocommit operations.
    None,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MultiResourceEnlistment {
    /// Only the store itself may take part in a scope.
    Unsupported,
    /// Additional resources are prepared before, and committed after, the store commits.
    LastResourceCommit,
}

/// A resource taking part in a [`TransactionScope`] alongside the store.
pub trait Enlistment: Send {
    fn name(&self) -> &str;

    fn prepare(&mut self) -> BoxFuture<'_, eyre::Result<()>>;

    fn commit(&mut self) -> BoxFuture<'_, eyre::Result<()>>;

    fn rollback(&mut self) -> BoxFuture<'_, eyre::Result<()>>;
}

pub struct TransactionScope {
    tx: WriteTransaction,
    enlistments: Vec<Box<dyn Enlistment>>,
    capability: MultiResourceEnlistment,
}

impl TransactionScope {
    pub async fn begin(
        connections: &ConnectionFactory,
        capability: MultiResourceEnlistment,
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        Ok(Self {
            tx: connections.begin(cancel).await?,
            enlistments: Vec::new(),
            capability,
        })
    }

    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub fn enlist(&mut self, enlistment: Box<dyn Enlistment>) -> Result<(), Error> {
        match self.capability {
            MultiResourceEnlistment::Unsupported => Err(Error::enlistment_not_supported(format!(
                "cannot enlist '{}': the store does not support multi-resource transactions",
                enlistment.name()
            ))),
            MultiResourceEnlistment::LastResourceCommit => {
                self.enlistments.push(enlistment);
                Ok(())
            }
        }
    }

    pub async fn commit(self) -> Result<(), Error> {
        let Self {
            tx,
            mut enlistments,
            ..
        } = self;

        for index in 0..enlistments.len() {
            let prepared = enlistments[index].prepare().await;
            if let Err(e) = prepared {
                tracing::warn!(
                    resource = enlistments[index].name(),
                    "Enlisted resource failed to prepare, rolling back: {e}"
                );
                rollback_all(&mut enlistments).await;
                tx.rollback().await?;
                return Err(Error::internal(e));
            }
        }

        if let Err(e) = tx.commit().await {
            rollback_all(&mut enlistments).await;
            return Err(e.into());
        }

        for enlistment in enlistments.iter_mut() {
            let committed = enlistment.commit().await;
            if let Err(e) = committed {
                tracing::error!(
                    resource = enlistment.name(),
                    "Enlisted resource failed to commit after the store committed: {e}"
                );
            }
        }

        Ok(())
    }

    pub async fn rollback(self) -> Result<(), Error> {
        let Self {
            tx,
            mut enlistments,
            ..
        } = self;

        rollback_all(&mut enlistments).await;
        tx.rollback().await?;

        Ok(())
    }
}

async fn rollback_all(enlistments: &mut [Box<dyn Enlistment>]) {
    for enlistment in enlistments.iter_mut() {
        let rolled_back = enlistment.rollback().await;
        if let Err(e) = rolled_back {
            tracing::warn!(resource = enlistment.name(), "Rollback failed: {e}");
        }
    }
}

/// The transaction a handler's outgoing operations may join.
pub enum TransportTransaction<'t> {
    Scope(&'t mut TransactionScope),
    Native(&'t mut WriteTransaction),
    None,
}

impl TransportTransaction<'_> {
    /// Connection of the ambient transaction, if there is one.
    pub fn connection(&mut self) -> Option<&mut SqliteConnection> {
        match self {
            Self::Scope(scope) => Some(scope.connection()),
            Self::Native(tx) => Some(&mut ***tx),
            Self::None => None,
        }
    }

    pub fn enlist(&mut self, enlistment: Box<dyn Enlistment>) -> Result<(), Error> {
        match self {
            Self::Scope(scope) => scope.enlist(enlistment),
            _ => Err(Error::enlistment_not_supported(
                "resources can only be enlisted in the transaction_scope mode",
            )),
        }
    }
}

struct ProbeEnlistment;

impl Enlistment for ProbeEnlistment {
    fn name(&self) -> &str {
        "enlistment-probe"
    }

    fn prepare(&mut self) -> BoxFuture<'_, eyre::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn commit(&mut self) -> BoxFuture<'_, eyre::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn rollback(&mut self) -> BoxFuture<'_, eyre::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Opens a scope, forces an additional durable enlistment and commits it, proving that the
/// configured capability can carry a multi-resource transaction.
pub async fn probe_enlistment(
    connections: &ConnectionFactory,
    capability: MultiResourceEnlistment,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let mut scope = TransactionScope::begin(connections, capability, cancel).await?;

    if let Err(e) = scope.enlist(Box::new(ProbeEnlistment)) {
        scope.rollback().await?;
        return Err(e);
    }

    scope.commit().await
}
