//! The four ways of binding a receive to handler execution.
//!
//! | mode                        | receive + sends          | on handler failure                 |
//! |-----------------------------|--------------------------|------------------------------------|
//! | `transaction_scope`         | one scope, plus enlisted | rollback, retry, then error queue  |
//! | `sends_atomic_with_receive` | one local transaction    | rollback, retry, then error queue  |
//! | `receive_only`              | receive commits first    | error queue                        |
//! | `none`                      | independent autocommits  | re-send, retry, then error queue   |

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::{future::BoxFuture, FutureExt};
use sqlx::SqliteConnection;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::ConnectionFactory,
    db::queue::TableQueue,
    dispatch::{MessageDispatcher, TransportOperation},
    error::Error,
    failure_info::FailureInfoStorage,
    handler::{MessageContext, MessageHandler},
    message::{headers, IncomingMessage, OutgoingMessage},
    transaction::{MultiResourceEnlistment, TransactionMode, TransportTransaction},
};

mod native;
mod none;
mod receive_only;
mod scope;

pub use native::SendsAtomicWithReceiveStrategy;
pub use none::NoTransactionStrategy;
pub use receive_only::ReceiveOnlyStrategy;
pub use scope::TransactionScopeStrategy;

#[derive(Debug)]
pub enum Outcome {
    Processed,
    /// The message had expired and was discarded without invoking the handler.
    Expired,
    NoMessage,
    DeadLettered,
    /// The handler failed and the message will be retried.
    Failed(eyre::Report),
}

/// Receives at most one message and processes it. `Err` is reserved for store failures.
pub trait ProcessStrategy: Send + Sync {
    fn process_message<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Outcome, Error>>;
}

/// Everything a strategy needs to process messages from one queue.
pub struct Processing {
    pub(crate) connections: ConnectionFactory,
    pub(crate) queue: Arc<TableQueue>,
    pub(crate) error_queue: Arc<TableQueue>,
    pub(crate) failures: Arc<FailureInfoStorage>,
    pub(crate) dispatcher: MessageDispatcher,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) transaction_timeout: Duration,
    pub(crate) enlistment: MultiResourceEnlistment,
}

impl Processing {
    fn context<'a, 't>(
        &'a self,
        message: &'a IncomingMessage,
        transaction: TransportTransaction<'t>,
    ) -> MessageContext<'a, 't> {
        MessageContext::new(message, self.queue.address(), &self.dispatcher, transaction)
    }

    /// Runs the handler. A panic is reported like any other handler error.
    async fn invoke(&self, ctx: &mut MessageContext<'_, '_>) -> eyre::Result<()> {
        match AssertUnwindSafe(self.handler.handle(ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(eyre::eyre!("handler panicked: {}", panic_message(&*panic))),
        }
    }

    /// Writes the isolated operations a handler dispatched while the receive transaction was
    /// open. Runs after that transaction has ended.
    async fn dispatch_deferred(
        &self,
        message: &IncomingMessage,
        operations: Vec<TransportOperation>,
    ) -> Result<(), Error> {
        if operations.is_empty() {
            return Ok(());
        }

        self.dispatcher
            .dispatch(operations, &mut TransportTransaction::None)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    queue = %self.queue.address(),
                    message_id = %message.id,
                    "Failed to dispatch isolated operations: {e}"
                )
            })
    }

    fn discard_expired(&self, message: &IncomingMessage) -> Outcome {
        tracing::debug!(
            queue = %self.queue.address(),
            message_id = %message.id,
            "Discarding expired message"
        );
        Outcome::Expired
    }

    async fn move_to_error_queue(
        &self,
        message: &IncomingMessage,
        error: &str,
        failed_at: DateTime<Utc>,
        failures: u32,
        conn: &mut SqliteConnection,
    ) -> Result<(), Error> {
        tracing::error!(
            queue = %self.queue.address(),
            error_queue = %self.error_queue.address(),
            message_id = %message.id,
            failures,
            "Moving message to the error queue: {error}"
        );

        let failed = failed_message(message, self, error, failed_at, failures);
        self.error_queue
            .dead_letter(&failed, conn)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    queue = %self.queue.address(),
                    message_id = %message.id,
                    "Message lost, it could not be moved to the error queue: {e}"
                )
            })
    }
}

/// The message with failure details appended. The original headers are kept.
fn failed_message(
    message: &IncomingMessage,
    processing: &Processing,
    error: &str,
    failed_at: DateTime<Utc>,
    failures: u32,
) -> OutgoingMessage {
    message
        .to_outgoing()
        .with_header(headers::FAILED_QUEUE, processing.queue.address().to_string())
        .with_header(headers::EXCEPTION_MESSAGE, error)
        .with_header(headers::TIME_OF_FAILURE, failed_at.to_rfc3339())
        .with_header(headers::FAILURE_COUNT, failures.to_string())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

pub fn select(mode: TransactionMode, processing: Arc<Processing>) -> Arc<dyn ProcessStrategy> {
    match mode {
        TransactionMode::TransactionScope => Arc::new(TransactionScopeStrategy::new(processing)),
        TransactionMode::SendsAtomicWithReceive => {
            Arc::new(SendsAtomicWithReceiveStrategy::new(processing))
        }
        TransactionMode::ReceiveOnly => Arc::new(ReceiveOnlyStrategy::new(processing)),
        TransactionMode::None => Arc::new(NoTransactionStrategy::new(processing)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        address::{AddressTranslator, QueueAddress},
        config::Config,
        db::{creator::QueueCreator, queue::TableQueueCache, subscription::SubscriptionTable},
        dispatch::TransportOperation,
        message::Headers,
        pubsub::MulticastToUnicastConverter,
    };

    /// Fails the first `fail_times` invocations, then succeeds. Every attempt sends a copy of the
    /// message to `audit`.
    struct Flaky {
        fail_times: usize,
        calls: AtomicUsize,
        panic: bool,
    }

    impl Flaky {
        fn new(fail_times: usize) -> Self {
            Self {
                fail_times,
                calls: AtomicUsize::new(0),
                panic: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl MessageHandler for Flaky {
        fn handle<'a>(
            &'a self,
            ctx: &'a mut MessageContext<'_, '_>,
        ) -> BoxFuture<'a, eyre::Result<()>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);

                let copy = OutgoingMessage::new(
                    ctx.message().id.clone(),
                    Headers::new(),
                    ctx.message().body.clone(),
                );
                ctx.dispatch(vec![TransportOperation::send(copy, "audit")])
                    .await?;

                if call < self.fail_times {
                    if self.panic {
                        panic!("handler exploded");
                    }
                    eyre::bail!("attempt {call} failed");
                }
                Ok(())
            })
        }
    }

    /// Sends an isolated copy of every message to `audit`, then fails the first `fail_times`
    /// attempts.
    struct IsolatedAudit {
        fail_times: usize,
        calls: AtomicUsize,
    }

    impl MessageHandler for IsolatedAudit {
        fn handle<'a>(
            &'a self,
            ctx: &'a mut MessageContext<'_, '_>,
        ) -> BoxFuture<'a, eyre::Result<()>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);

                let copy = OutgoingMessage::with_body(ctx.message().body.clone());
                ctx.dispatch(vec![TransportOperation::send(copy, "audit").isolated()])
                    .await?;

                if call < self.fail_times {
                    eyre::bail!("attempt {call} failed");
                }
                Ok(())
            })
        }
    }

    struct Slow(Duration);

    impl MessageHandler for Slow {
        fn handle<'a>(
            &'a self,
            _ctx: &'a mut MessageContext<'_, '_>,
        ) -> BoxFuture<'a, eyre::Result<()>> {
            Box::pin(async move {
                tokio::time::sleep(self.0).await;
                Ok(())
            })
        }
    }

    /// Fails after dropping the input table, so the message cannot be put back.
    struct DropsInput(sqlx::SqlitePool);

    impl MessageHandler for DropsInput {
        fn handle<'a>(
            &'a self,
            _ctx: &'a mut MessageContext<'_, '_>,
        ) -> BoxFuture<'a, eyre::Result<()>> {
            Box::pin(async move {
                sqlx::query("DROP TABLE \"input\"").execute(&self.0).await?;
                eyre::bail!("input is gone")
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        connections: ConnectionFactory,
        queues: TableQueueCache,
        input: QueueAddress,
        error: QueueAddress,
        audit: QueueAddress,
        dispatcher: MessageDispatcher,
        cancel: CancellationToken,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::with_config(Config::default()).await
        }

        async fn with_config(config: Config) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = Config {
                db_path: Some(dir.path().join("test.db").to_string_lossy().into_owned()),
                ..config
            };
            let connections = ConnectionFactory::connect(&config).await.unwrap();
            let translator = Arc::new(AddressTranslator::new("main"));
            let cancel = CancellationToken::new();

            let creator = QueueCreator::new(connections.pool().clone());
            let input = translator.parse("input").unwrap();
            let error = translator.parse("error").unwrap();
            let audit = translator.parse("audit").unwrap();
            for address in [&input, &error, &audit] {
                creator.create_queue_if_necessary(address).await.unwrap();
            }

            let subscriptions = SubscriptionTable::new(
                connections.clone(),
                translator.parse("SubscriptionRouting").unwrap(),
                cancel.clone(),
            );
            let dispatcher = MessageDispatcher::new(
                connections.clone(),
                translator,
                Arc::new(TableQueueCache::new()),
                MulticastToUnicastConverter::new(Arc::new(subscriptions)),
                None,
                cancel.clone(),
            );

            Self {
                _dir: dir,
                connections,
                queues: TableQueueCache::new(),
                input,
                error,
                audit,
                dispatcher,
                cancel,
            }
        }

        fn strategy(
            &self,
            mode: TransactionMode,
            handler: Arc<dyn MessageHandler>,
            max_failures: u32,
        ) -> (Arc<dyn ProcessStrategy>, Arc<FailureInfoStorage>) {
            let failures = Arc::new(FailureInfoStorage::new(100, max_failures));
            let processing = Processing {
                connections: self.connections.clone(),
                queue: self.queues.get(&self.input),
                error_queue: self.queues.get(&self.error),
                failures: failures.clone(),
                dispatcher: self.dispatcher.clone(),
                handler,
                transaction_timeout: Duration::from_secs(5),
                enlistment: MultiResourceEnlistment::LastResourceCommit,
            };
            (select(mode, Arc::new(processing)), failures)
        }

        async fn send(&self, message: &OutgoingMessage, expires: Option<DateTime<Utc>>) {
            let mut conn = self.connections.open_connection(&self.cancel).await.unwrap();
            self.queues
                .get(&self.input)
                .send(message, expires, &mut conn)
                .await
                .unwrap();
        }

        async fn depth(&self, address: &QueueAddress) -> u32 {
            let mut conn = self.connections.open_connection(&self.cancel).await.unwrap();
            self.queues
                .get(address)
                .try_peek(&mut conn, 1000)
                .await
                .unwrap()
        }

        async fn receive(&self, address: &QueueAddress) -> Option<IncomingMessage> {
            let mut conn = self.connections.open_connection(&self.cancel).await.unwrap();
            self.queues
                .get(address)
                .try_receive(&mut conn)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn empty_queue_reports_no_message() {
        let f = Fixture::new().await;

        for mode in [
            TransactionMode::TransactionScope,
            TransactionMode::SendsAtomicWithReceive,
            TransactionMode::ReceiveOnly,
            TransactionMode::None,
        ] {
            let (strategy, _) = f.strategy(mode, Arc::new(Flaky::new(0)), 3);
            let outcome = strategy.process_message(&f.cancel).await.unwrap();
            assert!(matches!(outcome, Outcome::NoMessage), "{mode}: {outcome:?}");
        }
    }

    #[tokio::test]
    async fn expired_messages_skip_the_handler() {
        let f = Fixture::new().await;
        let handler = Arc::new(Flaky::new(0));
        let (strategy, _) = f.strategy(TransactionMode::SendsAtomicWithReceive, handler.clone(), 3);

        f.send(
            &OutgoingMessage::with_body("stale"),
            Some(Utc::now() - ChronoDuration::minutes(1)),
        )
        .await;

        let outcome = strategy.process_message(&f.cancel).await.unwrap();
        assert!(matches!(outcome, Outcome::Expired), "{outcome:?}");
        assert_eq!(handler.calls(), 0);
        assert_eq!(f.depth(&f.input).await, 0);
    }

    async fn poison_is_isolated_after_max_failures(mode: TransactionMode) {
        let f = Fixture::new().await;
        let handler = Arc::new(Flaky::new(usize::MAX));
        let (strategy, failures) = f.strategy(mode, handler.clone(), 3);
        let message = OutgoingMessage::with_body("poison").with_header("custom", "kept");

        f.send(&message, None).await;

        let mut dead_lettered = false;
        for _ in 0..10 {
            match strategy.process_message(&f.cancel).await.unwrap() {
                Outcome::Failed(_) => {}
                Outcome::DeadLettered => {
                    dead_lettered = true;
                    break;
                }
                other => panic!("{mode}: unexpected outcome {other:?}"),
            }
        }

        assert!(dead_lettered, "{mode}: message was never dead-lettered");
        assert_eq!(handler.calls(), 3, "{mode}");
        assert!(failures.get(&message.id).is_none(), "{mode}");
        assert_eq!(f.depth(&f.input).await, 0, "{mode}");

        let failed = f.receive(&f.error).await.unwrap();
        assert_eq!(failed.id, message.id);
        assert_eq!(failed.body, message.body);
        assert_eq!(failed.headers.get("custom").unwrap(), "kept");
        assert_eq!(failed.headers.get(headers::FAILURE_COUNT).unwrap(), "3");
        assert_eq!(
            failed.headers.get(headers::FAILED_QUEUE).unwrap(),
            &f.input.to_string()
        );
    }

    #[tokio::test]
    async fn poison_isolation_with_transaction_scope() {
        poison_is_isolated_after_max_failures(TransactionMode::TransactionScope).await;
    }

    #[tokio::test]
    async fn poison_isolation_with_sends_atomic_with_receive() {
        poison_is_isolated_after_max_failures(TransactionMode::SendsAtomicWithReceive).await;
    }

    #[tokio::test]
    async fn poison_isolation_without_transactions() {
        poison_is_isolated_after_max_failures(TransactionMode::None).await;
    }

    #[tokio::test]
    async fn atomic_modes_roll_back_sends_of_failed_attempts() {
        for mode in [
            TransactionMode::TransactionScope,
            TransactionMode::SendsAtomicWithReceive,
        ] {
            let f = Fixture::new().await;
            let handler = Arc::new(Flaky::new(1));
            let (strategy, failures) = f.strategy(mode, handler.clone(), 5);

            f.send(&OutgoingMessage::with_body("x"), None).await;

            let outcome = strategy.process_message(&f.cancel).await.unwrap();
            assert!(matches!(outcome, Outcome::Failed(_)), "{mode}: {outcome:?}");
            assert_eq!(f.depth(&f.input).await, 1, "{mode}");
            assert_eq!(f.depth(&f.audit).await, 0, "{mode}");

            let outcome = strategy.process_message(&f.cancel).await.unwrap();
            assert!(matches!(outcome, Outcome::Processed), "{mode}: {outcome:?}");
            assert_eq!(f.depth(&f.input).await, 0, "{mode}");
            assert_eq!(f.depth(&f.audit).await, 1, "{mode}");
            assert!(failures.is_empty(), "{mode}");
        }
    }

    #[tokio::test]
    async fn receive_only_failure_goes_to_the_error_queue() {
        let f = Fixture::new().await;
        let handler = Arc::new(Flaky::new(1));
        let (strategy, failures) = f.strategy(TransactionMode::ReceiveOnly, handler.clone(), 5);

        f.send(&OutgoingMessage::with_body("x"), None).await;

        let outcome = strategy.process_message(&f.cancel).await.unwrap();
        assert!(matches!(outcome, Outcome::DeadLettered), "{outcome:?}");
        assert_eq!(handler.calls(), 1);
        assert_eq!(f.depth(&f.input).await, 0);
        assert_eq!(f.depth(&f.error).await, 1);
        // sends are independent of the receive, so the audit copy survives the failure
        assert_eq!(f.depth(&f.audit).await, 1);
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn handler_panic_counts_as_failure() {
        let f = Fixture::new().await;
        let handler = Arc::new(Flaky {
            panic: true,
            ..Flaky::new(1)
        });
        let (strategy, failures) =
            f.strategy(TransactionMode::SendsAtomicWithReceive, handler.clone(), 5);
        let message = OutgoingMessage::with_body("x");

        f.send(&message, None).await;

        let outcome = strategy.process_message(&f.cancel).await.unwrap();
        match outcome {
            Outcome::Failed(e) => assert!(e.to_string().contains("handler exploded")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(failures.get(&message.id).unwrap().count, 1);
        assert_eq!(f.depth(&f.input).await, 1);
    }

    #[tokio::test]
    async fn isolated_sends_survive_the_receive_transaction() {
        for mode in [
            TransactionMode::TransactionScope,
            TransactionMode::SendsAtomicWithReceive,
        ] {
            let f = Fixture::new().await;
            let handler = Arc::new(IsolatedAudit {
                fail_times: 1,
                calls: AtomicUsize::new(0),
            });
            let (strategy, _) = f.strategy(mode, handler.clone(), 5);

            f.send(&OutgoingMessage::with_body("x"), None).await;

            let outcome = strategy.process_message(&f.cancel).await.unwrap();
            assert!(matches!(outcome, Outcome::Failed(_)), "{mode}: {outcome:?}");
            assert_eq!(f.depth(&f.input).await, 1, "{mode}");
            // the failed attempt rolled back the receive but not the isolated send
            assert_eq!(f.depth(&f.audit).await, 1, "{mode}");

            let outcome = strategy.process_message(&f.cancel).await.unwrap();
            assert!(matches!(outcome, Outcome::Processed), "{mode}: {outcome:?}");
            assert_eq!(f.depth(&f.input).await, 0, "{mode}");
            assert_eq!(f.depth(&f.audit).await, 2, "{mode}");
        }
    }

    #[tokio::test]
    async fn competing_atomic_receives_take_turns() {
        let f = Fixture::new().await;
        let (strategy, _) = f.strategy(
            TransactionMode::SendsAtomicWithReceive,
            Arc::new(Slow(Duration::from_millis(300))),
            5,
        );

        for body in ["a", "b"] {
            f.send(&OutgoingMessage::with_body(body), None).await;
        }

        let (a, b) = tokio::join!(
            strategy.process_message(&f.cancel),
            strategy.process_message(&f.cancel)
        );
        assert!(matches!(a, Ok(Outcome::Processed)), "{a:?}");
        assert!(matches!(b, Ok(Outcome::Processed)), "{b:?}");
        assert_eq!(f.depth(&f.input).await, 0);
    }

    #[tokio::test]
    async fn receive_blocked_by_a_long_handler_finds_no_message() {
        let f = Fixture::with_config(Config {
            busy_timeout_ms: Some(100),
            ..Default::default()
        })
        .await;
        let (strategy, _) = f.strategy(
            TransactionMode::SendsAtomicWithReceive,
            Arc::new(Slow(Duration::from_millis(600))),
            5,
        );

        for body in ["a", "b"] {
            f.send(&OutgoingMessage::with_body(body), None).await;
        }

        let (a, b) = tokio::join!(
            strategy.process_message(&f.cancel),
            strategy.process_message(&f.cancel)
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, Outcome::Processed))
                .count(),
            1,
            "{outcomes:?}"
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, Outcome::NoMessage))
                .count(),
            1,
            "{outcomes:?}"
        );
        assert_eq!(f.depth(&f.input).await, 1);
    }

    #[tokio::test]
    async fn message_that_cannot_be_returned_goes_to_the_error_queue() {
        let f = Fixture::new().await;
        let (strategy, failures) = f.strategy(
            TransactionMode::None,
            Arc::new(DropsInput(f.connections.pool().clone())),
            5,
        );
        let message = OutgoingMessage::with_body("x");

        f.send(&message, None).await;

        let outcome = strategy.process_message(&f.cancel).await.unwrap();
        assert!(matches!(outcome, Outcome::DeadLettered), "{outcome:?}");
        assert!(failures.is_empty());

        let failed = f.receive(&f.error).await.unwrap();
        assert_eq!(failed.id, message.id);
        assert_eq!(failed.headers.get(headers::FAILURE_COUNT).unwrap(), "1");
    }
}
