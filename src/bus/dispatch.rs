//! Bounded, retrying dispatch of bus messages to a handler.
//!
//! `Dispatcher` wraps a `MessageHandler` and is itself a `MessageHandler`, so
//! it can be subscribed to any bus. It provides:
//! - a bounded pool: at most `max_concurrent` handler calls run at once;
//!   a message backing off between attempts holds no slot
//! - redelivery with exponential backoff for retryable errors
//! - dead-lettering once retries run out or the error is not retryable
//!
//! A dead-lettered message counts as handled; the dispatcher only returns an
//! error if the dead-letter publish itself fails.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use super::{BusError, Envelope, MessageHandler};
use crate::config::RetryConfig;
use crate::dlq::{DeadLetter, DeadLetterPublisher};
use crate::error::{Classify, HandlerError};
use crate::utils::retry::handler_backoff;

struct DispatcherInner {
    component: String,
    handler: Arc<dyn MessageHandler>,
    permits: Arc<Semaphore>,
    retry: RetryConfig,
    dlq: Arc<dyn DeadLetterPublisher>,
}

/// Worker pool in front of a message handler.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        component: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        max_concurrent: usize,
        retry: RetryConfig,
        dlq: Arc<dyn DeadLetterPublisher>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                component: component.into(),
                handler,
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                retry,
                dlq,
            }),
        }
    }

    /// Handler slots currently free.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

impl DispatcherInner {
    async fn dispatch(&self, envelope: Arc<Envelope>) -> Result<(), HandlerError> {
        let attempts = AtomicU32::new(0);
        // One permit per attempt; none is held during backoff.
        let result = (|| async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| BusError::Subscribe("dispatcher closed".to_string()))?;
            attempts.fetch_add(1, Ordering::SeqCst);
            self.handler.handle(Arc::clone(&envelope)).await
        })
        .retry(handler_backoff(&self.retry))
        .when(|e: &HandlerError| e.class().is_retryable())
        .notify(|e: &HandlerError, delay: Duration| {
            warn!(
                component = %self.component,
                message_type = %envelope.message_type,
                envelope_id = %envelope.id,
                error = %e,
                delay = ?delay,
                "Handler failed, retrying"
            );
        })
        .await;

        let err = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let class = err.class();
        let attempts = attempts.load(Ordering::SeqCst);
        error!(
            component = %self.component,
            message_type = %envelope.message_type,
            envelope_id = %envelope.id,
            error = %err,
            error_class = %class,
            attempts,
            "Handler gave up, dead-lettering message"
        );

        let dead_letter = DeadLetter::from_handler_failure(
            &envelope,
            &err.to_string(),
            class,
            attempts,
            &self.component,
        );
        if let Err(dlq_err) = self.dlq.publish(dead_letter).await {
            error!(error = %dlq_err, "Failed to publish dead letter");
            return Err(err);
        }
        Ok(())
    }
}

impl MessageHandler for Dispatcher {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.dispatch(envelope).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Address, BusMessage};
    use crate::dlq::ChannelDeadLetterPublisher;
    use crate::interfaces::StorageError;
    use crate::routing::Role;
    use crate::tasks::PayloadError;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl BusMessage for Ping {
        const MESSAGE_TYPE: &'static str = "test.Ping";
    }

    fn envelope() -> Arc<Envelope> {
        Arc::new(Envelope::new(&Ping, Address::role(Role::Controller)).unwrap())
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            min_delay_ms: 1,
            max_delay_ms: 2,
            max_retries: 3,
        }
    }

    /// Fails with the given error until `failures` calls have been made.
    struct FlakyHandler {
        calls: Arc<AtomicUsize>,
        failures: usize,
        transient: bool,
    }

    impl MessageHandler for FlakyHandler {
        fn handle(&self, _: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = call < self.failures;
            let transient = self.transient;
            Box::pin(async move {
                match (fail, transient) {
                    (false, _) => Ok(()),
                    (true, true) => Err(StorageError::Unavailable("db down".to_string()).into()),
                    (true, false) => Err(PayloadError::UnknownType("x".to_string()).into()),
                }
            })
        }
    }

    fn flaky(failures: usize, transient: bool) -> (Arc<AtomicUsize>, Arc<dyn MessageHandler>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(FlakyHandler {
            calls: calls.clone(),
            failures,
            transient,
        });
        (calls, handler)
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (calls, handler) = flaky(2, true);
        let (dlq, mut dead) = ChannelDeadLetterPublisher::new();
        let dispatcher = Dispatcher::new("test", handler, 4, fast_retry(), Arc::new(dlq));

        dispatcher.handle(envelope()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(dead.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_dead_lettered() {
        let (calls, handler) = flaky(usize::MAX, true);
        let (dlq, mut dead) = ChannelDeadLetterPublisher::new();
        let dispatcher = Dispatcher::new("test", handler, 4, fast_retry(), Arc::new(dlq));

        dispatcher.handle(envelope()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let letter = dead.try_recv().unwrap();
        assert_eq!(letter.attempts, 4);
        assert_eq!(letter.error_class, "transient_infra");
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_dead_lettered_once() {
        let (calls, handler) = flaky(usize::MAX, false);
        let (dlq, mut dead) = ChannelDeadLetterPublisher::new();
        let dispatcher = Dispatcher::new("test", handler, 4, fast_retry(), Arc::new(dlq));

        dispatcher.handle(envelope()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dead.try_recv().unwrap().error_class, "configuration");
    }

    #[tokio::test]
    async fn test_failed_dead_letter_publish_returns_error() {
        let (_, handler) = flaky(usize::MAX, false);
        let (dlq, dead) = ChannelDeadLetterPublisher::new();
        drop(dead);
        let dispatcher = Dispatcher::new("test", handler, 4, fast_retry(), Arc::new(dlq));

        assert!(dispatcher.handle(envelope()).await.is_err());
    }

    struct SlowHandler {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl MessageHandler for SlowHandler {
        fn handle(&self, _: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
            let running = self.running.clone();
            let peak = self.peak.clone();
            Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    /// Fails transiently until a `Gate` message has been handled.
    struct GatedHandler {
        opened: Arc<AtomicBool>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Gate;

    impl BusMessage for Gate {
        const MESSAGE_TYPE: &'static str = "test.Gate";
    }

    impl MessageHandler for GatedHandler {
        fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
            let opened = self.opened.clone();
            Box::pin(async move {
                if envelope.is::<Gate>() {
                    opened.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                if opened.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(StorageError::Unavailable("not yet".to_string()).into())
                }
            })
        }
    }

    #[tokio::test]
    async fn test_backing_off_message_does_not_block_the_one_it_waits_for() {
        let handler = Arc::new(GatedHandler {
            opened: Arc::new(AtomicBool::new(false)),
        });
        let (dlq, mut dead) = ChannelDeadLetterPublisher::new();
        let retry = RetryConfig {
            min_delay_ms: 5,
            max_delay_ms: 10,
            max_retries: 20,
        };
        let dispatcher = Dispatcher::new("test", handler, 1, retry, Arc::new(dlq));

        let waiting = tokio::spawn(dispatcher.handle(envelope()));
        tokio::time::sleep(Duration::from_millis(2)).await;
        let gate = Arc::new(Envelope::new(&Gate, Address::role(Role::Controller)).unwrap());
        let opening = tokio::spawn(dispatcher.handle(gate));

        opening.await.unwrap().unwrap();
        waiting.await.unwrap().unwrap();

        assert!(dead.try_recv().is_err());
        assert_eq!(dispatcher.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let peak = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(SlowHandler {
            running: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        });
        let (dlq, _dead) = ChannelDeadLetterPublisher::new();
        let dispatcher = Dispatcher::new("test", handler, 2, fast_retry(), Arc::new(dlq));

        let tasks: Vec<_> = (0..8)
            .map(|_| tokio::spawn(dispatcher.handle(envelope())))
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(dispatcher.available_permits(), 2);
    }
}
