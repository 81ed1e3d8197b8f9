//! Reply callbacks and their dispatch rules.
//!
//! A callback declares whether it is *lightweight*. The receive task
//! invokes lightweight callbacks inline; everything else is submitted to
//! the configured [`TaskExecutor`]. A missing executor, or one that
//! rejects the task, degrades to inline execution.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use mongolink_core::wire::Reply;
use mongolink_core::{Error, Result};
use tokio::sync::oneshot;

/// A completion task handed to a [`TaskExecutor`].
pub type CallbackTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receives the outcome of a request: a [`Reply`] or an [`Error`].
///
/// Completion consumes the callback, so it can run at most once across
/// any sequence of replies, shutdowns, and reconnects.
#[async_trait]
pub trait ReplyCallback: Send + Sync + fmt::Debug {
    /// Returns true if the callback is non-blocking and safe to run on
    /// the receive task.
    fn is_lightweight(&self) -> bool {
        false
    }

    /// Delivers the outcome.
    async fn complete(self: Box<Self>, result: Result<Reply>);
}

/// Off-loads non-lightweight callbacks from the receive task.
///
/// `execute` either accepts the task or hands it back; a returned task
/// is run inline by the caller.
pub trait TaskExecutor: Send + Sync + fmt::Debug {
    /// Attempts to run the task elsewhere. Returns the task on
    /// rejection.
    fn execute(&self, task: CallbackTask) -> std::result::Result<(), CallbackTask>;
}

/// A [`TaskExecutor`] that spawns onto the ambient tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

impl TokioExecutor {
    /// Creates the executor.
    pub fn new() -> Self {
        Self
    }
}

impl TaskExecutor for TokioExecutor {
    fn execute(&self, task: CallbackTask) -> std::result::Result<(), CallbackTask> {
        tokio::spawn(task);
        Ok(())
    }
}

/// A callback that discards its outcome.
///
/// Used for the keep-alive identity request a draining connection sends
/// to wake its receive task.
#[derive(Debug, Default)]
pub struct NoOpCallback;

impl NoOpCallback {
    /// Creates the callback.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReplyCallback for NoOpCallback {
    fn is_lightweight(&self) -> bool {
        true
    }

    async fn complete(self: Box<Self>, _result: Result<Reply>) {}
}

/// A callback that resolves an awaitable future.
#[derive(Debug)]
pub struct FutureCallback {
    sender: oneshot::Sender<Result<Reply>>,
}

impl FutureCallback {
    /// Creates the callback and the receiver that will resolve with the
    /// outcome.
    pub fn new() -> (Self, ReplyReceiver) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, ReplyReceiver { receiver })
    }
}

#[async_trait]
impl ReplyCallback for FutureCallback {
    fn is_lightweight(&self) -> bool {
        // Just a channel send; never blocks the receive task.
        true
    }

    async fn complete(self: Box<Self>, result: Result<Reply>) {
        let _ = self.sender.send(result);
    }
}

/// The receiving half of a [`FutureCallback`].
#[derive(Debug)]
pub struct ReplyReceiver {
    receiver: oneshot::Receiver<Result<Reply>>,
}

impl ReplyReceiver {
    /// Awaits the outcome.
    ///
    /// Resolves to [`Error::ConnectionLost`] if the callback was dropped
    /// without completing, which only happens on connection teardown.
    pub async fn recv(self) -> Result<Reply> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionLost(
                "connection closed before a reply arrived".to_string(),
            )),
        }
    }
}

/// Dispatch helpers shared by the receive task and shutdown paths.
pub struct ReplyHandler;

impl ReplyHandler {
    /// Delivers a reply to the callback under the dispatch rules.
    pub async fn reply(
        executor: Option<&Arc<dyn TaskExecutor>>,
        callback: Box<dyn ReplyCallback>,
        reply: Reply,
    ) {
        Self::dispatch(executor, callback, Ok(reply)).await;
    }

    /// Delivers an error to the callback, if there is one, under the
    /// dispatch rules.
    pub async fn raise_error(
        executor: Option<&Arc<dyn TaskExecutor>>,
        callback: Option<Box<dyn ReplyCallback>>,
        error: Error,
    ) {
        if let Some(callback) = callback {
            Self::dispatch(executor, callback, Err(error)).await;
        }
    }

    async fn dispatch(
        executor: Option<&Arc<dyn TaskExecutor>>,
        callback: Box<dyn ReplyCallback>,
        result: Result<Reply>,
    ) {
        match executor {
            Some(executor) if !callback.is_lightweight() => {
                let task: CallbackTask = Box::pin(async move {
                    callback.complete(result).await;
                });
                if let Err(task) = executor.execute(task) {
                    // Rejected; degrade to inline execution.
                    task.await;
                }
            }
            _ => callback.complete(result).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongolink_core::bson::Document;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_reply() -> Reply {
        Reply::new(1, 1, 0, 0, 0, vec![Document::new().with("ok", 1.0)])
    }

    #[derive(Debug)]
    struct CountingExecutor {
        accepted: Arc<AtomicUsize>,
        reject: bool,
    }

    impl TaskExecutor for CountingExecutor {
        fn execute(&self, task: CallbackTask) -> std::result::Result<(), CallbackTask> {
            if self.reject {
                return Err(task);
            }
            self.accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(task);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct HeavyCallback {
        sender: oneshot::Sender<Result<Reply>>,
    }

    #[async_trait]
    impl ReplyCallback for HeavyCallback {
        async fn complete(self: Box<Self>, result: Result<Reply>) {
            let _ = self.sender.send(result);
        }
    }

    #[tokio::test]
    async fn test_future_callback_resolves_with_reply() {
        let (callback, receiver) = FutureCallback::new();
        ReplyHandler::reply(None, Box::new(callback), ok_reply()).await;

        let reply = receiver.recv().await.unwrap();
        assert_eq!(reply.documents().len(), 1);
    }

    #[tokio::test]
    async fn test_future_callback_resolves_with_error() {
        let (callback, receiver) = FutureCallback::new();
        ReplyHandler::raise_error(
            None,
            Some(Box::new(callback)),
            Error::ConnectionLost("gone".to_string()),
        )
        .await;

        assert!(matches!(
            receiver.recv().await,
            Err(Error::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_callback_reports_connection_lost() {
        let (callback, receiver) = FutureCallback::new();
        drop(callback);
        assert!(matches!(
            receiver.recv().await,
            Err(Error::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_null_callback_is_a_no_op() {
        ReplyHandler::raise_error(None, None, Error::NoReply).await;
    }

    #[tokio::test]
    async fn test_lightweight_callback_skips_executor() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let executor: Arc<dyn TaskExecutor> = Arc::new(CountingExecutor {
            accepted: accepted.clone(),
            reject: false,
        });

        let (callback, receiver) = FutureCallback::new();
        ReplyHandler::reply(Some(&executor), Box::new(callback), ok_reply()).await;

        receiver.recv().await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_heavy_callback_uses_executor() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let executor: Arc<dyn TaskExecutor> = Arc::new(CountingExecutor {
            accepted: accepted.clone(),
            reject: false,
        });

        let (sender, receiver) = oneshot::channel();
        ReplyHandler::reply(Some(&executor), Box::new(HeavyCallback { sender }), ok_reply())
            .await;

        receiver.await.unwrap().unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_task_runs_inline() {
        let executor: Arc<dyn TaskExecutor> = Arc::new(CountingExecutor {
            accepted: Arc::new(AtomicUsize::new(0)),
            reject: true,
        });

        let (sender, mut receiver) = oneshot::channel();
        ReplyHandler::reply(Some(&executor), Box::new(HeavyCallback { sender }), ok_reply())
            .await;

        // The inline fallback has already run by the time dispatch
        // returns.
        assert!(receiver.try_recv().unwrap().is_ok());
    }
}
