//! Channel Association
//!
//! The channel association handler multiplexes management operations onto the
//! channel a client currently exposes. It is told to stop admitting work, to
//! cancel work in flight, and when a channel closes unexpectedly.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::request::OperationTracker;
use crate::errors::Error;
use crate::transport::ChannelHandle;

/// Binds outstanding requests to a channel
#[async_trait]
pub trait ChannelAssociation: Send + Sync + 'static {
    /// Stop admitting new operations
    fn shutdown(&self);

    /// Cancel all operations in flight
    fn shutdown_now(&self);

    /// Wait up to `timeout` for in-flight operations to finish.
    ///
    /// Returns false if some were still running when the timeout elapsed.
    async fn await_completion(&self, timeout: Duration) -> bool;

    /// A channel closed without the client asking for it
    fn handle_channel_closed(&self, channel: &ChannelHandle, cause: Option<Error>);
}

type SupplyFn = dyn (Fn() -> BoxFuture<'static, Result<ChannelHandle, Error>>) + Send + Sync;

/// Source of "the current channel" for a channel association
#[derive(Clone)]
pub struct ChannelSupplier {
    supply: Arc<SupplyFn>,
}

impl ChannelSupplier {
    /// Create a supplier from an async function
    pub fn new<F, Fut>(supply: F) -> Self
        where
            F: Fn() -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<ChannelHandle, Error>> + Send + 'static
    {
        Self {
            supply: Arc::new(move || Box::pin(supply())),
        }
    }

    /// Get the current channel
    pub async fn channel(&self) -> Result<ChannelHandle, Error> {
        (self.supply)().await
    }
}

/// Default [`ChannelAssociation`] that runs operations against supplied channels
pub struct ManagementChannelHandler {
    /// Where channels come from
    supplier: ChannelSupplier,
    /// Operations in flight
    operations: Arc<OperationTracker>,
    /// Runtime for asynchronous execution, `None` for the caller's
    executor: Option<Handle>,
}

impl ManagementChannelHandler {
    /// Create a handler that obtains channels from `supplier`
    pub fn new(supplier: ChannelSupplier, executor: Option<Handle>) -> Self {
        Self {
            supplier,
            operations: Arc::new(OperationTracker::new()),
            executor,
        }
    }

    /// Run `operation` against the current channel.
    ///
    /// Fails with [`Error::Closed`] once the handler is shut down, with
    /// [`Error::Cancelled`] if cancelled by [`ChannelAssociation::shutdown_now`],
    /// and with [`Error::ChannelClosed`] if its channel closes underneath it.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, Error>
        where F: FnOnce(ChannelHandle) -> Fut, Fut: Future<Output = Result<T, Error>>
    {
        let (ticket, mut cancelled) = self.operations.register()?;

        let channel = tokio::select! {
            biased;
            reason = &mut cancelled => return Err(cancellation_reason(reason)),
            channel = self.supplier.channel() => channel?,
        };
        self.operations.bind_channel(ticket.id(), channel.id());

        let result = tokio::select! {
            biased;
            reason = &mut cancelled => Err(cancellation_reason(reason)),
            result = operation(channel) => result,
        };
        drop(ticket);
        result
    }

    /// Run `operation` on the configured executor
    pub fn execute_async<T, F, Fut>(self: &Arc<Self>, operation: F) -> JoinHandle<Result<T, Error>>
        where
            T: Send + 'static,
            F: FnOnce(ChannelHandle) -> Fut + Send + 'static,
            Fut: Future<Output = Result<T, Error>> + Send + 'static
    {
        let handler = self.clone();
        let task = async move { handler.execute(operation).await };
        match &self.executor {
            Some(executor) => executor.spawn(task),
            None => tokio::spawn(task),
        }
    }

    /// Number of operations in flight
    pub fn active_operations(&self) -> usize {
        self.operations.active()
    }

    /// Whether new operations are admitted
    pub fn is_accepting(&self) -> bool {
        self.operations.is_accepting()
    }
}

fn cancellation_reason(reason: Result<Error, RecvError>) -> Error {
    reason.unwrap_or_else(|_| Error::Cancelled("operation abandoned".to_string()))
}

#[async_trait]
impl ChannelAssociation for ManagementChannelHandler {
    fn shutdown(&self) {
        debug!("Channel handler no longer admits operations");
        self.operations.stop_accepting();
    }

    fn shutdown_now(&self) {
        self.operations.stop_accepting();
        let reason = Error::Cancelled("management client is closing".to_string());
        let cancelled = self.operations.cancel_all(&reason);
        debug!("Cancelled {} operations in flight", cancelled);
    }

    async fn await_completion(&self, timeout: Duration) -> bool {
        self.operations.await_drained(timeout).await
    }

    fn handle_channel_closed(&self, channel: &ChannelHandle, cause: Option<Error>) {
        let message = match cause {
            Some(cause) => format!("channel {} closed: {}", channel.id(), cause),
            None => format!("channel {} closed", channel.id()),
        };
        let cancelled = self.operations.cancel_channel(channel.id(), &Error::ChannelClosed(message));
        debug!("Channel {} closed, failed {} operations bound to it", channel.id(), cancelled);
    }
}
