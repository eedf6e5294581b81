//! Endpoint
//!
//! An endpoint owns the process-level transport resources of one connection
//! generation. Closing it has two phases: [`Endpoint::close_async`] only signals,
//! [`Endpoint::await_closed`] waits until everything it owns is released.

use async_trait::async_trait;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::errors::Error;
use crate::transport::state::{ EndpointState, EndpointStateChannel };

/// Owner of transport resources with a two-phase close
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Endpoint name, used in logs
    fn name(&self) -> &str;

    /// Request close without waiting for it.
    ///
    /// Implementations that cannot close asynchronously return
    /// [`Error::UnsupportedOperation`]; callers treat that as already closed.
    fn close_async(&self) -> Result<(), Error>;

    /// Wait, without a timeout, until the endpoint is fully closed
    async fn await_closed(&self);
}

/// Endpoint whose resources are tasks spawned through it
pub struct LocalEndpoint {
    /// Endpoint name
    name: String,
    /// Cancelled when close is requested
    shutdown: CancellationToken,
    /// Tracks tasks owned by the endpoint
    tracker: TaskTracker,
    /// Close progress
    state: EndpointStateChannel,
}

impl LocalEndpoint {
    /// Create a new open endpoint
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            state: EndpointStateChannel::new(),
        }
    }

    /// Spawn a task owned by this endpoint.
    ///
    /// The task receives a token that is cancelled once close is requested and
    /// must finish soon after; [`Endpoint::await_closed`] waits for it.
    pub fn spawn<F, Fut>(&self, task: F) -> Result<JoinHandle<()>, Error>
        where F: FnOnce(CancellationToken) -> Fut, Fut: Future<Output = ()> + Send + 'static
    {
        if self.state.current().is_close_requested() {
            return Err(Error::closed(&format!("Endpoint {}", self.name)));
        }
        Ok(self.tracker.spawn(task(self.shutdown.child_token())))
    }

    /// Current close progress
    pub fn state(&self) -> EndpointState {
        self.state.current()
    }

    /// Number of owned tasks still running
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn close_async(&self) -> Result<(), Error> {
        if self.state.advance(EndpointState::Closing) {
            debug!("Closing endpoint {} with {} active tasks", self.name, self.tracker.len());
            self.tracker.close();
            self.shutdown.cancel();
        }
        Ok(())
    }

    async fn await_closed(&self) {
        self.state.wait_for(|s| s.is_close_requested()).await;
        self.tracker.wait().await;
        if self.state.advance(EndpointState::Closed) {
            debug!("Endpoint {} closed", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{ AtomicBool, Ordering };
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn close_waits_for_owned_tasks() {
        let endpoint = LocalEndpoint::new("test");
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        endpoint
            .spawn(move |shutdown| async move {
                shutdown.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .expect("spawn on open endpoint");

        endpoint.close_async().expect("close_async");
        assert_eq!(endpoint.state(), EndpointState::Closing);

        timeout(Duration::from_secs(1), endpoint.await_closed()).await.expect("await_closed hung");
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(endpoint.state(), EndpointState::Closed);
        assert_eq!(endpoint.active_tasks(), 0);
    }

    #[tokio::test]
    async fn await_closed_blocks_until_close_is_requested() {
        let endpoint = Arc::new(LocalEndpoint::new("test"));
        let waiter = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.await_closed().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        endpoint.close_async().expect("close_async");
        timeout(Duration::from_secs(1), waiter).await.expect("waiter hung").expect("waiter panicked");
    }

    #[tokio::test]
    async fn spawn_after_close_is_rejected() {
        let endpoint = LocalEndpoint::new("test");
        endpoint.close_async().expect("close_async");
        endpoint.close_async().expect("second close_async");

        let result = endpoint.spawn(|_| async {});
        assert!(matches!(result, Err(Error::Closed(_))));
    }
}
