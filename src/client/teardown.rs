//! Ordered teardown of a management client
//!
//! Close runs these steps once, in order. Every step except the final wait for
//! the endpoint is best-effort: its failure or panic is logged through [`swallow`]
//! and the remaining steps still run. Only the endpoint wait can fail close.

use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::{ self, AssertUnwindSafe };
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{ debug, warn };

use crate::client::association::ChannelAssociation;
use crate::config::ClientConfig;
use crate::errors::Error;
use crate::transport::{ ConnectionStrategy, Endpoint };

/// Steps whose failures are tolerated during close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    /// Stopping admission of new operations
    Shutdown,
    /// Closing the connection strategy and its channel
    CloseStrategy,
    /// Requesting asynchronous endpoint close
    CloseEndpoint,
    /// Cancelling operations in flight
    ShutdownNow,
    /// Waiting for cancelled operations to drain
    AwaitCompletion,
    /// Releasing configuration resources
    ReleaseConfiguration,
    /// Joining the teardown task
    Join,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownStep::Shutdown => "shutdown",
            TeardownStep::CloseStrategy => "close strategy",
            TeardownStep::CloseEndpoint => "close endpoint",
            TeardownStep::ShutdownNow => "shutdown now",
            TeardownStep::AwaitCompletion => "await completion",
            TeardownStep::ReleaseConfiguration => "release configuration",
            TeardownStep::Join => "join teardown",
        };
        f.write_str(name)
    }
}

/// Log a tolerated teardown failure
pub(crate) fn swallow(client_id: u64, step: TeardownStep, error: &Error) {
    warn!(client = client_id, %step, "Ignoring failure during close: {}", error);
}

/// Resources taken out of an open client, in the order they are released
pub(crate) struct Teardown<H: ChannelAssociation> {
    pub client_id: u64,
    pub handler: Arc<H>,
    pub configuration: ClientConfig,
    pub endpoint: Option<Arc<dyn Endpoint>>,
    pub strategy: Option<Box<dyn ConnectionStrategy>>,
    pub interrupt: CancellationToken,
}

/// Run a best-effort step, logging a panic instead of unwinding through close
fn guarded<T>(client_id: u64, step: TeardownStep, f: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            swallow(client_id, step, &Error::from_panic(payload));
            None
        }
    }
}

/// Async counterpart of [`guarded`]
async fn guarded_async<T>(
    client_id: u64,
    step: TeardownStep,
    future: impl Future<Output = T>
) -> Option<T> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(value) => Some(value),
        Err(payload) => {
            swallow(client_id, step, &Error::from_panic(payload));
            None
        }
    }
}

impl<H: ChannelAssociation> Teardown<H> {
    pub async fn run(self) -> Result<(), Error> {
        let Teardown { client_id, handler, configuration, endpoint, strategy, interrupt } = self;

        // Don't allow any new request
        guarded(client_id, TeardownStep::Shutdown, || handler.shutdown());

        // First close the channel and connection
        if let Some(strategy) = strategy {
            let closed = guarded_async(client_id, TeardownStep::CloseStrategy, strategy.close()).await;
            if let Some(Err(e)) = closed {
                swallow(client_id, TeardownStep::CloseStrategy, &e);
            }
        }

        // Then request the endpoint to close
        if let Some(endpoint) = &endpoint {
            match guarded(client_id, TeardownStep::CloseEndpoint, || endpoint.close_async()) {
                Some(Ok(())) | None => {}
                Some(Err(Error::UnsupportedOperation(_))) => {
                    debug!("Endpoint {} cannot close asynchronously", endpoint.name());
                }
                Some(Err(e)) => swallow(client_id, TeardownStep::CloseEndpoint, &e),
            }
        }

        // Cancel everything still active
        guarded(client_id, TeardownStep::ShutdownNow, || handler.shutdown_now());

        {
            let release = configuration.clone();
            scopeguard::defer! {
                let released = guarded(client_id, TeardownStep::ReleaseConfiguration, || release.release());
                if let Some(Err(e)) = released {
                    swallow(client_id, TeardownStep::ReleaseConfiguration, &e);
                }
            }

            let limit = configuration.completion_timeout();
            let drain = guarded_async(
                client_id,
                TeardownStep::AwaitCompletion,
                tokio::time::timeout(limit, handler.await_completion(limit))
            );
            tokio::select! {
                biased;
                _ = interrupt.cancelled() => {
                    debug!("Close of client #{} interrupted while awaiting completion", client_id);
                }
                drained = drain => {
                    if matches!(drained, Some(Err(_)) | Some(Ok(false))) {
                        let error = Error::Timeout(
                            format!("operations still active after {:?}", limit)
                        );
                        swallow(client_id, TeardownStep::AwaitCompletion, &error);
                    }
                }
            }
        }

        // Callers expect transport resources to be gone once close returns
        if let Some(endpoint) = endpoint {
            tokio::select! {
                biased;
                _ = interrupt.cancelled() => {
                    return Err(
                        Error::interrupted(
                            format!("Interrupted while waiting for endpoint {} to close", endpoint.name())
                        )
                    );
                }
                closed = AssertUnwindSafe(endpoint.await_closed()).catch_unwind() => {
                    if let Err(payload) = closed {
                        return Err(Error::from_panic(payload));
                    }
                }
            }
        }

        debug!("Management client #{} closed", client_id);
        Ok(())
    }
}
