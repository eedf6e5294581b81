//! Management Client Core implementation
//!
//! This module implements the management client: it creates the connection
//! strategy lazily on first use, shares one strategy per generation between all
//! callers, and tears everything down exactly once on close. A client dropped
//! without being closed is reported as a leak and closed in the background.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{ debug, info };

use crate::client::association::{ ChannelAssociation, ChannelSupplier, ManagementChannelHandler };
use crate::client::teardown::{ Teardown, TeardownStep, swallow };
use crate::config::ClientConfig;
use crate::errors::Error;
use crate::leak::{ self, AllocationTrace, LeakReport };
use crate::protocol::ProtocolConnectionConfiguration;
use crate::transport::{
    ChannelHandle,
    CloseHandler,
    ConnectionStrategy,
    ConnectionStrategyFactory,
    Endpoint,
    StrategyParams,
};

/// Name used in use-after-close errors
const CLIENT_NAME: &str = "ManagementClient";

/// Source of per-process client ids
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Connection state; only `Open` can hold transport resources
pub(crate) enum ClientState {
    Open {
        endpoint: Option<Arc<dyn Endpoint>>,
        strategy: Option<Box<dyn ConnectionStrategy>>,
    },
    Closed {
        /// Result of the teardown, returned to every closer
        outcome: Result<(), Error>,
    },
}

struct ClientInner<H: ChannelAssociation> {
    /// Per-process id, used in logs and by the leak registry
    id: u64,
    /// Guards both channel creation and close
    state: Arc<Mutex<ClientState>>,
    /// Lock-free view of `state` being `Closed`
    closed: AtomicBool,
    /// Routes requests to whichever channel the strategy exposes
    handler: Arc<H>,
    /// Builds endpoints and strategies
    factory: Arc<dyn ConnectionStrategyFactory>,
    /// Caller configuration, released on close
    configuration: ClientConfig,
    /// Where the client was created
    allocation: Arc<AllocationTrace>,
}

/// Client for a remote management endpoint
pub struct ManagementClient<H: ChannelAssociation = ManagementChannelHandler> {
    inner: Arc<ClientInner<H>>,
}

impl ManagementClient<ManagementChannelHandler> {
    /// Create a client using the default channel association handler.
    ///
    /// No connection is made until the first request needs a channel.
    #[track_caller]
    pub fn new(configuration: ClientConfig, factory: Arc<dyn ConnectionStrategyFactory>) -> Self {
        let executor = configuration.executor();
        Self::build(configuration, factory, AllocationTrace::capture(), move |supplier| {
            ManagementChannelHandler::new(supplier, executor)
        })
    }

    /// Run `operation` against the current channel through the handler
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, Error>
        where F: FnOnce(ChannelHandle) -> Fut, Fut: std::future::Future<Output = Result<T, Error>>
    {
        self.inner.handler.execute(operation).await
    }
}

impl<H: ChannelAssociation> ManagementClient<H> {
    /// Create a client with a custom channel association handler.
    ///
    /// `association` receives the supplier the handler must use to obtain the
    /// current channel.
    #[track_caller]
    pub fn with_association<F>(
        configuration: ClientConfig,
        factory: Arc<dyn ConnectionStrategyFactory>,
        association: F
    ) -> Self
        where F: FnOnce(ChannelSupplier) -> H
    {
        Self::build(configuration, factory, AllocationTrace::capture(), association)
    }

    fn build<F>(
        configuration: ClientConfig,
        factory: Arc<dyn ConnectionStrategyFactory>,
        allocation: AllocationTrace,
        association: F
    ) -> Self
        where F: FnOnce(ChannelSupplier) -> H
    {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let allocation = Arc::new(allocation);
        leak::track(id, allocation.clone());

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner<H>>| {
            let weak = weak.clone();
            let supplier = ChannelSupplier::new(move || {
                let client = weak.upgrade();
                async move {
                    match client {
                        Some(client) => client.get_or_create_channel().await,
                        None => Err(Error::closed(CLIENT_NAME)),
                    }
                }
            });

            ClientInner {
                id,
                state: Arc::new(
                    Mutex::new(ClientState::Open {
                        endpoint: None,
                        strategy: None,
                    })
                ),
                closed: AtomicBool::new(false),
                handler: Arc::new(association(supplier)),
                factory,
                configuration,
                allocation,
            }
        });
        debug!("Created management client #{}", id);

        Self { inner }
    }

    /// Per-process id of this client
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The channel association handler requests flow through
    pub fn association(&self) -> &Arc<H> {
        &self.inner.handler
    }

    pub fn configuration(&self) -> &ClientConfig {
        &self.inner.configuration
    }

    /// Where this client was created
    pub fn allocation_trace(&self) -> &Arc<AllocationTrace> {
        &self.inner.allocation
    }

    /// Whether close has started
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Get the current channel, connecting on first use
    pub async fn get_or_create_channel(&self) -> Result<ChannelHandle, Error> {
        self.inner.get_or_create_channel().await
    }

    /// Close the client and wait for the transport to be released
    pub async fn close(&self) -> Result<(), Error> {
        let never = CancellationToken::new();
        self.inner.close_interruptibly(&never).await
    }

    /// Close the client; cancelling `interrupt` interrupts the close.
    ///
    /// Interruption while waiting for operations to drain is tolerated and
    /// teardown continues; interruption while waiting for the endpoint to close
    /// fails with an interrupted I/O error. The token stays cancelled either way.
    pub async fn close_interruptibly(&self, interrupt: &CancellationToken) -> Result<(), Error> {
        self.inner.close_interruptibly(interrupt).await
    }
}

impl<H: ChannelAssociation> ClientInner<H> {
    async fn get_or_create_channel(&self) -> Result<ChannelHandle, Error> {
        let mut state = self.state.lock().await;
        let (endpoint, strategy) = match &mut *state {
            ClientState::Closed { .. } => {
                return Err(Error::closed(CLIENT_NAME));
            }
            ClientState::Open { endpoint, strategy } => (endpoint, strategy),
        };

        if let Some(strategy) = strategy.as_ref() {
            return strategy.channel().await;
        }

        // An endpoint left over from a failed creation is reused
        let created = match endpoint.clone() {
            Some(existing) => existing,
            None => {
                let name = self.configuration.endpoint_name();
                let created = self.factory.create_endpoint(name)?;
                *endpoint = Some(created.clone());
                created
            }
        };
        let configuration = ProtocolConnectionConfiguration::from_client_config(
            &self.configuration,
            created
        )?;
        debug!("Management client #{} connecting to {}", self.id, configuration.uri);

        let handler = self.handler.clone();
        let close_handler: CloseHandler = Arc::new(move |channel, cause| {
            handler.handle_channel_closed(channel, cause);
        });
        let params = StrategyParams {
            configuration,
            association: self.handler.clone(),
            callback_handler: self.configuration.callback_handler(),
            sasl_options: self.configuration.sasl_options().clone(),
            security_context: self.configuration.security_context(),
            close_handler,
        };

        let created = self.factory
            .create_strategy(params).await
            .map_err(Error::from_creation_failure)?;
        strategy.insert(created).channel().await
    }

    async fn close_interruptibly(&self, interrupt: &CancellationToken) -> Result<(), Error> {
        let mut state = self.state.clone().lock_owned().await;
        let (endpoint, strategy) = match &mut *state {
            ClientState::Closed { outcome } => {
                return outcome.clone();
            }
            ClientState::Open { endpoint, strategy } => (endpoint.take(), strategy.take()),
        };
        *state = ClientState::Closed { outcome: Ok(()) };
        self.closed.store(true, Ordering::SeqCst);
        leak::untrack(self.id);
        info!("Closing management client #{}", self.id);

        let teardown = Teardown {
            client_id: self.id,
            handler: self.handler.clone(),
            configuration: self.configuration.clone(),
            endpoint,
            strategy,
            interrupt: interrupt.clone(),
        };
        // The task owns the lock, so teardown finishes even if this future is dropped
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(teardown.run())
                .catch_unwind().await
                .unwrap_or_else(|payload| Err(Error::from_panic(payload)));
            record_outcome(&mut state, &outcome);
            outcome
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The guard was released without an outcome, record this failure instead
                let error = Error::Other(format!("Close of management client failed: {}", e));
                swallow(self.id, TeardownStep::Join, &error);
                record_outcome(&mut *self.state.lock().await, &Err(error.clone()));
                Err(error)
            }
        }
    }
}

fn record_outcome(state: &mut ClientState, result: &Result<(), Error>) {
    if let ClientState::Closed { outcome } = state {
        *outcome = result.clone();
    }
}

impl<H: ChannelAssociation> Drop for ManagementClient<H> {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }

        let report = LeakReport {
            client_id: self.inner.id,
            trace: self.inner.allocation.clone(),
        };
        self.inner.configuration.leak_reporter().report(&report);

        let inner = self.inner.clone();
        leak::close_detached(self.inner.id, move || async move {
            let never = CancellationToken::new();
            inner.close_interruptibly(&never).await
        });
    }
}
