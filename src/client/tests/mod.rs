//! Tests for the management client
//!
//! The collaborators are replaced by recording mocks so that tests can assert on
//! how often strategies are created and in which order teardown touches them.


use async_trait::async_trait;
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
use std::sync::{ Arc, Mutex };
use std::time::Duration;
use uuid::Uuid;

use crate::client::association::ChannelAssociation;
use crate::config::ClientConfig;
use crate::errors::Error;
use crate::leak::{ LeakReport, LeakReporter };
use crate::transport::{
    Channel,
    ChannelHandle,
    CloseHandler,
    ConnectionStrategy,
    ConnectionStrategyFactory,
    Endpoint,
    LocalEndpoint,
    StrategyParams,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Ordered record of collaborator calls
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<&'static str>>>);

impl EventLog {
    fn push(&self, event: &'static str) {
        self.0.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| **e == event).count()
    }
}

/// Poll `condition` until it holds or a second has passed
async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Configuration whose release is recorded in `log`
fn recorded_config(log: &EventLog, completion_timeout: Duration) -> ClientConfig {
    let config = ClientConfig::builder().completion_timeout(completion_timeout).build().unwrap();
    let log = log.clone();
    config
        .on_release(move || {
            log.push("config.release");
            Ok(())
        })
        .unwrap();
    config
}

#[derive(Debug)]
struct MockChannel {
    id: Uuid,
    open: AtomicBool,
}

impl MockChannel {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn id(&self) -> Uuid {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), Error> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MockStrategy {
    channel: ChannelHandle,
    log: EventLog,
    close_delay: Duration,
}

#[async_trait]
impl ConnectionStrategy for MockStrategy {
    async fn channel(&self) -> Result<ChannelHandle, Error> {
        Ok(self.channel.clone())
    }

    async fn close(&self) -> Result<(), Error> {
        tokio::time::sleep(self.close_delay).await;
        self.log.push("strategy.close");
        self.channel.close().await
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EndpointBehavior {
    /// Closes like a [`LocalEndpoint`]
    Local,
    /// Has no asynchronous close
    Unsupported,
    /// Never finishes closing
    NeverCloses,
    /// Panics while waiting to close
    PanicsWhileClosing,
}

struct MockEndpoint {
    log: EventLog,
    behavior: EndpointBehavior,
    local: LocalEndpoint,
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn name(&self) -> &str {
        self.local.name()
    }

    fn close_async(&self) -> Result<(), Error> {
        self.log.push("endpoint.close_async");
        match self.behavior {
            EndpointBehavior::Unsupported => {
                Err(Error::UnsupportedOperation("closeAsync".to_string()))
            }
            _ => self.local.close_async(),
        }
    }

    async fn await_closed(&self) {
        self.log.push("endpoint.await_closed");
        match self.behavior {
            EndpointBehavior::Local => self.local.await_closed().await,
            EndpointBehavior::Unsupported => {}
            EndpointBehavior::NeverCloses => futures::future::pending::<()>().await,
            EndpointBehavior::PanicsWhileClosing => panic!("endpoint {} lost its tasks", self.name()),
        }
    }
}

/// Failure a [`MockFactory`] reports instead of creating a strategy
#[derive(Clone, Copy)]
enum CreationFailure {
    Foreign,
    Crate,
}

struct MockFactory {
    log: EventLog,
    creations: AtomicUsize,
    endpoints: AtomicUsize,
    create_delay: Duration,
    strategy_close_delay: Duration,
    endpoint_behavior: EndpointBehavior,
    failure: Mutex<Option<CreationFailure>>,
    close_handlers: Mutex<Vec<(ChannelHandle, CloseHandler)>>,
}

impl MockFactory {
    fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            creations: AtomicUsize::new(0),
            endpoints: AtomicUsize::new(0),
            create_delay: Duration::ZERO,
            strategy_close_delay: Duration::ZERO,
            endpoint_behavior: EndpointBehavior::Local,
            failure: Mutex::new(None),
            close_handlers: Mutex::new(Vec::new()),
        }
    }

    fn create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    fn strategy_close_delay(mut self, delay: Duration) -> Self {
        self.strategy_close_delay = delay;
        self
    }

    fn endpoint_behavior(mut self, behavior: EndpointBehavior) -> Self {
        self.endpoint_behavior = behavior;
        self
    }

    fn fail_with(self, failure: Option<CreationFailure>) -> Self {
        *self.failure.lock().unwrap() = failure;
        self
    }

    fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    fn endpoints(&self) -> usize {
        self.endpoints.load(Ordering::SeqCst)
    }

    /// Report every created channel as closed by the peer
    fn fire_channel_closed(&self, cause: &str) {
        let handlers = self.close_handlers.lock().unwrap().clone();
        for (channel, handler) in handlers {
            handler(&channel, Some(Error::Transport(cause.to_string())));
        }
    }
}

#[async_trait]
impl ConnectionStrategyFactory for MockFactory {
    fn create_endpoint(&self, name: &str) -> Result<Arc<dyn Endpoint>, Error> {
        self.endpoints.fetch_add(1, Ordering::SeqCst);
        Ok(
            Arc::new(MockEndpoint {
                log: self.log.clone(),
                behavior: self.endpoint_behavior,
                local: LocalEndpoint::new(name),
            })
        )
    }

    async fn create_strategy(
        &self,
        params: StrategyParams
    ) -> anyhow::Result<Box<dyn ConnectionStrategy>> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        self.log.push("factory.create");
        tokio::time::sleep(self.create_delay).await;

        let failure = *self.failure.lock().unwrap();
        match failure {
            Some(CreationFailure::Foreign) => {
                return Err(
                    anyhow::Error::new(
                        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")
                    )
                );
            }
            Some(CreationFailure::Crate) => {
                return Err(Error::Timeout("handshake".to_string()).into());
            }
            None => {}
        }

        let channel: ChannelHandle = Arc::new(MockChannel::new());
        self.close_handlers.lock().unwrap().push((channel.clone(), params.close_handler));
        Ok(
            Box::new(MockStrategy {
                channel,
                log: self.log.clone(),
                close_delay: self.strategy_close_delay,
            })
        )
    }
}

/// Channel association that records calls and can refuse to drain
struct RecordingAssociation {
    log: EventLog,
    never_drains: bool,
}

#[async_trait]
impl ChannelAssociation for RecordingAssociation {
    fn shutdown(&self) {
        self.log.push("handler.shutdown");
    }

    fn shutdown_now(&self) {
        self.log.push("handler.shutdown_now");
    }

    async fn await_completion(&self, _timeout: Duration) -> bool {
        self.log.push("handler.await_completion");
        if self.never_drains {
            futures::future::pending::<()>().await;
        }
        true
    }

    fn handle_channel_closed(&self, _channel: &ChannelHandle, _cause: Option<Error>) {
        self.log.push("handler.channel_closed");
    }
}

/// Leak reporter that keeps every report
#[derive(Default)]
struct CollectingLeakReporter {
    reports: Mutex<Vec<LeakReport>>,
}

impl CollectingLeakReporter {
    fn reports(&self) -> Vec<LeakReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl LeakReporter for CollectingLeakReporter {
    fn report(&self, report: &LeakReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}
