//! Management Client Configuration
//!
//! [`ClientConfig`] describes where and how to connect, and owns the disposable
//! resources (an executor runtime, registered disposers) that a client releases
//! when it closes. Plain settings can also be loaded from JSON.

use serde::{ Deserialize, Serialize };
use std::fmt;
use std::panic::{ self, AssertUnwindSafe };
use std::path::Path;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex, PoisonError };
use std::time::Duration;
use tokio::runtime::{ Handle, Runtime };
use tracing::debug;

use crate::errors::Error;
use crate::leak::{ LeakReporter, TracingLeakReporter };
use crate::protocol::Protocol;
use crate::transport::{ CallbackHandler, SaslOptions, SecurityContext, StaticCredentials };

/// Default connection timeout in seconds
const DEFAULT_CONNECTION_TIMEOUT: u64 = 5;

/// Default time close waits for cancelled operations to drain, in milliseconds
const DEFAULT_COMPLETION_TIMEOUT: u64 = 1000;

/// Default endpoint name
const DEFAULT_ENDPOINT_NAME: &str = "management-client";

type Disposer = Box<dyn FnOnce() -> Result<(), Error> + Send>;

/// Where request execution is spawned
enum Executor {
    /// The runtime of whoever calls
    Caller,
    /// A runtime owned by someone else
    External(Handle),
    /// A runtime owned by this configuration, shut down on release
    Dedicated {
        handle: Handle,
        runtime: Mutex<Option<Runtime>>,
    },
}

struct ConfigInner {
    protocol: Protocol,
    host: String,
    port: u16,
    connection_timeout: Duration,
    completion_timeout: Duration,
    client_bind_address: Option<String>,
    endpoint_name: String,
    callback_handler: Option<Arc<dyn CallbackHandler>>,
    sasl_options: SaslOptions,
    security_context: Option<Arc<dyn SecurityContext>>,
    executor: Executor,
    leak_reporter: Arc<dyn LeakReporter>,
    disposers: Mutex<Vec<Disposer>>,
    released: AtomicBool,
}

impl Drop for ConfigInner {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics, shut it down in the background instead
        if let Executor::Dedicated { runtime, .. } = &mut self.executor {
            let runtime = runtime.get_mut().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(runtime) = runtime {
                runtime.shutdown_background();
            }
        }
    }
}

/// Configuration for a management client; clones share resources
#[derive(Clone)]
pub struct ClientConfig {
    inner: Arc<ConfigInner>,
}

impl ClientConfig {
    /// Start building a configuration
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Configuration targeting `host:port` with everything else defaulted
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, Error> {
        Self::builder().host(host).port(port).build()
    }

    /// Load settings from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let settings: ClientSettings = serde_json::from_str(json)?;
        settings.into_builder()?.build()
    }

    /// Load settings from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn connection_timeout(&self) -> Duration {
        self.inner.connection_timeout
    }

    /// Upper bound on the wait for cancelled operations during close
    pub fn completion_timeout(&self) -> Duration {
        self.inner.completion_timeout
    }

    pub fn client_bind_address(&self) -> Option<&str> {
        self.inner.client_bind_address.as_deref()
    }

    pub fn endpoint_name(&self) -> &str {
        &self.inner.endpoint_name
    }

    pub fn callback_handler(&self) -> Option<Arc<dyn CallbackHandler>> {
        self.inner.callback_handler.clone()
    }

    pub fn sasl_options(&self) -> &SaslOptions {
        &self.inner.sasl_options
    }

    pub fn security_context(&self) -> Option<Arc<dyn SecurityContext>> {
        self.inner.security_context.clone()
    }

    /// Runtime to spawn asynchronous requests on, `None` meaning the caller's
    pub fn executor(&self) -> Option<Handle> {
        match &self.inner.executor {
            Executor::Caller => None,
            Executor::External(handle) => Some(handle.clone()),
            Executor::Dedicated { handle, .. } => Some(handle.clone()),
        }
    }

    pub fn leak_reporter(&self) -> Arc<dyn LeakReporter> {
        self.inner.leak_reporter.clone()
    }

    /// Register a cleanup action run once on [`ClientConfig::release`]
    pub fn on_release<F>(&self, disposer: F) -> Result<(), Error>
        where F: FnOnce() -> Result<(), Error> + Send + 'static
    {
        let mut disposers = self.inner.disposers.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_released() {
            return Err(Error::closed("ClientConfig"));
        }
        disposers.push(Box::new(disposer));
        Ok(())
    }

    /// Whether resources were already released
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Release disposable resources.
    ///
    /// Idempotent. Every disposer runs even if an earlier one fails; the first
    /// failure is returned.
    pub fn release(&self) -> Result<(), Error> {
        let disposers = {
            let mut disposers = self.inner.disposers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.released.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            std::mem::take(&mut *disposers)
        };

        if let Executor::Dedicated { runtime, .. } = &self.inner.executor {
            let runtime = runtime.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(runtime) = runtime {
                debug!("Shutting down dedicated client executor");
                runtime.shutdown_background();
            }
        }

        let mut first_error = None;
        for disposer in disposers {
            let result = panic::catch_unwind(AssertUnwindSafe(disposer)).unwrap_or_else(|payload| {
                Err(Error::from_panic(payload))
            });
            if let Err(e) = result {
                debug!("Configuration disposer failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("protocol", &self.inner.protocol)
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("connection_timeout", &self.inner.connection_timeout)
            .field("completion_timeout", &self.inner.completion_timeout)
            .field("endpoint_name", &self.inner.endpoint_name)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

/// Serializable subset of the configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientSettings {
    pub protocol: Option<Protocol>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connection_timeout_ms: Option<u64>,
    pub completion_timeout_ms: Option<u64>,
    pub client_bind_address: Option<String>,
    pub endpoint_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sasl_options: SaslOptions,
}

impl ClientSettings {
    /// Turn the settings into a builder that can be refined further.
    ///
    /// Fails if only one of `username` and `password` is set.
    pub fn into_builder(self) -> Result<ClientConfigBuilder, Error> {
        let mut builder = ClientConfig::builder();
        if let Some(protocol) = self.protocol {
            builder = builder.protocol(protocol);
        }
        if let Some(host) = self.host {
            builder = builder.host(host);
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(ms) = self.connection_timeout_ms {
            builder = builder.connection_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.completion_timeout_ms {
            builder = builder.completion_timeout(Duration::from_millis(ms));
        }
        if let Some(address) = self.client_bind_address {
            builder = builder.client_bind_address(address);
        }
        if let Some(name) = self.endpoint_name {
            builder = builder.endpoint_name(name);
        }
        match (self.username, self.password) {
            (Some(username), Some(password)) => {
                builder = builder.credentials(username, password);
            }
            (None, None) => {}
            (Some(_), None) => {
                return Err(Error::Configuration("Username given without a password".to_string()));
            }
            (None, Some(_)) => {
                return Err(Error::Configuration("Password given without a username".to_string()));
            }
        }
        for (key, value) in self.sasl_options {
            builder = builder.sasl_option(key, value);
        }
        Ok(builder)
    }
}

/// Builder for creating ClientConfig instances
pub struct ClientConfigBuilder {
    protocol: Protocol,
    host: String,
    port: Option<u16>,
    connection_timeout: Duration,
    completion_timeout: Duration,
    client_bind_address: Option<String>,
    endpoint_name: String,
    callback_handler: Option<Arc<dyn CallbackHandler>>,
    sasl_options: SaslOptions,
    security_context: Option<Arc<dyn SecurityContext>>,
    executor: Option<Handle>,
    dedicated_threads: Option<usize>,
    leak_reporter: Arc<dyn LeakReporter>,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            host: "localhost".to_string(),
            port: None,
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT),
            completion_timeout: Duration::from_millis(DEFAULT_COMPLETION_TIMEOUT),
            client_bind_address: None,
            endpoint_name: DEFAULT_ENDPOINT_NAME.to_string(),
            callback_handler: None,
            sasl_options: SaslOptions::new(),
            security_context: None,
            executor: None,
            dedicated_threads: None,
            leak_reporter: Arc::new(TracingLeakReporter),
        }
    }
}

impl ClientConfigBuilder {
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port; defaults to the protocol's port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set how long close waits for cancelled operations to drain
    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn client_bind_address(mut self, address: impl Into<String>) -> Self {
        self.client_bind_address = Some(address.into());
        self
    }

    pub fn endpoint_name(mut self, name: impl Into<String>) -> Self {
        self.endpoint_name = name.into();
        self
    }

    pub fn callback_handler(mut self, handler: Arc<dyn CallbackHandler>) -> Self {
        self.callback_handler = Some(handler);
        self
    }

    /// Authenticate with fixed credentials
    pub fn credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.callback_handler(Arc::new(StaticCredentials::new(username, password)))
    }

    pub fn sasl_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.sasl_options.insert(key.into(), value.into());
        self
    }

    pub fn security_context(mut self, context: Arc<dyn SecurityContext>) -> Self {
        self.security_context = Some(context);
        self
    }

    /// Spawn asynchronous requests on an existing runtime
    pub fn executor(mut self, handle: Handle) -> Self {
        self.executor = Some(handle);
        self.dedicated_threads = None;
        self
    }

    /// Spawn asynchronous requests on a runtime owned by the configuration
    pub fn dedicated_executor(mut self, worker_threads: usize) -> Self {
        self.dedicated_threads = Some(worker_threads);
        self.executor = None;
        self
    }

    pub fn leak_reporter(mut self, reporter: Arc<dyn LeakReporter>) -> Self {
        self.leak_reporter = reporter;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<ClientConfig, Error> {
        if self.host.trim().is_empty() {
            return Err(Error::Configuration("Host must not be empty".to_string()));
        }
        if self.completion_timeout.is_zero() {
            return Err(Error::Configuration("Completion timeout must be positive".to_string()));
        }
        if self.endpoint_name.is_empty() {
            return Err(Error::Configuration("Endpoint name must not be empty".to_string()));
        }

        let executor = match (self.executor, self.dedicated_threads) {
            (Some(handle), _) => Executor::External(handle),
            (None, Some(threads)) => {
                let runtime = tokio::runtime::Builder
                    ::new_multi_thread()
                    .worker_threads(threads.max(1))
                    .thread_name(format!("{}-executor", self.endpoint_name))
                    .enable_all()
                    .build()?;
                Executor::Dedicated {
                    handle: runtime.handle().clone(),
                    runtime: Mutex::new(Some(runtime)),
                }
            }
            (None, None) => Executor::Caller,
        };

        Ok(ClientConfig {
            inner: Arc::new(ConfigInner {
                protocol: self.protocol,
                port: self.port.unwrap_or_else(|| self.protocol.default_port()),
                host: self.host,
                connection_timeout: self.connection_timeout,
                completion_timeout: self.completion_timeout,
                client_bind_address: self.client_bind_address,
                endpoint_name: self.endpoint_name,
                callback_handler: self.callback_handler,
                sasl_options: self.sasl_options,
                security_context: self.security_context,
                executor,
                leak_reporter: self.leak_reporter,
                disposers: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
            }),
        })
    }
}
