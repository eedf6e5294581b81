//! Transport boundary for the management client
//!
//! This module defines the traits the client needs from the transport library:
//! channels, connection strategies and the factory that builds them, plus the
//! opaque authentication and security values passed through to that factory.
pub mod endpoint;
pub mod state;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::client::association::ChannelAssociation;
use crate::errors::Error;
use crate::protocol::ProtocolConnectionConfiguration;
pub use endpoint::{ Endpoint, LocalEndpoint };

/// SASL mechanism options, passed through untouched
pub type SaslOptions = BTreeMap<String, String>;

/// An open bidirectional communication path over an established connection
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// Identity of this channel, stable for its lifetime
    fn id(&self) -> Uuid;

    /// Whether the channel still accepts traffic
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self) -> Result<(), Error>;
}

/// Shared handle to a channel
pub type ChannelHandle = Arc<dyn Channel>;

/// Callback invoked when a channel closes; the error is set for abnormal closure
pub type CloseHandler = Arc<dyn Fn(&ChannelHandle, Option<Error>) + Send + Sync>;

/// Owns how and when a channel is obtained, including reconnection
#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    /// Get the current channel, connecting if needed
    async fn channel(&self) -> Result<ChannelHandle, Error>;

    /// Close the channel and the connection underneath it
    async fn close(&self) -> Result<(), Error>;
}

/// Credentials supplied by a [`CallbackHandler`]
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credential callback consulted during authentication
pub trait CallbackHandler: Send + Sync + fmt::Debug {
    /// Credentials for the given realm, if any are known
    fn credentials(&self, realm: Option<&str>) -> Option<Credentials>;
}

/// A callback handler that always answers with the same credentials
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self(Credentials {
            username: username.into(),
            password: password.into(),
        })
    }
}

impl CallbackHandler for StaticCredentials {
    fn credentials(&self, _realm: Option<&str>) -> Option<Credentials> {
        Some(self.0.clone())
    }
}

/// Transport security context, opaque to the client
pub trait SecurityContext: Send + Sync + fmt::Debug {
    /// Name of the security protocol, e.g. "TLSv1.3"
    fn protocol(&self) -> &str;
}

/// Everything a factory needs to build a connection strategy
pub struct StrategyParams {
    /// Target and timeouts derived from the client configuration
    pub configuration: ProtocolConnectionConfiguration,
    /// Handler that receives traffic arriving on created channels
    pub association: Arc<dyn ChannelAssociation>,
    /// Credential callback
    pub callback_handler: Option<Arc<dyn CallbackHandler>>,
    /// SASL options
    pub sasl_options: SaslOptions,
    /// Transport security context
    pub security_context: Option<Arc<dyn SecurityContext>>,
    /// Must be invoked whenever a channel created by the strategy closes
    pub close_handler: CloseHandler,
}

/// Builds endpoints and connection strategies for a client
#[async_trait]
pub trait ConnectionStrategyFactory: Send + Sync {
    /// Create the endpoint that owns the transport resources of one generation
    fn create_endpoint(&self, name: &str) -> Result<Arc<dyn Endpoint>, Error> {
        Ok(Arc::new(LocalEndpoint::new(name)))
    }

    /// Create a strategy; errors that are not crate errors get wrapped by the caller
    async fn create_strategy(
        &self,
        params: StrategyParams
    ) -> anyhow::Result<Box<dyn ConnectionStrategy>>;
}
