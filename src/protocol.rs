//! Protocol connection configuration
//!
//! Translates a [`ClientConfig`] plus the endpoint of the current generation into
//! the settings a connection strategy factory needs to reach the target.

use serde::{ Deserialize, Serialize };
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::ClientConfig;
use crate::errors::Error;
use crate::transport::{ Endpoint, SaslOptions };

/// Management protocols a client can speak
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Native remoting
    #[serde(rename = "remote")]
    Remote,
    /// Remoting upgraded from HTTP (legacy name)
    #[serde(rename = "http-remoting")]
    HttpRemoting,
    /// Remoting upgraded from HTTPS (legacy name)
    #[serde(rename = "https-remoting")]
    HttpsRemoting,
    /// Remoting upgraded from HTTP
    #[default]
    #[serde(rename = "remote+http")]
    RemoteHttp,
    /// Remoting upgraded from HTTPS
    #[serde(rename = "remote+https")]
    RemoteHttps,
}

impl Protocol {
    /// URI scheme for this protocol
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Remote => "remote",
            Protocol::HttpRemoting => "http-remoting",
            Protocol::HttpsRemoting => "https-remoting",
            Protocol::RemoteHttp => "remote+http",
            Protocol::RemoteHttps => "remote+https",
        }
    }

    /// Port used when none is configured
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Remote => 9999,
            Protocol::HttpRemoting | Protocol::RemoteHttp => 9990,
            Protocol::HttpsRemoting | Protocol::RemoteHttps => 9993,
        }
    }

    /// Whether the protocol runs over TLS
    pub fn is_secure(&self) -> bool {
        matches!(self, Protocol::HttpsRemoting | Protocol::RemoteHttps)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote" => Ok(Protocol::Remote),
            "http-remoting" => Ok(Protocol::HttpRemoting),
            "https-remoting" => Ok(Protocol::HttpsRemoting),
            "remote+http" => Ok(Protocol::RemoteHttp),
            "remote+https" => Ok(Protocol::RemoteHttps),
            other => Err(Error::Configuration(format!("Unknown protocol: {}", other))),
        }
    }
}

/// Settings for one connection attempt
#[derive(Clone)]
pub struct ProtocolConnectionConfiguration {
    /// Target URI, e.g. `remote+http://localhost:9990`
    pub uri: Url,
    /// Endpoint owning the transport resources of this generation
    pub endpoint: Arc<dyn Endpoint>,
    /// Connection establishment timeout
    pub connection_timeout: Duration,
    /// Local address to bind outgoing connections to
    pub client_bind_address: Option<String>,
    /// Protocol options
    pub options: SaslOptions,
}

impl ProtocolConnectionConfiguration {
    /// Build the configuration for `endpoint` from the client configuration
    pub fn from_client_config(
        config: &ClientConfig,
        endpoint: Arc<dyn Endpoint>
    ) -> Result<Self, Error> {
        let uri = target_uri(config.protocol(), config.host(), config.port())?;
        Ok(Self {
            uri,
            endpoint,
            connection_timeout: config.connection_timeout(),
            client_bind_address: config.client_bind_address().map(str::to_string),
            options: config.sasl_options().clone(),
        })
    }
}

impl fmt::Debug for ProtocolConnectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolConnectionConfiguration")
            .field("uri", &self.uri.as_str())
            .field("endpoint", &self.endpoint.name())
            .field("connection_timeout", &self.connection_timeout)
            .field("client_bind_address", &self.client_bind_address)
            .finish()
    }
}

/// Build the target URI, bracketing bare IPv6 literals
fn target_uri(protocol: Protocol, host: &str, port: u16) -> Result<Url, Error> {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    let raw = format!("{}://{}:{}", protocol.scheme(), host, port);
    Url::parse(&raw).map_err(|e| Error::Configuration(format!("Invalid target {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalEndpoint;

    #[test]
    fn protocol_names_round_trip_through_from_str() {
        for protocol in [
            Protocol::Remote,
            Protocol::HttpRemoting,
            Protocol::HttpsRemoting,
            Protocol::RemoteHttp,
            Protocol::RemoteHttps,
        ] {
            assert_eq!(protocol.to_string().parse::<Protocol>().unwrap(), protocol);
        }
        assert!("ftp".parse::<Protocol>().is_err());
    }

    #[test]
    fn configuration_targets_configured_host() {
        let config = ClientConfig::builder()
            .host("mgmt.example.org")
            .port(19990)
            .connection_timeout(Duration::from_secs(3))
            .client_bind_address("10.0.0.5")
            .sasl_option("SASL_DISALLOWED_MECHANISMS", "JBOSS-LOCAL-USER")
            .build()
            .unwrap();
        let endpoint: Arc<dyn Endpoint> = Arc::new(LocalEndpoint::new("management-client"));

        let conf = ProtocolConnectionConfiguration::from_client_config(&config, endpoint).unwrap();
        assert_eq!(conf.uri.scheme(), "remote+http");
        assert_eq!(conf.uri.host_str(), Some("mgmt.example.org"));
        assert_eq!(conf.uri.port(), Some(19990));
        assert_eq!(conf.connection_timeout, Duration::from_secs(3));
        assert_eq!(conf.client_bind_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(
            conf.options.get("SASL_DISALLOWED_MECHANISMS").map(String::as_str),
            Some("JBOSS-LOCAL-USER")
        );
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let uri = target_uri(Protocol::Remote, "::1", 9999).unwrap();
        assert_eq!(uri.host_str(), Some("[::1]"));
        assert_eq!(uri.port(), Some(9999));
    }
}
