//! Management Protocol Client
//!
//! This crate provides a client for remote management endpoints. The client
//! connects lazily on first use, creates at most one connection strategy per
//! generation no matter how many tasks race for it, and closes exactly once:
//! it stops new work, cancels work in flight, releases the strategy, endpoint
//! and configuration resources, and waits for the transport to be gone.
//! Clients dropped without being closed are reported and closed in the background.

pub mod client;
pub mod config;
pub mod errors;
pub mod leak;
pub mod protocol;
pub mod transport;

// Re-export commonly used items
pub use client::{ ChannelAssociation, ChannelSupplier, ManagementChannelHandler, ManagementClient };
pub use config::{ ClientConfig, ClientConfigBuilder, ClientSettings };
pub use errors::Error;
pub use protocol::{ Protocol, ProtocolConnectionConfiguration };
pub use transport::{
    Channel,
    ChannelHandle,
    ConnectionStrategy,
    ConnectionStrategyFactory,
    Endpoint,
    LocalEndpoint,
    StrategyParams,
};
