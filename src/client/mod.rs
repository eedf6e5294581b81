//! Management Client
//!
//! This module provides the management client together with the default channel
//! association handler it routes requests through.

// Export submodules
pub mod association;
pub mod client;
pub mod request;
pub mod teardown;

// Re-export key types for easier access
pub use association::{ ChannelAssociation, ChannelSupplier, ManagementChannelHandler };
pub use client::ManagementClient;
pub use request::{ OperationId, OperationTicket, OperationTracker };
pub use teardown::TeardownStep;

#[cfg(test)]
mod tests;
