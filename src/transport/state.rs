// Endpoint state module
//
// This module provides a shared state mechanism for endpoints to publish their
// close progress without lock contention.

use tokio::sync::watch;
use tracing::debug;

/// Represents the current state of an endpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EndpointState {
    /// Endpoint is accepting work
    #[default]
    Open,
    /// Close was requested, owned tasks are winding down
    Closing,
    /// All owned resources are released
    Closed,
}

impl EndpointState {
    /// Check whether close has been requested
    pub fn is_close_requested(&self) -> bool {
        !matches!(self, EndpointState::Open)
    }
}

/// Channel for watching and updating endpoint state
#[derive(Clone)]
pub struct EndpointStateChannel {
    /// Sender for updating the state
    tx: watch::Sender<EndpointState>,
}

impl EndpointStateChannel {
    /// Create a new endpoint state channel
    pub fn new() -> Self {
        let (tx, _) = watch::channel(EndpointState::default());
        Self { tx }
    }

    /// Get a receiver that can be cloned and shared
    pub fn receiver(&self) -> watch::Receiver<EndpointState> {
        self.tx.subscribe()
    }

    /// Move to `next` unless the state is already at or past it.
    ///
    /// Returns true when the state changed.
    pub fn advance(&self, next: EndpointState) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            let order = |s: &EndpointState| *s as u8;
            if order(state) < order(&next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Endpoint state advanced to {:?}", next);
        }
        changed
    }

    /// Get the current state
    pub fn current(&self) -> EndpointState {
        *self.tx.borrow()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for(&self, predicate: impl FnMut(&EndpointState) -> bool) {
        let mut rx = self.receiver();
        // The sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(predicate).await;
    }
}

impl Default for EndpointStateChannel {
    fn default() -> Self {
        Self::new()
    }
}
