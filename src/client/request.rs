//! Management Client Operation Tracking
//!
//! This module tracks the operations currently in flight on a channel
//! association: it admits or rejects new operations, cancels them individually
//! or in bulk, and lets callers wait until all of them have drained.

use std::collections::HashMap;
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::time::Duration;
use tokio::sync::{ oneshot, watch };
use tokio::time::timeout;
use tracing::{ debug, warn };
use uuid::Uuid;

use crate::errors::Error;

/// Identifier of a tracked operation
pub type OperationId = u64;

struct ActiveOperation {
    /// Channel the operation runs on, once known
    channel: Option<Uuid>,
    /// Fires with the reason the operation was cancelled
    cancel: oneshot::Sender<Error>,
}

struct Operations {
    accepting: bool,
    active: HashMap<OperationId, ActiveOperation>,
}

/// Tracker for operations in flight
pub struct OperationTracker {
    /// Counter for generating operation IDs
    next_id: AtomicU64,
    /// Admission flag and active operations
    operations: Mutex<Operations>,
    /// Number of active operations, for drain waiters
    active_count: watch::Sender<usize>,
}

impl OperationTracker {
    /// Create a new tracker that admits operations
    pub fn new() -> Self {
        let (active_count, _) = watch::channel(0);
        Self {
            next_id: AtomicU64::new(1),
            operations: Mutex::new(Operations {
                accepting: true,
                active: HashMap::new(),
            }),
            active_count,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Operations> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new operation.
    ///
    /// Fails with [`Error::Closed`] once the tracker stopped admitting. The ticket
    /// unregisters the operation when dropped; the receiver fires if the operation
    /// is cancelled first.
    pub fn register(
        self: &Arc<Self>
    ) -> Result<(OperationTicket, oneshot::Receiver<Error>), Error> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut operations = self.lock();
            if !operations.accepting {
                return Err(Error::closed("ManagementChannelHandler"));
            }
            operations.active.insert(id, ActiveOperation {
                channel: None,
                cancel: tx,
            });
            self.active_count.send_modify(|count| {
                *count += 1;
            });
        }
        debug!("Registered operation {}", id);
        Ok((OperationTicket { id, tracker: self.clone() }, rx))
    }

    /// Record the channel an operation runs on
    pub fn bind_channel(&self, id: OperationId, channel: Uuid) {
        if let Some(operation) = self.lock().active.get_mut(&id) {
            operation.channel = Some(channel);
        }
    }

    /// Stop admitting operations; running ones are unaffected
    pub fn stop_accepting(&self) {
        self.lock().accepting = false;
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Cancel every active operation, returning how many were cancelled
    pub fn cancel_all(&self, reason: &Error) -> usize {
        self.cancel_where(|_| true, reason)
    }

    /// Cancel the operations bound to `channel`
    pub fn cancel_channel(&self, channel: Uuid, reason: &Error) -> usize {
        self.cancel_where(|operation| operation.channel == Some(channel), reason)
    }

    fn cancel_where<P>(&self, predicate: P, reason: &Error) -> usize
        where P: Fn(&ActiveOperation) -> bool
    {
        let cancelled: Vec<_> = {
            let mut operations = self.lock();
            let ids: Vec<_> = operations.active
                .iter()
                .filter(|&(_, operation)| predicate(operation))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| operations.active.remove(&id).map(|op| (id, op)))
                .collect()
        };

        let count = cancelled.len();
        for (id, operation) in cancelled {
            if operation.cancel.send(reason.clone()).is_err() {
                warn!("Operation {} finished before its cancellation was delivered", id);
            }
        }
        // Tickets of cancelled operations still hold the count until dropped
        count
    }

    /// Number of operations whose tickets are still alive
    pub fn active(&self) -> usize {
        *self.active_count.borrow()
    }

    /// Wait up to `limit` for all tickets to be dropped
    pub async fn await_drained(&self, limit: Duration) -> bool {
        let mut rx = self.active_count.subscribe();
        matches!(timeout(limit, rx.wait_for(|count| *count == 0)).await, Ok(Ok(_)))
    }

    fn finish(&self, id: OperationId) {
        self.lock().active.remove(&id);
        self.active_count.send_modify(|count| {
            *count = count.saturating_sub(1);
        });
        debug!("Operation {} finished", id);
    }
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration of one operation; dropping it marks the operation finished
pub struct OperationTicket {
    id: OperationId,
    tracker: Arc<OperationTracker>,
}

impl OperationTicket {
    pub fn id(&self) -> OperationId {
        self.id
    }
}

impl Drop for OperationTicket {
    fn drop(&mut self) {
        self.tracker.finish(self.id);
    }
}
