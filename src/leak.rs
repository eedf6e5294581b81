//! Leak detection for management clients
//!
//! Every client records where it was created. A client dropped while still open
//! is reported through a [`LeakReporter`] with that allocation trace, and then
//! closed in the background. Debug builds additionally keep a registry of open
//! clients that can be audited with [`unclosed_clients`], e.g. before exiting.

use futures::future::{ BoxFuture, FutureExt };
use std::backtrace::{ Backtrace, BacktraceStatus };
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{ debug, error, warn };

use crate::errors::Error;

/// Where and when a client was created
pub struct AllocationTrace {
    location: &'static Location<'static>,
    thread: Option<String>,
    created_at: SystemTime,
    backtrace: Backtrace,
}

impl AllocationTrace {
    /// Capture the trace of the calling code.
    ///
    /// The backtrace is only resolved when `RUST_BACKTRACE` or `RUST_LIB_BACKTRACE`
    /// enables it; the caller location is always recorded.
    #[track_caller]
    pub fn capture() -> Self {
        Self {
            location: Location::caller(),
            thread: std::thread::current().name().map(str::to_string),
            created_at: SystemTime::now(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Source location of the construction site
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Name of the constructing thread, if it had one
    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for AllocationTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on thread {}", self.location, self.thread.as_deref().unwrap_or("<unnamed>"))?;
        if self.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\n{}", self.backtrace)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AllocationTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationTrace")
            .field("location", &self.location)
            .field("thread", &self.thread)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Diagnostic for a client dropped without being closed
#[derive(Debug, Clone)]
pub struct LeakReport {
    pub client_id: u64,
    pub trace: Arc<AllocationTrace>,
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "management client #{} was dropped without being closed; it was created at {}",
            self.client_id,
            self.trace
        )
    }
}

impl std::error::Error for LeakReport {}

/// Receives leak diagnostics
pub trait LeakReporter: Send + Sync {
    fn report(&self, report: &LeakReport);
}

/// Logs leaks at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLeakReporter;

impl LeakReporter for TracingLeakReporter {
    fn report(&self, report: &LeakReport) {
        error!(
            client = report.client_id,
            location = %report.trace.location(),
            "Leaked management client: {}",
            report
        );
    }
}

type DeferredClose = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), Error>> + Send>;

/// Close of a leaked client that has not started yet.
///
/// If it is dropped before being run, e.g. because the runtime it was spawned on
/// shut down first, the close moves to a helper thread.
struct PendingClose {
    client_id: u64,
    close: Option<DeferredClose>,
}

impl PendingClose {
    async fn run(mut self) {
        if let Some(close) = self.close.take() {
            if let Err(e) = close().await {
                warn!("Failed to close leaked management client #{}: {}", self.client_id, e);
            }
        }
    }
}

impl Drop for PendingClose {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            debug!("Runtime dropped close of leaked client #{}, closing on a helper thread", self.client_id);
            close_on_helper_thread(self.client_id, close);
        }
    }
}

/// Run a best-effort close of a leaked client without blocking the dropping thread
pub(crate) fn close_detached<F, Fut>(client_id: u64, close: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static
{
    let pending = PendingClose {
        client_id,
        close: Some(Box::new(move || close().boxed())),
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(pending.run());
        }
        // No runtime on this thread; dropping the pending close hands it to a helper thread
        Err(_) => drop(pending),
    }
}

fn close_on_helper_thread(client_id: u64, close: DeferredClose) {
    let spawned = std::thread::Builder
        ::new()
        .name(format!("leaked-client-{}-close", client_id))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!("Cannot close leaked management client #{}: {}", client_id, e);
                    return;
                }
            };
            if let Err(e) = runtime.block_on(close()) {
                warn!("Failed to close leaked management client #{}: {}", client_id, e);
            }
        });
    if let Err(e) = spawned {
        warn!("Cannot close leaked management client #{}: {}", client_id, e);
    }
}

#[cfg(debug_assertions)]
mod registry {
    use dashmap::DashMap;
    use std::sync::{ Arc, LazyLock };

    use super::AllocationTrace;

    static LIVE_CLIENTS: LazyLock<DashMap<u64, Arc<AllocationTrace>>> = LazyLock::new(DashMap::new);

    pub(crate) fn track(client_id: u64, trace: Arc<AllocationTrace>) {
        LIVE_CLIENTS.insert(client_id, trace);
    }

    pub(crate) fn untrack(client_id: u64) {
        LIVE_CLIENTS.remove(&client_id);
    }

    pub(crate) fn snapshot() -> Vec<(u64, Arc<AllocationTrace>)> {
        let mut clients: Vec<_> = LIVE_CLIENTS.iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        clients.sort_by_key(|(id, _)| *id);
        clients
    }
}

#[cfg(not(debug_assertions))]
mod registry {
    use std::sync::Arc;

    use super::AllocationTrace;

    pub(crate) fn track(_client_id: u64, _trace: Arc<AllocationTrace>) {}

    pub(crate) fn untrack(_client_id: u64) {}

    pub(crate) fn snapshot() -> Vec<(u64, Arc<AllocationTrace>)> {
        Vec::new()
    }
}

pub(crate) use registry::{ track, untrack };

/// Clients created in this process that are neither closed nor dropped.
///
/// Always empty in release builds.
pub fn unclosed_clients() -> Vec<(u64, Arc<AllocationTrace>)> {
    registry::snapshot()
}
