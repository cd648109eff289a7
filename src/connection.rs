use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tracing::debug;

use crate::error::Status;
use crate::ids::EndpointId;
use crate::manager::NearbyConnectionsManager;

/// A held OS sleep-prevention token; dropping it releases the hold.
pub trait WakeLease: Send + Sync {}

/// Acquires OS "prevent sleep" tokens for the lifetime of a connection.
pub trait WakeLockProvider: Send + Sync {
    /// Acquires a lease labeled for diagnostics.
    fn acquire(&self, label: &str) -> Box<dyn WakeLease>;
}

/// Provider used when the platform offers no sleep control.
#[derive(Debug, Default)]
pub struct NoopWakeLockProvider;

struct NoopLease;

impl WakeLease for NoopLease {}

impl WakeLockProvider for NoopWakeLockProvider {
    fn acquire(&self, _label: &str) -> Box<dyn WakeLease> {
        Box::new(NoopLease)
    }
}

/// The per-endpoint byte pipe handed to clients.
///
/// Reads drain control-frame blobs queued by the connections manager; writes
/// ship byte payloads to the endpoint. The connection holds a wake lease for
/// its lifetime and runs its disconnect listener exactly once.
pub struct NearbyConnection {
    endpoint_id: EndpointId,
    manager: Weak<NearbyConnectionsManager>,
    reads: Mutex<VecDeque<Vec<u8>>>,
    read_ready: Notify,
    closed: AtomicBool,
    disconnect_listener: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    _wake_lease: Box<dyn WakeLease>,
}

impl PartialEq for NearbyConnection {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint_id == other.endpoint_id
    }
}

impl NearbyConnection {
    pub(crate) fn new(
        endpoint_id: EndpointId,
        manager: Weak<NearbyConnectionsManager>,
        wake_lease: Box<dyn WakeLease>,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint_id,
            manager,
            reads: Mutex::new(VecDeque::new()),
            read_ready: Notify::new(),
            closed: AtomicBool::new(false),
            disconnect_listener: Mutex::new(None),
            _wake_lease: wake_lease,
        })
    }

    /// Returns the endpoint this pipe is bound to.
    #[must_use]
    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint_id
    }

    /// Returns the next queued blob, waiting when none is available.
    ///
    /// Returns `None` once the connection is closed and drained.
    pub async fn read(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut reads = self.reads.lock().expect("read queue poisoned");
                if let Some(bytes) = reads.pop_front() {
                    return Some(bytes);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.read_ready.notified().await;
        }
    }

    /// Ships `bytes` to the endpoint as a byte payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection or its manager is gone.
    pub fn write(&self, bytes: Vec<u8>) -> Result<(), Status> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Status::NotConnectedToEndpoint);
        }
        let Some(manager) = self.manager.upgrade() else {
            return Err(Status::Reset);
        };
        manager.send(
            &self.endpoint_id,
            crate::payload::Payload::from_bytes(bytes),
            None,
        );
        Ok(())
    }

    /// Installs the listener run once when the connection goes away.
    pub fn set_disconnect_listener(&self, listener: impl FnOnce() + Send + 'static) {
        *self
            .disconnect_listener
            .lock()
            .expect("listener slot poisoned") = Some(Box::new(listener));
    }

    /// Disconnects from the endpoint. Repeated calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(endpoint_id = %self.endpoint_id, "connection closed by client");
        self.read_ready.notify_waiters();
        self.run_disconnect_listener();
        if let Some(manager) = self.manager.upgrade() {
            manager.disconnect(&self.endpoint_id).await;
        }
    }

    /// Queues a control blob for [`Self::read`].
    pub(crate) fn push_read(&self, bytes: Vec<u8>) {
        self.reads
            .lock()
            .expect("read queue poisoned")
            .push_back(bytes);
        self.read_ready.notify_waiters();
    }

    /// Marks the connection closed from the manager side.
    pub(crate) fn handle_remote_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.read_ready.notify_waiters();
        self.run_disconnect_listener();
    }

    fn run_disconnect_listener(&self) {
        let listener = self
            .disconnect_listener
            .lock()
            .expect("listener slot poisoned")
            .take();
        if let Some(listener) = listener {
            listener();
        }
    }
}

impl std::fmt::Debug for NearbyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NearbyConnection")
            .field("endpoint_id", &self.endpoint_id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
