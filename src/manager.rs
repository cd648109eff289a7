use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{
    AdvertisingOptions, ConnectionOptions, DataUsage, DiscoveryOptions, FeatureFlags,
    INITIATE_CONNECTION_TIMEOUT, MINIMUM_ADVERTISEMENT_SIZE, PowerLevel, TransportType,
};
use crate::connection::{NearbyConnection, WakeLockProvider};
use crate::endpoint_manager::ConnectionInfo;
use crate::error::Status;
use crate::ids::{EndpointId, PayloadId};
use crate::medium::{DiscoveredPeer, Medium};
use crate::payload::{Payload, PayloadKind, PayloadStatus, PayloadStatusListener, PayloadTransferUpdate};
use crate::service::{ConnectionsService, ServiceDelegate};
use crate::transfer_manager::TransferManager;

const BT_MAC_LEN: usize = 6;

/// Receives incoming connections while advertising.
pub trait IncomingConnectionListener: Send + Sync {
    fn on_incoming_connection(
        &self,
        endpoint_id: &EndpointId,
        endpoint_info: &[u8],
        connection: Arc<NearbyConnection>,
    );
}

/// Receives discovery results.
pub trait DiscoveryListener: Send + Sync {
    fn on_endpoint_discovered(&self, endpoint_id: &EndpointId, endpoint_info: &[u8]);
    fn on_endpoint_lost(&self, endpoint_id: &EndpointId);
}

struct PendingOutgoing {
    sender: oneshot::Sender<Option<Arc<NearbyConnection>>>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    advertising_listener: Option<Arc<dyn IncomingConnectionListener>>,
    discovery_listener: Option<Arc<dyn DiscoveryListener>>,
    discovered_ids: HashSet<EndpointId>,
    pending_outgoing: HashMap<EndpointId, PendingOutgoing>,
    connection_status: HashMap<EndpointId, Status>,
    endpoint_infos: HashMap<EndpointId, Vec<u8>>,
    connections: HashMap<EndpointId, Arc<NearbyConnection>>,
    connection_transport: HashMap<EndpointId, TransportType>,
    // Weak on purpose: a client that drops its listener object silently
    // unsubscribes every payload id it was registered under.
    payload_listeners: HashMap<PayloadId, std::sync::Weak<dyn PayloadStatusListener>>,
    incoming_payloads: HashMap<PayloadId, Payload>,
    incoming_file_paths: HashMap<PayloadId, PathBuf>,
    unknown_file_paths_to_delete: HashSet<PathBuf>,
    cancels_sent: HashSet<PayloadId>,
    transfer_managers: HashMap<EndpointId, Arc<TransferManager>>,
    upgraded_mediums: HashMap<EndpointId, Medium>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedSettings {
    custom_save_path: Option<PathBuf>,
}

/// Client-facing orchestrator over the connections service.
///
/// Owns advertising/discovery lifecycles, connection setup with its timeout,
/// payload fan-out with per-endpoint transfer pacing, payload-listener
/// bookkeeping, and unknown-payload cleanup.
pub struct NearbyConnectionsManager {
    weak_self: Weak<Self>,
    service: Arc<dyn ConnectionsService>,
    flags: FeatureFlags,
    wake_locks: Arc<dyn WakeLockProvider>,
    state: Mutex<ManagerState>,
    closed: AtomicBool,
}

impl NearbyConnectionsManager {
    /// Creates the manager and wires itself as the service delegate.
    ///
    /// A persisted custom save path, when present, is restored into the
    /// service before any payload can arrive.
    #[must_use]
    pub fn new(
        service: Arc<dyn ConnectionsService>,
        flags: FeatureFlags,
        wake_locks: Arc<dyn WakeLockProvider>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak_self: &Weak<Self>| Self {
            weak_self: weak_self.clone(),
            service,
            flags,
            wake_locks,
            state: Mutex::new(ManagerState::default()),
            closed: AtomicBool::new(false),
        });

        if let Some(path) = load_persisted_settings().custom_save_path {
            manager.service.set_custom_save_path(path);
        }
        manager.service.set_delegate(Arc::new(ManagerDelegate {
            manager: manager.weak_self.clone(),
        }));
        manager
    }

    /// Starts advertising `endpoint_info` under this service.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyAdvertising` on duplicate calls, plus any service
    /// error.
    #[instrument(skip_all, fields(info_len = endpoint_info.len()))]
    pub async fn start_advertising(
        &self,
        endpoint_info: Vec<u8>,
        listener: Arc<dyn IncomingConnectionListener>,
        power_level: PowerLevel,
        data_usage: DataUsage,
        use_stable_endpoint_id: bool,
    ) -> Result<(), Status> {
        {
            let mut state = self.state.lock().expect("manager state poisoned");
            if state.advertising_listener.is_some() {
                return Err(Status::AlreadyAdvertising);
            }
            state.advertising_listener = Some(listener);
        }

        let fast_advertisement_service_uuid = (endpoint_info.len() <= MINIMUM_ADVERTISEMENT_SIZE)
            .then(|| fast_advertisement_uuid(&endpoint_info));
        let options = AdvertisingOptions::builder()
            .power_level(power_level)
            .data_usage(data_usage)
            .use_stable_endpoint_id(use_stable_endpoint_id)
            .enable_bluetooth_listening(power_level == PowerLevel::High)
            .maybe_fast_advertisement_service_uuid(fast_advertisement_service_uuid)
            .build();

        let status = self.service.start_advertising(endpoint_info, options).await;
        if !status.is_success() {
            let mut state = self.state.lock().expect("manager state poisoned");
            state.advertising_listener = None;
            return Err(status);
        }
        Ok(())
    }

    /// Stops advertising.
    ///
    /// # Errors
    ///
    /// Returns an error when advertising was not running.
    pub async fn stop_advertising(&self) -> Result<(), Status> {
        {
            let mut state = self.state.lock().expect("manager state poisoned");
            if state.advertising_listener.take().is_none() {
                return Err(Status::OutOfOrderCall);
            }
        }
        let status = self.service.stop_advertising().await;
        status.is_success().then_some(()).ok_or(status)
    }

    /// Starts discovery, deduplicating endpoint ids until stopped.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyDiscovering` on duplicate calls, plus any service
    /// error.
    pub async fn start_discovery(
        &self,
        listener: Arc<dyn DiscoveryListener>,
        data_usage: DataUsage,
    ) -> Result<(), Status> {
        {
            let mut state = self.state.lock().expect("manager state poisoned");
            if state.discovery_listener.is_some() {
                return Err(Status::AlreadyDiscovering);
            }
            state.discovery_listener = Some(listener);
            state.discovered_ids.clear();
        }
        let options = DiscoveryOptions::builder().data_usage(data_usage).build();
        let status = self.service.start_discovery(options).await;
        if !status.is_success() {
            let mut state = self.state.lock().expect("manager state poisoned");
            state.discovery_listener = None;
            return Err(status);
        }
        Ok(())
    }

    /// Stops discovery and resets the dedup set.
    ///
    /// # Errors
    ///
    /// Returns an error when discovery was not running.
    pub async fn stop_discovery(&self) -> Result<(), Status> {
        {
            let mut state = self.state.lock().expect("manager state poisoned");
            if state.discovery_listener.take().is_none() {
                return Err(Status::OutOfOrderCall);
            }
            state.discovered_ids.clear();
        }
        let status = self.service.stop_discovery().await;
        status.is_success().then_some(()).ok_or(status)
    }

    /// Connects to a discovered endpoint.
    ///
    /// A Bluetooth MAC hint that is not exactly six bytes is ignored. The
    /// attempt is bounded by the initiate-connection timeout; on expiry the
    /// endpoint is disconnected and `Timeout` is returned.
    ///
    /// # Errors
    ///
    /// Returns the failure status when the connection cannot be established.
    #[instrument(skip(self, endpoint_info, bt_mac), fields(%endpoint_id))]
    pub async fn connect(
        self: &Arc<Self>,
        endpoint_info: Vec<u8>,
        endpoint_id: &EndpointId,
        bt_mac: Option<Vec<u8>>,
        data_usage: DataUsage,
        transport_type: TransportType,
    ) -> Result<Arc<NearbyConnection>, Status> {
        let bt_mac = bt_mac.filter(|mac| {
            let valid = mac.len() == BT_MAC_LEN;
            if !valid {
                debug!(len = mac.len(), "ignoring malformed bluetooth MAC hint");
            }
            valid
        });
        if let Some(mac) = &bt_mac {
            debug!(mac = %hex::encode(mac), "bluetooth MAC hint supplied");
        }

        let (sender, receiver) = oneshot::channel();
        {
            let manager = Arc::clone(self);
            let timer_endpoint = endpoint_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(INITIATE_CONNECTION_TIMEOUT).await;
                manager.handle_connect_timeout(&timer_endpoint).await;
            });
            let mut state = self.state.lock().expect("manager state poisoned");
            if state.pending_outgoing.contains_key(endpoint_id)
                || state.connections.contains_key(endpoint_id)
            {
                timer.abort();
                return Err(Status::AlreadyConnectedToEndpoint);
            }
            state
                .pending_outgoing
                .insert(endpoint_id.clone(), PendingOutgoing { sender, timer });
            state
                .connection_transport
                .insert(endpoint_id.clone(), transport_type);
            state
                .transfer_managers
                .insert(endpoint_id.clone(), TransferManager::new(endpoint_id.clone()));
        }

        let options = ConnectionOptions::builder()
            .data_usage(data_usage)
            .transport_type(transport_type)
            .build();
        let status = self
            .service
            .request_connection(endpoint_info, endpoint_id, options)
            .await;
        if !status.is_success() {
            self.resolve_pending(endpoint_id, None, status);
            return Err(status);
        }

        match receiver.await {
            Ok(Some(connection)) => Ok(connection),
            Ok(None) | Err(_) => {
                let state = self.state.lock().expect("manager state poisoned");
                Err(state
                    .connection_status
                    .get(endpoint_id)
                    .copied()
                    .unwrap_or(Status::Unknown))
            }
        }
    }

    /// Disconnects from `endpoint_id`.
    pub async fn disconnect(&self, endpoint_id: &EndpointId) {
        let _ = self.service.disconnect_from_endpoint(endpoint_id).await;
    }

    /// Sends `payload` to the endpoint, registering `listener` for updates.
    ///
    /// File payloads on high-quality transports are paced by the endpoint's
    /// transfer manager; everything else goes out immediately.
    pub fn send(
        &self,
        endpoint_id: &EndpointId,
        payload: Payload,
        listener: Option<Arc<dyn PayloadStatusListener>>,
    ) {
        let (gate, transport) = {
            let mut state = self.state.lock().expect("manager state poisoned");
            if let Some(listener) = listener {
                state
                    .payload_listeners
                    .insert(payload.id(), Arc::downgrade(&listener));
            }
            let transport = state
                .connection_transport
                .get(endpoint_id)
                .copied()
                .unwrap_or(TransportType::Any);
            (state.transfer_managers.get(endpoint_id).cloned(), transport)
        };

        let gated = transport.wants_high_quality() && payload.kind() == PayloadKind::File;
        match (gated, gate) {
            (true, Some(gate)) => {
                let service = Arc::clone(&self.service);
                let endpoint_id = endpoint_id.clone();
                gate.send(move || {
                    service.send_payload(vec![endpoint_id], payload);
                });
                gate.start_transfer();
            }
            _ => {
                self.service.send_payload(vec![endpoint_id.clone()], payload);
            }
        }
    }

    /// Registers a listener for a payload id the remote is expected to send.
    pub fn register_payload_status_listener(
        &self,
        payload_id: PayloadId,
        listener: &Arc<dyn PayloadStatusListener>,
    ) {
        self.state
            .lock()
            .expect("manager state poisoned")
            .payload_listeners
            .insert(payload_id, Arc::downgrade(listener));
    }

    /// Cancels a payload. Idempotent: the listener receives at most one
    /// synthetic terminal update and the service one cancel request.
    pub async fn cancel(&self, payload_id: PayloadId) {
        let (listener, send_cancel) = {
            let mut state = self.state.lock().expect("manager state poisoned");
            let listener = state.payload_listeners.remove(&payload_id);
            let send_cancel = state.cancels_sent.insert(payload_id);
            (listener, send_cancel)
        };
        if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
            let update = PayloadTransferUpdate::terminal(payload_id, PayloadStatus::Canceled, 0, 0);
            listener.on_status_update(&update, None);
        }
        if send_cancel {
            let _ = self.service.cancel_payload(payload_id).await;
        }
    }

    /// Returns the reassembled payload for `payload_id`, when present.
    #[must_use]
    pub fn take_incoming_payload(&self, payload_id: PayloadId) -> Option<Payload> {
        self.state
            .lock()
            .expect("manager state poisoned")
            .incoming_payloads
            .remove(&payload_id)
    }

    /// Drops every reassembled payload still held for the client.
    pub fn clear_incoming_payloads(&self) {
        let mut state = self.state.lock().expect("manager state poisoned");
        state.incoming_payloads.clear();
        state.incoming_file_paths.clear();
    }

    /// Returns and clears the set of file paths to delete.
    #[must_use]
    pub fn get_and_clear_unknown_file_paths_to_delete(&self) -> HashSet<PathBuf> {
        let mut state = self.state.lock().expect("manager state poisoned");
        std::mem::take(&mut state.unknown_file_paths_to_delete)
    }

    /// Points incoming files at `path` and persists the choice.
    pub fn set_custom_save_path(&self, path: PathBuf) {
        store_persisted_settings(&PersistedSettings {
            custom_save_path: Some(path.clone()),
        });
        self.service.set_custom_save_path(path);
    }

    /// Requests a bandwidth upgrade for the endpoint.
    pub async fn upgrade_bandwidth(&self, endpoint_id: &EndpointId) -> Status {
        self.service.initiate_bandwidth_upgrade(endpoint_id).await
    }

    /// Tears everything down. After this returns, no listener is invoked.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.service.shutdown().await;
        let pending: Vec<PendingOutgoing> = {
            let mut state = self.state.lock().expect("manager state poisoned");
            state.advertising_listener = None;
            state.discovery_listener = None;
            state.payload_listeners.clear();
            state.connections.clear();
            state.transfer_managers.clear();
            state.pending_outgoing.drain().map(|(_id, p)| p).collect()
        };
        for pending in pending {
            pending.timer.abort();
            let _ = pending.sender.send(None);
        }
    }

    async fn handle_connect_timeout(self: &Arc<Self>, endpoint_id: &EndpointId) {
        let resolved = self.resolve_pending(endpoint_id, None, Status::Timeout);
        if resolved {
            info!(%endpoint_id, "connect attempt timed out");
            self.disconnect(endpoint_id).await;
        }
    }

    /// Completes an outgoing connect exactly once. Returns whether a pending
    /// attempt was resolved by this call.
    fn resolve_pending(
        &self,
        endpoint_id: &EndpointId,
        connection: Option<Arc<NearbyConnection>>,
        status: Status,
    ) -> bool {
        let pending = {
            let mut state = self.state.lock().expect("manager state poisoned");
            state
                .connection_status
                .insert(endpoint_id.clone(), status);
            state.pending_outgoing.remove(endpoint_id)
        };
        let Some(pending) = pending else {
            return false;
        };
        pending.timer.abort();
        let _ = pending.sender.send(connection);
        true
    }

    fn handle_endpoint_found(&self, peer: DiscoveredPeer) {
        let listener = {
            let mut state = self.state.lock().expect("manager state poisoned");
            if !state.discovered_ids.insert(peer.endpoint_id.clone()) {
                return;
            }
            state.discovery_listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_endpoint_discovered(&peer.endpoint_id, &peer.endpoint_info);
        }
    }

    fn handle_endpoint_lost(&self, endpoint_id: &EndpointId) {
        let listener = {
            let mut state = self.state.lock().expect("manager state poisoned");
            if !state.discovered_ids.remove(endpoint_id) {
                return;
            }
            state.discovery_listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_endpoint_lost(endpoint_id);
        }
    }

    fn handle_connection_initiated(self: &Arc<Self>, endpoint_id: &EndpointId, info: &ConnectionInfo) {
        debug!(
            %endpoint_id,
            token = %info.authentication_token,
            incoming = info.is_incoming,
            "connection initiated; accepting"
        );
        {
            let mut state = self.state.lock().expect("manager state poisoned");
            state
                .endpoint_infos
                .insert(endpoint_id.clone(), info.endpoint_info.clone());
        }
        let manager = Arc::clone(self);
        let endpoint_id = endpoint_id.clone();
        tokio::spawn(async move {
            let status = manager.service.accept_connection(&endpoint_id).await;
            if !status.is_success() {
                warn!(%endpoint_id, %status, "accept failed");
            }
        });
    }

    fn handle_connection_accepted(self: &Arc<Self>, endpoint_id: &EndpointId) {
        let timed_out = {
            let state = self.state.lock().expect("manager state poisoned");
            state.connection_status.get(endpoint_id) == Some(&Status::Timeout)
        };
        if timed_out {
            // The timer already gave up on this endpoint; the disconnect it
            // issued is in flight, so a late acceptance is a no-op.
            debug!(%endpoint_id, "ignoring acceptance after connect timeout");
            return;
        }

        let connection = NearbyConnection::new(
            endpoint_id.clone(),
            self.weak_self.clone(),
            self.wake_locks
                .acquire(&format!("nearlink:{endpoint_id}")),
        );
        let (was_outgoing, advertising_listener, transport, info_bytes) = {
            let mut state = self.state.lock().expect("manager state poisoned");
            state
                .connections
                .insert(endpoint_id.clone(), Arc::clone(&connection));
            state
                .connection_status
                .insert(endpoint_id.clone(), Status::Success);
            let transport = state
                .connection_transport
                .get(endpoint_id)
                .copied()
                .unwrap_or(TransportType::Any);
            (
                state.pending_outgoing.contains_key(endpoint_id),
                state.advertising_listener.clone(),
                transport,
                state.endpoint_infos.get(endpoint_id).cloned().unwrap_or_default(),
            )
        };

        if transport.wants_high_quality() {
            let manager = Arc::clone(self);
            let upgrade_endpoint = endpoint_id.clone();
            tokio::spawn(async move {
                let status = manager.upgrade_bandwidth(&upgrade_endpoint).await;
                if !status.is_success() {
                    debug!(endpoint_id = %upgrade_endpoint, %status, "bandwidth upgrade not started");
                }
            });
        }

        if was_outgoing {
            self.resolve_pending(endpoint_id, Some(connection), Status::Success);
        } else if let Some(listener) = advertising_listener {
            listener.on_incoming_connection(endpoint_id, &info_bytes, connection);
        }
    }

    fn handle_connection_rejected(&self, endpoint_id: &EndpointId, status: Status) {
        self.resolve_pending(endpoint_id, None, status);
    }

    fn handle_disconnected(&self, endpoint_id: &EndpointId) {
        self.resolve_pending(endpoint_id, None, Status::NotConnectedToEndpoint);
        let (connection, gate) = {
            let mut state = self.state.lock().expect("manager state poisoned");
            state.connection_transport.remove(endpoint_id);
            state.upgraded_mediums.remove(endpoint_id);
            state.endpoint_infos.remove(endpoint_id);
            (
                state.connections.remove(endpoint_id),
                state.transfer_managers.remove(endpoint_id),
            )
        };
        if let Some(gate) = gate {
            gate.cancel_transfer();
        }
        if let Some(connection) = connection {
            connection.handle_remote_closed();
        }
    }

    fn handle_bandwidth_changed(&self, endpoint_id: &EndpointId, medium: Medium) {
        let gate = {
            let mut state = self.state.lock().expect("manager state poisoned");
            state
                .upgraded_mediums
                .insert(endpoint_id.clone(), medium);
            state.transfer_managers.get(endpoint_id).cloned()
        };
        info!(%endpoint_id, %medium, "endpoint medium changed");
        if let Some(gate) = gate {
            gate.on_medium_quality_changed(medium);
        }
    }

    fn handle_incoming_payload_started(
        self: &Arc<Self>,
        _endpoint_id: &EndpointId,
        payload_id: PayloadId,
        kind: PayloadKind,
        _total_size: i64,
        file_path: Option<PathBuf>,
    ) {
        if kind != PayloadKind::File {
            return;
        }
        let Some(file_path) = file_path else {
            return;
        };

        let unexpected = {
            let mut state = self.state.lock().expect("manager state poisoned");
            let duplicate = state.incoming_file_paths.contains_key(&payload_id)
                || state.incoming_payloads.contains_key(&payload_id);
            if duplicate {
                // A second file under a known id is never legitimate.
                state.unknown_file_paths_to_delete.insert(file_path.clone());
                true
            } else {
                state.incoming_file_paths.insert(payload_id, file_path);
                false
            }
        };
        if unexpected && self.flags.delete_unexpected_received_files {
            self.spawn_cancel_once(payload_id);
        }
    }

    fn handle_incoming_payload(&self, endpoint_id: &EndpointId, payload: Payload) {
        let payload_id = payload.id();
        let mut state = self.state.lock().expect("manager state poisoned");
        let has_listener = state.payload_listeners.contains_key(&payload_id);
        if !has_listener && matches!(payload, Payload::Bytes { .. }) {
            // Unregistered byte payloads are control frames for the
            // connection's read queue.
            if let (Payload::Bytes { bytes, .. }, Some(connection)) =
                (payload, state.connections.get(endpoint_id))
            {
                let connection = Arc::clone(connection);
                drop(state);
                connection.push_read(bytes);
            }
            return;
        }
        state.incoming_payloads.insert(payload_id, payload);
    }

    fn handle_payload_transfer_update(
        self: &Arc<Self>,
        endpoint_id: &EndpointId,
        update: PayloadTransferUpdate,
    ) {
        let (registered, listener, upgraded_medium, unknown_file) = {
            let mut state = self.state.lock().expect("manager state poisoned");
            let entry = state.payload_listeners.get(&update.payload_id).cloned();
            let registered = entry.is_some();
            let listener = entry.and_then(|weak| weak.upgrade());
            let upgraded_medium = state.upgraded_mediums.get(endpoint_id).copied();
            let mut unknown_file = None;
            if registered {
                if listener.is_none() || update.status.is_terminal() {
                    state.payload_listeners.remove(&update.payload_id);
                }
            } else if let Some(path) = state.incoming_file_paths.get(&update.payload_id).cloned() {
                // A file nobody asked for; queue it for deletion.
                state.unknown_file_paths_to_delete.insert(path);
                state.incoming_file_paths.remove(&update.payload_id);
                state.incoming_payloads.remove(&update.payload_id);
                unknown_file = Some(update.payload_id);
            }
            (registered, listener, upgraded_medium, unknown_file)
        };

        if let Some(listener) = listener {
            listener.on_status_update(&update, upgraded_medium);
            return;
        }
        if registered {
            // The listener object is gone; drop the update on the floor
            // rather than treating the payload as unexpected.
            return;
        }
        if let Some(payload_id) = unknown_file
            && self.flags.delete_unexpected_received_files
        {
            self.spawn_cancel_once(payload_id);
        }
    }

    fn spawn_cancel_once(self: &Arc<Self>, payload_id: PayloadId) {
        let fresh = {
            let mut state = self.state.lock().expect("manager state poisoned");
            state.cancels_sent.insert(payload_id)
        };
        if !fresh {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _ = manager.service.cancel_payload(payload_id).await;
        });
    }
}

/// Routes service events into the manager, dropping everything after
/// shutdown.
struct ManagerDelegate {
    manager: Weak<NearbyConnectionsManager>,
}

impl ManagerDelegate {
    fn live(&self) -> Option<Arc<NearbyConnectionsManager>> {
        self.manager
            .upgrade()
            .filter(|manager| !manager.closed.load(Ordering::SeqCst))
    }
}

impl ServiceDelegate for ManagerDelegate {
    fn on_endpoint_found(&self, peer: DiscoveredPeer) {
        if let Some(manager) = self.live() {
            manager.handle_endpoint_found(peer);
        }
    }

    fn on_endpoint_lost(&self, endpoint_id: &EndpointId) {
        if let Some(manager) = self.live() {
            manager.handle_endpoint_lost(endpoint_id);
        }
    }

    fn on_connection_initiated(&self, endpoint_id: &EndpointId, info: &ConnectionInfo) {
        if let Some(manager) = self.live() {
            manager.handle_connection_initiated(endpoint_id, info);
        }
    }

    fn on_connection_accepted(&self, endpoint_id: &EndpointId) {
        if let Some(manager) = self.live() {
            manager.handle_connection_accepted(endpoint_id);
        }
    }

    fn on_connection_rejected(&self, endpoint_id: &EndpointId, status: Status) {
        if let Some(manager) = self.live() {
            manager.handle_connection_rejected(endpoint_id, status);
        }
    }

    fn on_disconnected(&self, endpoint_id: &EndpointId) {
        if let Some(manager) = self.live() {
            manager.handle_disconnected(endpoint_id);
        }
    }

    fn on_bandwidth_changed(&self, endpoint_id: &EndpointId, medium: Medium) {
        if let Some(manager) = self.live() {
            manager.handle_bandwidth_changed(endpoint_id, medium);
        }
    }

    fn on_incoming_payload_started(
        &self,
        endpoint_id: &EndpointId,
        payload_id: PayloadId,
        kind: PayloadKind,
        total_size: i64,
        file_path: Option<PathBuf>,
    ) {
        if let Some(manager) = self.live() {
            manager.handle_incoming_payload_started(
                endpoint_id,
                payload_id,
                kind,
                total_size,
                file_path,
            );
        }
    }

    fn on_incoming_payload(&self, endpoint_id: &EndpointId, payload: Payload) {
        if let Some(manager) = self.live() {
            manager.handle_incoming_payload(endpoint_id, payload);
        }
    }

    fn on_payload_transfer_update(&self, endpoint_id: &EndpointId, update: PayloadTransferUpdate) {
        if let Some(manager) = self.live() {
            manager.handle_payload_transfer_update(endpoint_id, update);
        }
    }
}

/// Derives the BLE fast-advertisement service UUID for a short endpoint
/// info record.
fn fast_advertisement_uuid(endpoint_info: &[u8]) -> String {
    let digest = Sha256::digest(endpoint_info);
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&digest[0..4]),
        hex::encode(&digest[4..6]),
        hex::encode(&digest[6..8]),
        hex::encode(&digest[8..10]),
        hex::encode(&digest[10..16]),
    )
}

fn settings_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "nearlink")
        .map(|dirs| dirs.config_dir().join("settings.json"))
}

fn load_persisted_settings() -> PersistedSettings {
    let Some(path) = settings_path() else {
        return PersistedSettings::default();
    };
    std::fs::read(&path)
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .unwrap_or_default()
}

fn store_persisted_settings(settings: &PersistedSettings) {
    let Some(path) = settings_path() else {
        return;
    };
    if let Some(parent) = path.parent()
        && let Err(error) = std::fs::create_dir_all(parent)
    {
        warn!(?error, "failed to create the settings directory");
        return;
    }
    match serde_json::to_vec_pretty(settings) {
        Ok(raw) => {
            if let Err(error) = std::fs::write(&path, raw) {
                warn!(?error, "failed to persist settings");
            }
        }
        Err(error) => warn!(?error, "failed to serialize settings"),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fast_advertisement_uuid_is_stable_and_shaped() {
        let info = vec![0x0d, 0x07, 0x07, 0x07, 0x07];
        let uuid = fast_advertisement_uuid(&info);
        assert_eq!(uuid, fast_advertisement_uuid(&info));
        let groups: Vec<usize> = uuid.split('-').map(str::len).collect();
        assert_eq!(vec![8, 4, 4, 4, 12], groups);
    }
}
