use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use rand::Rng;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::analytics::{AnalyticsRecorder, DisconnectionReason};
use crate::bwu::{BwuHandler, BwuManager, HubBwuHandler, WifiLanBwuHandler};
use crate::channel::EndpointChannel;
use crate::channel_manager::EndpointChannelManager;
use crate::config::{
    AdvertisingOptions, ConnectionOptions, DiscoveryOptions, FeatureFlags, PowerLevel,
    READ_FRAMES_TIMEOUT,
};
use crate::encryption::{EncryptionRunner, HandshakeRole};
use crate::endpoint_manager::{ClientProxy, ConnectionInfo, EndpointManager};
use crate::error::Status;
use crate::frame::{
    AutoReconnectEvent, ConnectionRequest, ConnectionResponse, Frame, FrameType,
};
use crate::ids::{EndpointId, PayloadId, ServiceId};
use crate::medium::{
    BleScanner, BoxedSocket, DiscoveredPeer, DiscoveryEvent, Medium, MediumHub,
};
use crate::payload::{Payload, PayloadKind, PayloadTransferUpdate};
use crate::payload_manager::{PayloadEventSink, PayloadManager};
use crate::reconnect::{AutoReconnectManager, ReconnectDelegate, ReconnectInfo};

/// Events the connections service surfaces to its single client.
pub trait ServiceDelegate: Send + Sync {
    fn on_endpoint_found(&self, peer: DiscoveredPeer);
    fn on_endpoint_lost(&self, endpoint_id: &EndpointId);
    fn on_connection_initiated(&self, endpoint_id: &EndpointId, info: &ConnectionInfo);
    fn on_connection_accepted(&self, endpoint_id: &EndpointId);
    fn on_connection_rejected(&self, endpoint_id: &EndpointId, status: Status);
    fn on_disconnected(&self, endpoint_id: &EndpointId);
    fn on_bandwidth_changed(&self, endpoint_id: &EndpointId, medium: Medium);
    fn on_incoming_payload_started(
        &self,
        endpoint_id: &EndpointId,
        payload_id: PayloadId,
        kind: PayloadKind,
        total_size: i64,
        file_path: Option<PathBuf>,
    );
    fn on_incoming_payload(&self, endpoint_id: &EndpointId, payload: Payload);
    fn on_payload_transfer_update(&self, endpoint_id: &EndpointId, update: PayloadTransferUpdate);
}

/// The connections service as seen by the client-facing façade.
#[async_trait]
pub trait ConnectionsService: Send + Sync {
    fn set_delegate(&self, delegate: Arc<dyn ServiceDelegate>);
    async fn start_advertising(&self, endpoint_info: Vec<u8>, options: AdvertisingOptions)
    -> Status;
    async fn stop_advertising(&self) -> Status;
    async fn start_discovery(&self, options: DiscoveryOptions) -> Status;
    async fn stop_discovery(&self) -> Status;
    async fn request_connection(
        &self,
        endpoint_info: Vec<u8>,
        endpoint_id: &EndpointId,
        options: ConnectionOptions,
    ) -> Status;
    async fn accept_connection(&self, endpoint_id: &EndpointId) -> Status;
    async fn disconnect_from_endpoint(&self, endpoint_id: &EndpointId) -> Status;
    fn send_payload(&self, endpoint_ids: Vec<EndpointId>, payload: Payload);
    async fn cancel_payload(&self, payload_id: PayloadId) -> Status;
    async fn initiate_bandwidth_upgrade(&self, endpoint_id: &EndpointId) -> Status;
    fn set_custom_save_path(&self, path: PathBuf);
    async fn shutdown(&self);
}

#[derive(Default)]
struct DelegateSlot {
    delegate: Mutex<Option<Arc<dyn ServiceDelegate>>>,
}

impl DelegateSlot {
    fn get(&self) -> Option<Arc<dyn ServiceDelegate>> {
        self.delegate.lock().expect("delegate slot poisoned").clone()
    }

    fn set(&self, delegate: Arc<dyn ServiceDelegate>) {
        *self.delegate.lock().expect("delegate slot poisoned") = Some(delegate);
    }
}

struct ConnectionRecord {
    channel: Arc<EndpointChannel>,
    info: ConnectionInfo,
    options: ConnectionOptions,
    peer_mediums: Vec<Medium>,
    seed_service_name: String,
    local_accepted: bool,
    remote_accepted: bool,
    registered: bool,
}

#[derive(Default)]
struct ServiceState {
    advertising: Option<AdvertisingSession>,
    discovering: Option<ActiveDiscovery>,
    discovered: HashMap<EndpointId, DiscoveredPeer>,
    connections: HashMap<EndpointId, ConnectionRecord>,
    local_endpoint_id: Option<EndpointId>,
}

struct AdvertisingSession {
    cancel: CancellationToken,
}

struct ActiveDiscovery {
    cancel: CancellationToken,
}

/// Offline (peer-to-peer) implementation of the connections service.
///
/// Composes the channel registry, endpoint manager, payload manager,
/// bandwidth-upgrade manager, and auto-reconnect manager over a medium hub.
/// Two services sharing one hub can reach each other, which is exactly how
/// the end-to-end suites run both peers in process.
pub struct OfflineService {
    weak_self: Weak<Self>,
    service_id: ServiceId,
    hub: Arc<MediumHub>,
    flags: FeatureFlags,
    delegate: Arc<DelegateSlot>,
    channel_manager: Arc<EndpointChannelManager>,
    endpoint_manager: Arc<EndpointManager>,
    payload_manager: Arc<PayloadManager>,
    bwu_manager: Arc<BwuManager>,
    reconnect_manager: Arc<AutoReconnectManager>,
    state: Mutex<ServiceState>,
    shutdown: CancellationToken,
}

impl OfflineService {
    /// Builds the full service stack over `hub`.
    #[must_use]
    pub fn new(
        service_id: ServiceId,
        hub: Arc<MediumHub>,
        flags: FeatureFlags,
        analytics: Arc<dyn AnalyticsRecorder>,
    ) -> Arc<Self> {
        let delegate = Arc::new(DelegateSlot::default());
        let channel_manager = Arc::new(EndpointChannelManager::new());
        let endpoint_manager =
            EndpointManager::new(Arc::clone(&channel_manager), Arc::clone(&analytics));

        let payload_manager = PayloadManager::new(
            Arc::clone(&endpoint_manager),
            Arc::new(PayloadSinkAdapter {
                delegate: Arc::clone(&delegate),
            }),
        );
        endpoint_manager.register_frame_processor(
            FrameType::PayloadTransfer,
            Arc::clone(&payload_manager) as _,
        );

        let handlers: Vec<Arc<dyn BwuHandler>> = vec![
            Arc::new(HubBwuHandler::new(Arc::clone(&hub), Medium::Awdl)),
            Arc::new(WifiLanBwuHandler),
            Arc::new(HubBwuHandler::new(Arc::clone(&hub), Medium::WifiHotspot)),
            Arc::new(HubBwuHandler::new(Arc::clone(&hub), Medium::Bluetooth)),
        ];
        let bwu_manager = BwuManager::new(&endpoint_manager, Arc::clone(&analytics), handlers);
        endpoint_manager.register_frame_processor(
            FrameType::BandwidthUpgradeNegotiation,
            Arc::clone(&bwu_manager) as _,
        );

        let reconnect_manager = AutoReconnectManager::new(Arc::clone(&hub));

        let service = Arc::new_cyclic(|weak_self: &Weak<Self>| Self {
            weak_self: weak_self.clone(),
            service_id,
            hub,
            flags,
            delegate,
            channel_manager,
            endpoint_manager,
            payload_manager,
            bwu_manager: Arc::clone(&bwu_manager),
            reconnect_manager,
            state: Mutex::new(ServiceState::default()),
            shutdown: CancellationToken::new(),
        });

        service
            .reconnect_manager
            .set_delegate(Arc::clone(&service) as _);

        let observer_weak = service.weak_self.clone();
        bwu_manager.set_medium_observer(Arc::new(move |endpoint_id, medium| {
            if let Some(service) = observer_weak.upgrade()
                && let Some(delegate) = service.delegate.get()
            {
                delegate.on_bandwidth_changed(endpoint_id, medium);
            }
        }));

        service
    }

    /// Returns the endpoint id this service advertises under, creating one
    /// when needed. A stable id survives advertising sessions.
    fn local_endpoint_id(&self, use_stable_endpoint_id: bool) -> EndpointId {
        let mut state = self.state.lock().expect("service state poisoned");
        match &state.local_endpoint_id {
            Some(id) if use_stable_endpoint_id => id.clone(),
            _ => {
                let id = EndpointId::generate();
                state.local_endpoint_id = Some(id.clone());
                id
            }
        }
    }

    fn allowed_medium_list(options: &ConnectionOptions) -> Vec<Medium> {
        [
            Medium::Bluetooth,
            Medium::Ble,
            Medium::WifiLan,
            Medium::WifiHotspot,
            Medium::Awdl,
            Medium::WebRtc,
        ]
        .into_iter()
        .filter(|medium| options.allowed_mediums.allows(*medium))
        .collect()
    }

    /// Handles one inbound seed socket from an advertisement listener.
    #[instrument(skip(self, socket), fields(%medium))]
    async fn handle_inbound(self: Arc<Self>, socket: BoxedSocket, medium: Medium) {
        let channel = Arc::new(EndpointChannel::new(
            format!("{}:{medium}:inbound", self.service_id),
            self.service_id.clone(),
            medium,
            socket,
        ));
        let first = timeout(READ_FRAMES_TIMEOUT, channel.read()).await;
        let frame = first
            .ok()
            .and_then(Result::ok)
            .and_then(|raw| Frame::decode(&raw).ok());
        match frame {
            Some(Frame::ConnectionRequest(request)) => {
                self.handle_connection_request(channel, request).await;
            }
            Some(Frame::AutoReconnect(AutoReconnectEvent::ClientIntroduction { endpoint_id }))
                if self.flags.auto_reconnect =>
            {
                self.handle_reconnect_introduction(channel, endpoint_id)
                    .await;
            }
            _ => {
                debug!("inbound socket opened without a usable first frame");
                channel.close(DisconnectionReason::IoError).await;
            }
        }
    }

    async fn handle_connection_request(
        self: &Arc<Self>,
        channel: Arc<EndpointChannel>,
        request: ConnectionRequest,
    ) {
        let endpoint_id = request.endpoint_id.clone();
        let outcome = match EncryptionRunner::run(&channel, HandshakeRole::Server).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(%endpoint_id, ?error, "inbound key exchange failed");
                channel.close(DisconnectionReason::IoError).await;
                return;
            }
        };
        channel.enable_encryption(Arc::new(outcome.context));

        let info = ConnectionInfo {
            endpoint_info: request.endpoint_info.clone(),
            authentication_token: outcome.authentication_token,
            raw_authentication_token: outcome.raw_authentication_token,
            is_incoming: true,
            connection_token: format!("{:08x}", request.nonce),
            safe_to_disconnect: self.flags.safe_disconnect && request.safe_to_disconnect,
        };
        let options = ConnectionOptions::builder()
            .keep_alive_interval(std::time::Duration::from_millis(u64::from(
                request.keep_alive_interval_millis.max(1),
            )))
            .keep_alive_timeout(std::time::Duration::from_millis(u64::from(
                request.keep_alive_timeout_millis.max(1),
            )))
            .build();

        let advertising_service_name = self.service_id.as_str().to_owned();
        {
            let mut state = self.state.lock().expect("service state poisoned");
            state.connections.insert(
                endpoint_id.clone(),
                ConnectionRecord {
                    channel: Arc::clone(&channel),
                    info: info.clone(),
                    options,
                    peer_mediums: request.supported_mediums.clone(),
                    seed_service_name: advertising_service_name,
                    local_accepted: false,
                    remote_accepted: false,
                    registered: false,
                },
            );
        }

        if let Some(delegate) = self.delegate.get() {
            delegate.on_connection_initiated(&endpoint_id, &info);
        }
        self.spawn_response_reader(endpoint_id, channel);
    }

    async fn handle_reconnect_introduction(
        self: &Arc<Self>,
        channel: Arc<EndpointChannel>,
        endpoint_id: EndpointId,
    ) {
        if !self.reconnect_manager.knows_endpoint(&endpoint_id) {
            debug!(%endpoint_id, "reconnect introduction for an unknown endpoint");
            channel.close(DisconnectionReason::IoError).await;
            return;
        }
        let ack = Frame::AutoReconnect(AutoReconnectEvent::ClientIntroductionAck);
        if channel.write_frame(&ack).await.is_err() {
            channel.close(DisconnectionReason::IoError).await;
            return;
        }
        if !self
            .restore_endpoint(&endpoint_id, channel, HandshakeRole::Server)
            .await
        {
            return;
        }
        self.reconnect_manager.notify_reconnected(&endpoint_id);
    }

    /// Re-runs the handshake on a recovered channel and re-registers the
    /// endpoint under its existing id.
    async fn restore_endpoint(
        self: &Arc<Self>,
        endpoint_id: &EndpointId,
        channel: Arc<EndpointChannel>,
        role: HandshakeRole,
    ) -> bool {
        let outcome = match EncryptionRunner::run(&channel, role).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(%endpoint_id, ?error, "reconnect key exchange failed");
                channel.close(DisconnectionReason::IoError).await;
                return false;
            }
        };
        channel.enable_encryption(Arc::new(outcome.context));

        let record = {
            let state = self.state.lock().expect("service state poisoned");
            state
                .connections
                .get(endpoint_id)
                .map(|record| (record.info.clone(), record.options.clone()))
        };
        let Some((mut info, options)) = record else {
            channel.close(DisconnectionReason::IoError).await;
            return false;
        };
        info.authentication_token = outcome.authentication_token;
        info.raw_authentication_token = outcome.raw_authentication_token;

        // A stale channel can still be registered when recovery raced the
        // teardown; swap it out instead of re-registering.
        if self.channel_manager.channel_for_endpoint(endpoint_id).is_some() {
            self.channel_manager
                .replace_channel_for_endpoint(
                    endpoint_id,
                    Arc::clone(&channel),
                    false,
                    DisconnectionReason::PrevChannelDisconnectionInReconnect,
                )
                .await;
        } else {
            self.endpoint_manager
                .register_endpoint(
                    Arc::clone(self) as Arc<dyn ClientProxy>,
                    endpoint_id.clone(),
                    info.clone(),
                    options,
                    Arc::clone(&channel),
                )
                .await;
        }

        let mut state = self.state.lock().expect("service state poisoned");
        if let Some(record) = state.connections.get_mut(endpoint_id) {
            record.channel = channel;
            record.info = info;
        }
        true
    }

    /// Reads the remote's connection response off a pending channel.
    fn spawn_response_reader(self: &Arc<Self>, endpoint_id: EndpointId, channel: Arc<EndpointChannel>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let response = timeout(READ_FRAMES_TIMEOUT, channel.read()).await;
            let frame = response
                .ok()
                .and_then(Result::ok)
                .and_then(|raw| Frame::decode(&raw).ok());
            match frame {
                Some(Frame::ConnectionResponse(ConnectionResponse {
                    accepted: true,
                    safe_to_disconnect,
                })) => {
                    {
                        let mut state = service.state.lock().expect("service state poisoned");
                        if let Some(record) = state.connections.get_mut(&endpoint_id) {
                            record.remote_accepted = true;
                            record.info.safe_to_disconnect =
                                record.info.safe_to_disconnect && safe_to_disconnect;
                        }
                    }
                    service.maybe_finalize_connection(&endpoint_id).await;
                }
                Some(Frame::ConnectionResponse(ConnectionResponse {
                    accepted: false, ..
                })) => {
                    info!(%endpoint_id, "remote rejected the connection");
                    service.drop_pending_connection(&endpoint_id).await;
                    if let Some(delegate) = service.delegate.get() {
                        delegate.on_connection_rejected(&endpoint_id, Status::ConnectionRejected);
                    }
                }
                _ => {
                    warn!(%endpoint_id, "connection response never arrived");
                    service.drop_pending_connection(&endpoint_id).await;
                    if let Some(delegate) = service.delegate.get() {
                        delegate.on_connection_rejected(&endpoint_id, Status::EndpointIoError);
                    }
                }
            }
        });
    }

    /// Registers the endpoint once both sides accepted.
    async fn maybe_finalize_connection(self: &Arc<Self>, endpoint_id: &EndpointId) {
        let finalize = {
            let mut state = self.state.lock().expect("service state poisoned");
            let local_id = state.local_endpoint_id.clone();
            match state.connections.get_mut(endpoint_id) {
                Some(record)
                    if record.local_accepted && record.remote_accepted && !record.registered =>
                {
                    record.registered = true;
                    Some((
                        Arc::clone(&record.channel),
                        record.info.clone(),
                        record.options.clone(),
                        record.peer_mediums.clone(),
                        record.seed_service_name.clone(),
                        local_id.unwrap_or_else(EndpointId::generate),
                    ))
                }
                _ => None,
            }
        };
        let Some((channel, info, options, peer_mediums, seed_service_name, local_id)) = finalize
        else {
            return;
        };

        self.bwu_manager.register_connection(
            endpoint_id.clone(),
            local_id.clone(),
            peer_mediums,
        );
        if self.flags.auto_reconnect {
            self.reconnect_manager.register_endpoint(
                endpoint_id.clone(),
                ReconnectInfo {
                    medium: channel.medium(),
                    service_name: seed_service_name,
                    local_endpoint_id: local_id,
                    is_incoming: info.is_incoming,
                },
            );
        }

        self.endpoint_manager
            .register_endpoint(
                Arc::clone(self) as Arc<dyn ClientProxy>,
                endpoint_id.clone(),
                info,
                options,
                channel,
            )
            .await;
        if let Some(delegate) = self.delegate.get() {
            delegate.on_connection_accepted(endpoint_id);
        }
    }

    async fn drop_pending_connection(&self, endpoint_id: &EndpointId) {
        let record = {
            let mut state = self.state.lock().expect("service state poisoned");
            state.connections.remove(endpoint_id)
        };
        if let Some(record) = record {
            record
                .channel
                .close(DisconnectionReason::LocalDisconnection)
                .await;
        }
    }

    fn forget_endpoint(&self, endpoint_id: &EndpointId) {
        let mut state = self.state.lock().expect("service state poisoned");
        state.connections.remove(endpoint_id);
    }
}

#[async_trait]
impl ConnectionsService for OfflineService {
    fn set_delegate(&self, delegate: Arc<dyn ServiceDelegate>) {
        self.delegate.set(delegate);
    }

    async fn start_advertising(
        &self,
        endpoint_info: Vec<u8>,
        options: AdvertisingOptions,
    ) -> Status {
        let local_id = self.local_endpoint_id(options.use_stable_endpoint_id);
        let cancel = {
            let mut state = self.state.lock().expect("service state poisoned");
            if state.advertising.is_some() {
                return Status::AlreadyAdvertising;
            }
            let cancel = self.shutdown.child_token();
            state.advertising = Some(AdvertisingSession {
                cancel: cancel.clone(),
            });
            cancel
        };

        let mut listen_mediums = vec![Medium::Ble];
        if options.enable_bluetooth_listening && options.power_level == PowerLevel::High {
            listen_mediums.push(Medium::Bluetooth);
        }

        for medium in listen_mediums {
            let advertised = self.hub.advertise(
                medium,
                self.service_id.as_str(),
                local_id.clone(),
                endpoint_info.clone(),
                None,
                true,
            );
            let mut advertised = match advertised {
                Ok(advertised) => advertised,
                Err(error) => {
                    warn!(%medium, ?error, "failed to advertise");
                    cancel.cancel();
                    let mut state = self.state.lock().expect("service state poisoned");
                    state.advertising = None;
                    return Status::from(error);
                }
            };

            let service = self.weak_self.clone();
            let accept_cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        socket = advertised.next_inbound() => {
                            let Some(socket) = socket else { break };
                            let Some(service) = service.upgrade() else { break };
                            tokio::spawn(service.handle_inbound(socket, medium));
                        }
                        () = accept_cancel.cancelled() => break,
                    }
                }
            });
        }

        info!(service_id = %self.service_id, %local_id, "advertising started");
        Status::Success
    }

    async fn stop_advertising(&self) -> Status {
        let mut state = self.state.lock().expect("service state poisoned");
        match state.advertising.take() {
            Some(session) => {
                session.cancel.cancel();
                Status::Success
            }
            None => Status::OutOfOrderCall,
        }
    }

    async fn start_discovery(&self, options: DiscoveryOptions) -> Status {
        let cancel = {
            let mut state = self.state.lock().expect("service state poisoned");
            if state.discovering.is_some() {
                return Status::AlreadyDiscovering;
            }
            let cancel = self.shutdown.child_token();
            state.discovering = Some(ActiveDiscovery {
                cancel: cancel.clone(),
            });
            cancel
        };

        let mut session = self
            .hub
            .discover(Medium::Ble, Some(self.service_id.as_str().to_owned()));
        let service = self.weak_self.clone();
        let events_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = session.next_event() => event,
                    () = events_cancel.cancelled() => break,
                };
                let Some(event) = event else { break };
                let Some(service) = service.upgrade() else { break };
                let delegate = service.delegate.get();
                match event {
                    DiscoveryEvent::Found(peer) => {
                        {
                            let mut state =
                                service.state.lock().expect("service state poisoned");
                            state.discovered.insert(peer.endpoint_id.clone(), peer.clone());
                        }
                        if let Some(delegate) = delegate {
                            delegate.on_endpoint_found(peer);
                        }
                    }
                    DiscoveryEvent::Lost { endpoint_id } => {
                        {
                            let mut state =
                                service.state.lock().expect("service state poisoned");
                            state.discovered.remove(&endpoint_id);
                        }
                        if let Some(delegate) = delegate {
                            delegate.on_endpoint_lost(&endpoint_id);
                        }
                    }
                }
            }
        });

        if options.hardware_ble_scan {
            let service = self.weak_self.clone();
            let scan_cancel = cancel.clone();
            tokio::spawn(async move {
                let scanner = match BleScanner::new().await {
                    Ok(scanner) => scanner,
                    Err(error) => {
                        warn!(?error, "hardware BLE scanner unavailable");
                        return;
                    }
                };
                let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
                let run_cancel = scan_cancel.clone();
                tokio::spawn(async move {
                    while let Some(event) = events_rx.recv().await {
                        let Some(service) = service.upgrade() else { break };
                        if let DiscoveryEvent::Found(peer) = event
                            && let Some(delegate) = service.delegate.get()
                        {
                            let mut state =
                                service.state.lock().expect("service state poisoned");
                            state.discovered.insert(peer.endpoint_id.clone(), peer.clone());
                            drop(state);
                            delegate.on_endpoint_found(peer);
                        }
                    }
                });
                if let Err(error) = scanner.run(events_tx, run_cancel).await {
                    warn!(?error, "hardware BLE scan stopped");
                }
            });
        }

        Status::Success
    }

    async fn stop_discovery(&self) -> Status {
        let mut state = self.state.lock().expect("service state poisoned");
        match state.discovering.take() {
            Some(session) => {
                session.cancel.cancel();
                state.discovered.clear();
                Status::Success
            }
            None => Status::OutOfOrderCall,
        }
    }

    #[instrument(skip(self, endpoint_info, options), fields(%endpoint_id))]
    async fn request_connection(
        &self,
        endpoint_info: Vec<u8>,
        endpoint_id: &EndpointId,
        options: ConnectionOptions,
    ) -> Status {
        let peer = {
            let state = self.state.lock().expect("service state poisoned");
            if state.connections.contains_key(endpoint_id) {
                return Status::AlreadyConnectedToEndpoint;
            }
            state.discovered.get(endpoint_id).cloned()
        };
        let Some(peer) = peer else {
            return Status::EndpointUnknown;
        };

        let socket = match self.hub.dial(peer.medium, &peer.service_name, None) {
            Ok(socket) => socket,
            Err(error) => {
                warn!(?error, "seed dial failed");
                return Status::from(error);
            }
        };
        let channel = Arc::new(EndpointChannel::new(
            format!("{}:{}:outbound", self.service_id, peer.medium),
            self.service_id.clone(),
            peer.medium,
            socket,
        ));

        let local_id = self.local_endpoint_id(options.use_stable_endpoint_id);
        let nonce: u32 = rand::thread_rng().r#gen();
        let request = Frame::ConnectionRequest(ConnectionRequest {
            endpoint_id: local_id.clone(),
            endpoint_info,
            nonce,
            keep_alive_interval_millis: options.keep_alive_interval.as_millis() as u32,
            keep_alive_timeout_millis: options.keep_alive_timeout.as_millis() as u32,
            supported_mediums: Self::allowed_medium_list(&options),
            safe_to_disconnect: self.flags.safe_disconnect,
        });
        if let Err(error) = channel.write_frame(&request).await {
            warn!(?error, "connection request write failed");
            channel.close(DisconnectionReason::IoError).await;
            return Status::EndpointIoError;
        }

        let outcome = match EncryptionRunner::run(&channel, HandshakeRole::Client).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(?error, "outbound key exchange failed");
                channel.close(DisconnectionReason::IoError).await;
                return Status::EndpointIoError;
            }
        };
        channel.enable_encryption(Arc::new(outcome.context));

        let info = ConnectionInfo {
            endpoint_info: peer.endpoint_info.clone(),
            authentication_token: outcome.authentication_token,
            raw_authentication_token: outcome.raw_authentication_token,
            is_incoming: false,
            connection_token: format!("{nonce:08x}"),
            safe_to_disconnect: self.flags.safe_disconnect,
        };
        {
            let mut state = self.state.lock().expect("service state poisoned");
            state.connections.insert(
                endpoint_id.clone(),
                ConnectionRecord {
                    channel: Arc::clone(&channel),
                    info: info.clone(),
                    // Assume a symmetric medium stack until the peer tells us
                    // otherwise; the response frame carries no medium list.
                    peer_mediums: Self::allowed_medium_list(&options),
                    options,
                    seed_service_name: peer.service_name.clone(),
                    local_accepted: false,
                    remote_accepted: false,
                    registered: false,
                },
            );
        }

        if let Some(delegate) = self.delegate.get() {
            delegate.on_connection_initiated(endpoint_id, &info);
        }
        let Some(service) = self.weak_self.upgrade() else {
            return Status::Reset;
        };
        service.spawn_response_reader(endpoint_id.clone(), channel);
        Status::Success
    }

    async fn accept_connection(&self, endpoint_id: &EndpointId) -> Status {
        let channel = {
            let mut state = self.state.lock().expect("service state poisoned");
            match state.connections.get_mut(endpoint_id) {
                Some(record) if !record.local_accepted => {
                    record.local_accepted = true;
                    Arc::clone(&record.channel)
                }
                Some(_already_accepted) => return Status::OutOfOrderCall,
                None => return Status::EndpointUnknown,
            }
        };

        let response = Frame::ConnectionResponse(ConnectionResponse {
            accepted: true,
            safe_to_disconnect: self.flags.safe_disconnect,
        });
        if let Err(error) = channel.write_frame(&response).await {
            warn!(%endpoint_id, ?error, "connection response write failed");
            return Status::EndpointIoError;
        }
        if let Some(service) = self.weak_self.upgrade() {
            service.maybe_finalize_connection(endpoint_id).await;
        }
        Status::Success
    }

    async fn disconnect_from_endpoint(&self, endpoint_id: &EndpointId) -> Status {
        self.reconnect_manager.forget_endpoint(endpoint_id);
        let Some(service) = self.weak_self.upgrade() else {
            return Status::Reset;
        };
        service
            .endpoint_manager
            .unregister_endpoint(endpoint_id)
            .await;
        service.drop_pending_connection(endpoint_id).await;
        Status::Success
    }

    fn send_payload(&self, endpoint_ids: Vec<EndpointId>, payload: Payload) {
        self.payload_manager.send_payload(payload, endpoint_ids);
    }

    async fn cancel_payload(&self, payload_id: PayloadId) -> Status {
        self.payload_manager.cancel_payload(payload_id).await;
        Status::Success
    }

    async fn initiate_bandwidth_upgrade(&self, endpoint_id: &EndpointId) -> Status {
        let options = {
            let state = self.state.lock().expect("service state poisoned");
            match state.connections.get(endpoint_id) {
                Some(record) => record.options.clone(),
                None => return Status::NotConnectedToEndpoint,
            }
        };
        match self
            .bwu_manager
            .initiate_upgrade(endpoint_id, &options.allowed_mediums, options.data_usage)
            .await
        {
            Ok(()) => Status::Success,
            Err(status) => status,
        }
    }

    fn set_custom_save_path(&self, path: PathBuf) {
        self.payload_manager.set_save_directory(path);
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        {
            let mut state = self.state.lock().expect("service state poisoned");
            state.advertising = None;
            state.discovering = None;
            state.discovered.clear();
        }
        self.endpoint_manager.shutdown().await;
    }
}

impl ClientProxy for OfflineService {
    fn on_connection_initiated(&self, _endpoint_id: &EndpointId, _info: &ConnectionInfo) {
        // The delegate was told when the pending connection was created.
    }

    fn on_disconnected(&self, endpoint_id: &EndpointId, reason: DisconnectionReason) {
        let Some(service) = self.weak_self.upgrade() else {
            return;
        };
        let reconnecting = self.flags.auto_reconnect
            && self
                .reconnect_manager
                .try_begin_reconnect(endpoint_id, reason);
        if reconnecting {
            info!(%endpoint_id, "suppressing disconnect while reconnect is pending");
            return;
        }
        service.forget_endpoint(endpoint_id);
        service.reconnect_manager.forget_endpoint(endpoint_id);
        if let Some(delegate) = service.delegate.get() {
            delegate.on_disconnected(endpoint_id);
        }
    }
}

#[async_trait]
impl ReconnectDelegate for OfflineService {
    async fn on_reconnected(&self, endpoint_id: &EndpointId, channel: Arc<EndpointChannel>) {
        let Some(service) = self.weak_self.upgrade() else {
            return;
        };
        service
            .restore_endpoint(endpoint_id, channel, HandshakeRole::Client)
            .await;
    }

    fn on_reconnect_failed(&self, endpoint_id: &EndpointId) {
        let Some(service) = self.weak_self.upgrade() else {
            return;
        };
        service.forget_endpoint(endpoint_id);
        if let Some(delegate) = service.delegate.get() {
            delegate.on_disconnected(endpoint_id);
        }
    }
}

struct PayloadSinkAdapter {
    delegate: Arc<DelegateSlot>,
}

impl PayloadEventSink for PayloadSinkAdapter {
    fn on_incoming_payload_started(
        &self,
        endpoint_id: &EndpointId,
        payload_id: PayloadId,
        kind: PayloadKind,
        total_size: i64,
        file_path: Option<PathBuf>,
    ) {
        if let Some(delegate) = self.delegate.get() {
            delegate.on_incoming_payload_started(
                endpoint_id,
                payload_id,
                kind,
                total_size,
                file_path,
            );
        }
    }

    fn on_incoming_payload(&self, endpoint_id: &EndpointId, payload: Payload) {
        if let Some(delegate) = self.delegate.get() {
            delegate.on_incoming_payload(endpoint_id, payload);
        }
    }

    fn on_payload_transfer_update(&self, endpoint_id: &EndpointId, update: PayloadTransferUpdate) {
        if let Some(delegate) = self.delegate.get() {
            delegate.on_payload_transfer_update(endpoint_id, update);
        }
    }
}
