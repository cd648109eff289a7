#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nearlink::{
    AnalyticsRecorder, DiscoveryListener, EndpointId, FeatureFlags, IncomingConnectionListener,
    InMemoryAnalyticsRecorder, Medium, MediumHub, NearbyConnection, NearbyConnectionsManager,
    NoopWakeLockProvider, OfflineService, PayloadStatusListener, PayloadTransferUpdate, ServiceId,
};

/// One in-process peer: its façade plus the analytics journal behind it.
pub struct Peer {
    pub manager: Arc<NearbyConnectionsManager>,
    pub analytics: Arc<InMemoryAnalyticsRecorder>,
}

/// Builds a full peer stack over the shared medium hub.
pub fn build_peer(hub: &Arc<MediumHub>, service_id: &str, flags: FeatureFlags) -> Peer {
    nearlink::initialise_tracing();
    let analytics = Arc::new(InMemoryAnalyticsRecorder::new());
    let service = OfflineService::new(
        ServiceId::from(service_id),
        Arc::clone(hub),
        flags,
        Arc::clone(&analytics) as Arc<dyn AnalyticsRecorder>,
    );
    let manager = NearbyConnectionsManager::new(service, flags, Arc::new(NoopWakeLockProvider));
    Peer { manager, analytics }
}

/// Polls `probe` until it yields a value or five seconds pass.
pub async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(value) = probe() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not reached in time")
}

/// Discovery listener that records every event.
#[derive(Default)]
pub struct RecordingDiscovery {
    pub found: Mutex<Vec<(EndpointId, Vec<u8>)>>,
    pub lost: Mutex<Vec<EndpointId>>,
}

impl DiscoveryListener for RecordingDiscovery {
    fn on_endpoint_discovered(&self, endpoint_id: &EndpointId, endpoint_info: &[u8]) {
        self.found
            .lock()
            .expect("found list poisoned")
            .push((endpoint_id.clone(), endpoint_info.to_vec()));
    }

    fn on_endpoint_lost(&self, endpoint_id: &EndpointId) {
        self.lost
            .lock()
            .expect("lost list poisoned")
            .push(endpoint_id.clone());
    }
}

impl RecordingDiscovery {
    pub fn first_found(&self) -> Option<(EndpointId, Vec<u8>)> {
        self.found.lock().expect("found list poisoned").first().cloned()
    }
}

/// Incoming-connection listener that hands connections to the test.
#[derive(Default)]
pub struct RecordingIncoming {
    pub connections: Mutex<Vec<(EndpointId, Vec<u8>, Arc<NearbyConnection>)>>,
}

impl IncomingConnectionListener for RecordingIncoming {
    fn on_incoming_connection(
        &self,
        endpoint_id: &EndpointId,
        endpoint_info: &[u8],
        connection: Arc<NearbyConnection>,
    ) {
        self.connections.lock().expect("connections poisoned").push((
            endpoint_id.clone(),
            endpoint_info.to_vec(),
            connection,
        ));
    }
}

impl RecordingIncoming {
    pub fn first_connection(&self) -> Option<Arc<NearbyConnection>> {
        self.connections
            .lock()
            .expect("connections poisoned")
            .first()
            .map(|(_id, _info, connection)| Arc::clone(connection))
    }
}

/// Payload status listener that records every delivered update.
#[derive(Default)]
pub struct RecordingPayloadListener {
    pub updates: Mutex<Vec<(PayloadTransferUpdate, Option<Medium>)>>,
}

impl PayloadStatusListener for RecordingPayloadListener {
    fn on_status_update(&self, update: &PayloadTransferUpdate, upgraded_medium: Option<Medium>) {
        self.updates
            .lock()
            .expect("updates poisoned")
            .push((*update, upgraded_medium));
    }
}

impl RecordingPayloadListener {
    pub fn snapshot(&self) -> Vec<PayloadTransferUpdate> {
        self.updates
            .lock()
            .expect("updates poisoned")
            .iter()
            .map(|(update, _medium)| *update)
            .collect()
    }
}
