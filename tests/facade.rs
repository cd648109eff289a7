mod support;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use nearlink::{
    AdvertisingOptions, ConnectionOptions, DataUsage, DiscoveryOptions, EndpointId, FeatureFlags,
    Medium, NearbyConnectionsManager, NoopWakeLockProvider, Payload, PayloadId, PayloadKind,
    PayloadStatus, PayloadStatusListener, PayloadTransferUpdate, PowerLevel, ServiceDelegate,
    Status, TransportType,
};
use support::wait_for;

/// Service stub recording calls and letting the test drive delegate events.
#[derive(Default)]
struct FakeService {
    delegate: Mutex<Option<Arc<dyn ServiceDelegate>>>,
    advertising_options: Mutex<Vec<AdvertisingOptions>>,
    connection_requests: Mutex<Vec<EndpointId>>,
    accepts: Mutex<Vec<EndpointId>>,
    disconnects: Mutex<Vec<EndpointId>>,
    sends: Mutex<Vec<(Vec<EndpointId>, PayloadId)>>,
    cancels: Mutex<Vec<PayloadId>>,
}

impl FakeService {
    fn delegate(&self) -> Arc<dyn ServiceDelegate> {
        self.delegate
            .lock()
            .expect("delegate slot poisoned")
            .clone()
            .expect("manager installs a delegate at construction")
    }

    fn cancel_count(&self, payload_id: PayloadId) -> usize {
        self.cancels
            .lock()
            .expect("cancels poisoned")
            .iter()
            .filter(|id| **id == payload_id)
            .count()
    }
}

#[async_trait]
impl nearlink::ConnectionsService for FakeService {
    fn set_delegate(&self, delegate: Arc<dyn ServiceDelegate>) {
        *self.delegate.lock().expect("delegate slot poisoned") = Some(delegate);
    }

    async fn start_advertising(
        &self,
        _endpoint_info: Vec<u8>,
        options: AdvertisingOptions,
    ) -> Status {
        self.advertising_options
            .lock()
            .expect("options poisoned")
            .push(options);
        Status::Success
    }

    async fn stop_advertising(&self) -> Status {
        Status::Success
    }

    async fn start_discovery(&self, _options: DiscoveryOptions) -> Status {
        Status::Success
    }

    async fn stop_discovery(&self) -> Status {
        Status::Success
    }

    async fn request_connection(
        &self,
        _endpoint_info: Vec<u8>,
        endpoint_id: &EndpointId,
        _options: ConnectionOptions,
    ) -> Status {
        self.connection_requests
            .lock()
            .expect("requests poisoned")
            .push(endpoint_id.clone());
        Status::Success
    }

    async fn accept_connection(&self, endpoint_id: &EndpointId) -> Status {
        self.accepts
            .lock()
            .expect("accepts poisoned")
            .push(endpoint_id.clone());
        Status::Success
    }

    async fn disconnect_from_endpoint(&self, endpoint_id: &EndpointId) -> Status {
        self.disconnects
            .lock()
            .expect("disconnects poisoned")
            .push(endpoint_id.clone());
        Status::Success
    }

    fn send_payload(&self, endpoint_ids: Vec<EndpointId>, payload: Payload) {
        self.sends
            .lock()
            .expect("sends poisoned")
            .push((endpoint_ids, payload.id()));
    }

    async fn cancel_payload(&self, payload_id: PayloadId) -> Status {
        self.cancels
            .lock()
            .expect("cancels poisoned")
            .push(payload_id);
        Status::Success
    }

    async fn initiate_bandwidth_upgrade(&self, _endpoint_id: &EndpointId) -> Status {
        Status::Success
    }

    fn set_custom_save_path(&self, _path: PathBuf) {}

    async fn shutdown(&self) {}
}

struct StoreListener {
    updates: Arc<Mutex<Vec<(PayloadTransferUpdate, Option<Medium>)>>>,
}

impl PayloadStatusListener for StoreListener {
    fn on_status_update(&self, update: &PayloadTransferUpdate, upgraded_medium: Option<Medium>) {
        self.updates
            .lock()
            .expect("updates poisoned")
            .push((*update, upgraded_medium));
    }
}

fn manager_over(fake: &Arc<FakeService>) -> Arc<NearbyConnectionsManager> {
    nearlink::initialise_tracing();
    NearbyConnectionsManager::new(
        Arc::clone(fake) as Arc<dyn nearlink::ConnectionsService>,
        FeatureFlags::default(),
        Arc::new(NoopWakeLockProvider),
    )
}

#[tokio::test]
async fn cancel_delivers_one_synthetic_update_and_one_service_cancel() {
    let fake = Arc::new(FakeService::default());
    let manager = manager_over(&fake);
    let endpoint = EndpointId::from("E1");
    let payload_id = PayloadId::new(689_777);

    let updates = Arc::new(Mutex::new(Vec::new()));
    let listener: Arc<dyn PayloadStatusListener> = Arc::new(StoreListener {
        updates: Arc::clone(&updates),
    });

    let payload = Payload::File {
        id: payload_id,
        path: PathBuf::from("/tmp/outgoing.bin"),
        size: 5_201_314,
    };
    manager.send(&endpoint, payload, Some(Arc::clone(&listener)));
    assert_eq!(1, fake.sends.lock().expect("sends").len());

    fake.delegate().on_payload_transfer_update(
        &endpoint,
        PayloadTransferUpdate::in_progress(payload_id, 5_201_314, 721_831),
    );
    assert_eq!(1, updates.lock().expect("updates").len());

    manager.cancel(payload_id).await;
    manager.cancel(payload_id).await;

    let delivered = updates.lock().expect("updates").clone();
    assert_eq!(2, delivered.len());
    assert_eq!(
        PayloadTransferUpdate {
            payload_id,
            status: PayloadStatus::Canceled,
            total_bytes: 0,
            bytes_transferred: 0,
        },
        delivered[1].0
    );
    assert_eq!(1, fake.cancel_count(payload_id));
}

#[tokio::test]
async fn dropped_shared_listener_stops_all_deliveries() {
    let fake = Arc::new(FakeService::default());
    let manager = manager_over(&fake);
    let endpoint = EndpointId::from("E1");
    let ids = [
        PayloadId::new(689_777),
        PayloadId::new(777_689),
        PayloadId::new(986_777),
    ];

    let updates = Arc::new(Mutex::new(Vec::new()));
    let listener: Arc<dyn PayloadStatusListener> = Arc::new(StoreListener {
        updates: Arc::clone(&updates),
    });
    for id in ids {
        manager.register_payload_status_listener(id, &listener);
    }

    fake.delegate().on_payload_transfer_update(
        &endpoint,
        PayloadTransferUpdate::terminal(ids[0], PayloadStatus::Failure, 10, 0),
    );
    assert_eq!(1, updates.lock().expect("updates").len());

    // The client resets its listener; the remaining registrations dangle.
    drop(listener);

    for id in &ids[1..] {
        fake.delegate().on_payload_transfer_update(
            &endpoint,
            PayloadTransferUpdate::terminal(*id, PayloadStatus::Success, 10, 10),
        );
    }

    assert_eq!(1, updates.lock().expect("updates").len());
    assert_eq!(true, fake.cancels.lock().expect("cancels").is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_disconnects_and_ignores_late_acceptance() {
    let fake = Arc::new(FakeService::default());
    let manager = manager_over(&fake);
    let endpoint = EndpointId::from("E1");

    let result = manager
        .connect(
            vec![0x0d, 0x07, 0x07, 0x07, 0x07],
            &endpoint,
            Some(vec![0x11, 0x22, 0x33]),
            DataUsage::Offline,
            TransportType::Any,
        )
        .await;

    assert_eq!(Err(Status::Timeout), result);
    wait_for(|| {
        let disconnects = fake.disconnects.lock().expect("disconnects").clone();
        (disconnects == vec![endpoint.clone()]).then_some(())
    })
    .await;

    // A late acceptance of the original request is a no-op.
    fake.delegate().on_connection_accepted(&endpoint);
    tokio::task::yield_now().await;
    assert_eq!(1, fake.disconnects.lock().expect("disconnects").len());
    assert_eq!(None, manager.take_incoming_payload(PayloadId::new(1)));
}

#[tokio::test]
async fn unexpected_second_file_is_queued_for_deletion_and_canceled() {
    let fake = Arc::new(FakeService::default());
    let manager = manager_over(&fake);
    let endpoint = EndpointId::from("E1");
    let payload_id = PayloadId::new(689_777);

    let updates = Arc::new(Mutex::new(Vec::new()));
    let listener: Arc<dyn PayloadStatusListener> = Arc::new(StoreListener {
        updates: Arc::clone(&updates),
    });
    manager.register_payload_status_listener(payload_id, &listener);

    let expected_path = PathBuf::from("/tmp/incoming/689777_first.bin");
    let surprise_path = PathBuf::from("/tmp/incoming/689777_second.bin");
    fake.delegate().on_incoming_payload_started(
        &endpoint,
        payload_id,
        PayloadKind::File,
        5_201_314,
        Some(expected_path),
    );
    fake.delegate().on_incoming_payload_started(
        &endpoint,
        payload_id,
        PayloadKind::File,
        5_201_314,
        Some(surprise_path.clone()),
    );
    fake.delegate().on_payload_transfer_update(
        &endpoint,
        PayloadTransferUpdate::terminal(payload_id, PayloadStatus::Success, 5_201_314, 5_201_314),
    );

    wait_for(|| (fake.cancel_count(payload_id) == 1).then_some(())).await;

    let unknown = manager.get_and_clear_unknown_file_paths_to_delete();
    assert_eq!(1, unknown.len());
    assert_eq!(true, unknown.contains(&surprise_path));
    assert_eq!(
        true,
        manager.get_and_clear_unknown_file_paths_to_delete().is_empty()
    );
    assert_eq!(1, fake.cancel_count(payload_id));
    assert_eq!(1, updates.lock().expect("updates").len());
}

#[tokio::test]
async fn oversized_endpoint_info_disables_the_fast_advertisement_uuid() {
    let fake = Arc::new(FakeService::default());
    let manager = manager_over(&fake);

    struct NoIncoming;
    impl nearlink::IncomingConnectionListener for NoIncoming {
        fn on_incoming_connection(
            &self,
            _endpoint_id: &EndpointId,
            _endpoint_info: &[u8],
            _connection: Arc<nearlink::NearbyConnection>,
        ) {
        }
    }

    manager
        .start_advertising(
            vec![0u8; 17],
            Arc::new(NoIncoming),
            PowerLevel::High,
            DataUsage::Offline,
            false,
        )
        .await
        .expect("short info advertises");
    manager.stop_advertising().await.expect("stop advertising");
    manager
        .start_advertising(
            vec![0u8; 18],
            Arc::new(NoIncoming),
            PowerLevel::High,
            DataUsage::Offline,
            false,
        )
        .await
        .expect("long info advertises");

    let recorded = fake.advertising_options.lock().expect("options").clone();
    assert_eq!(2, recorded.len());
    assert_eq!(true, recorded[0].fast_advertisement_service_uuid.is_some());
    assert_eq!(None, recorded[1].fast_advertisement_service_uuid);
}
