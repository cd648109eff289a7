mod support;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use nearlink::{
    DataUsage, FeatureFlags, MediumHub, Payload, PayloadStatus, PowerLevel, TransportType,
};
use support::{
    RecordingDiscovery, RecordingIncoming, RecordingPayloadListener, build_peer, wait_for,
};

async fn connected_pair(
    hub: &Arc<MediumHub>,
) -> anyhow::Result<(support::Peer, support::Peer, nearlink::EndpointId)> {
    let advertiser = build_peer(hub, "NearbySharing", FeatureFlags::default());
    let discoverer = build_peer(hub, "NearbySharing", FeatureFlags::default());

    let incoming = Arc::new(RecordingIncoming::default());
    advertiser
        .manager
        .start_advertising(
            vec![0x01],
            Arc::clone(&incoming) as _,
            PowerLevel::High,
            DataUsage::Offline,
            false,
        )
        .await
        .map_err(|status| anyhow::anyhow!("advertising failed: {status}"))?;

    let discovery = Arc::new(RecordingDiscovery::default());
    discoverer
        .manager
        .start_discovery(Arc::clone(&discovery) as _, DataUsage::Offline)
        .await
        .map_err(|status| anyhow::anyhow!("discovery failed: {status}"))?;
    let (endpoint_id, _info) = wait_for(|| discovery.first_found()).await;

    discoverer
        .manager
        .connect(
            vec![0x02],
            &endpoint_id,
            None,
            DataUsage::Offline,
            TransportType::Any,
        )
        .await
        .map_err(|status| anyhow::anyhow!("connect failed: {status}"))?;
    wait_for(|| incoming.first_connection()).await;

    Ok((advertiser, discoverer, endpoint_id))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_payload_reaches_the_save_directory() -> anyhow::Result<()> {
    let hub = MediumHub::new();
    let (advertiser, discoverer, endpoint_id) = connected_pair(&hub).await?;

    let workspace = std::env::temp_dir().join(format!("nearlink-test-{}", std::process::id()));
    let save_dir = workspace.join("incoming");
    tokio::fs::create_dir_all(&save_dir).await?;
    advertiser.manager.set_custom_save_path(save_dir.clone());

    // Write a 300 KiB source file so several chunks are needed.
    let source_path = workspace.join("outgoing.bin");
    let body: Vec<u8> = (0..300 * 1024).map(|index| (index % 251) as u8).collect();
    tokio::fs::write(&source_path, &body).await?;

    let payload = Payload::from_file(source_path.clone(), body.len() as i64);
    let payload_id = payload.id();

    // The receiver expects this payload; without a registration the incoming
    // file would be treated as unexpected and canceled.
    let receiver_listener: Arc<dyn nearlink::PayloadStatusListener> =
        Arc::new(RecordingPayloadListener::default());
    advertiser
        .manager
        .register_payload_status_listener(payload_id, &receiver_listener);

    let sender_listener = Arc::new(RecordingPayloadListener::default());
    discoverer.manager.send(
        &endpoint_id,
        payload,
        Some(Arc::clone(&sender_listener) as Arc<dyn nearlink::PayloadStatusListener>),
    );

    // The sender observes a terminal success.
    let sender_updates = wait_for(|| {
        let updates: Vec<_> = sender_listener
            .snapshot()
            .into_iter()
            .filter(|update| update.payload_id == payload_id)
            .collect();
        updates
            .iter()
            .any(|update| update.status == PayloadStatus::Success)
            .then_some(updates)
    })
    .await;
    let terminal_count = sender_updates
        .iter()
        .filter(|update| update.status.is_terminal())
        .count();
    assert_eq!(1, terminal_count);
    for pair in sender_updates.windows(2) {
        assert_eq!(true, pair[0].bytes_transferred <= pair[1].bytes_transferred);
    }

    // The receiver materialized the bytes under the configured directory.
    let received_path = wait_for(|| {
        std::fs::read_dir(&save_dir)
            .ok()?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .find(|path| {
                path.file_name()
                    .is_some_and(|name| name.to_string_lossy().ends_with("outgoing.bin"))
            })
    })
    .await;
    let received = wait_for(|| {
        let bytes = std::fs::read(&received_path).ok()?;
        (bytes.len() == body.len()).then_some(bytes)
    })
    .await;
    assert_eq!(body, received);

    Ok(())
}
