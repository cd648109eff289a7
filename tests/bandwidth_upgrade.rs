mod support;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use nearlink::{
    AnalyticsEvent, DataUsage, FeatureFlags, Medium, MediumHub, PowerLevel, TransportType,
};
use support::{RecordingDiscovery, RecordingIncoming, build_peer, wait_for};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_upgrade_moves_the_session_and_traffic_survives() -> anyhow::Result<()> {
    let hub = MediumHub::new();
    let advertiser = build_peer(&hub, "NearbySharing", FeatureFlags::default());
    let discoverer = build_peer(&hub, "NearbySharing", FeatureFlags::default());

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

    let connection = discoverer
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
    let advertiser_side = wait_for(|| incoming.first_connection()).await;

    let status = discoverer.manager.upgrade_bandwidth(&endpoint_id).await;
    assert_eq!(true, status.is_success());

    // AWDL tops the preference order, so the upgrade lands there.
    let upgraded_medium = wait_for(|| {
        discoverer
            .analytics
            .events()
            .into_iter()
            .find_map(|event| match event {
                AnalyticsEvent::UpgradeSuccess { medium, .. } => Some(medium),
                _ => None,
            })
    })
    .await;
    assert_eq!(Medium::Awdl, upgraded_medium);

    wait_for(|| {
        advertiser
            .analytics
            .events()
            .into_iter()
            .find_map(|event| match event {
                AnalyticsEvent::UpgradeSuccess { medium, .. } => Some(medium),
                _ => None,
            })
    })
    .await;

    // The logical endpoint survived the swap in both directions.
    connection
        .write(vec![0x42, 0x43])
        .map_err(|status| anyhow::anyhow!("write failed: {status}"))?;
    let received = tokio::time::timeout(std::time::Duration::from_secs(5), advertiser_side.read())
        .await?
        .expect("bytes should cross the upgraded channel");
    assert_eq!(vec![0x42, 0x43], received);

    advertiser_side
        .write(vec![0x44])
        .map_err(|status| anyhow::anyhow!("write failed: {status}"))?;
    let echoed = tokio::time::timeout(std::time::Duration::from_secs(5), connection.read())
        .await?
        .expect("bytes should cross back");
    assert_eq!(vec![0x44], echoed);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_upgrade_request_while_in_flight_is_rejected() -> anyhow::Result<()> {
    let hub = MediumHub::new();
    let advertiser = build_peer(&hub, "NearbySharing", FeatureFlags::default());
    let discoverer = build_peer(&hub, "NearbySharing", FeatureFlags::default());

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

    let first = discoverer.manager.upgrade_bandwidth(&endpoint_id).await;
    let second = discoverer.manager.upgrade_bandwidth(&endpoint_id).await;

    assert_eq!(true, first.is_success());
    // Either the first upgrade is still negotiating (out-of-order) or it
    // already finished, in which case a new request picks a fresh medium.
    assert_eq!(
        true,
        second == nearlink::Status::OutOfOrderCall || second.is_success()
    );

    Ok(())
}
