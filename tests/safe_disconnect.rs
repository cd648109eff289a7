mod support;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use nearlink::{AnalyticsEvent, DataUsage, FeatureFlags, MediumHub, PowerLevel, TransportType};
use support::{RecordingDiscovery, RecordingIncoming, build_peer, wait_for};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn safe_disconnect_handshake_marks_both_sides_safe() -> anyhow::Result<()> {
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
    let _advertiser_side = wait_for(|| incoming.first_connection()).await;

    // Client-driven close runs the two-frame handshake.
    connection.close().await;

    wait_for(|| (discoverer.analytics.disconnection_count(true) > 0).then_some(())).await;
    wait_for(|| (advertiser.analytics.disconnection_count(true) > 0).then_some(())).await;

    assert_eq!(0, discoverer.analytics.disconnection_count(false));
    assert_eq!(0, advertiser.analytics.disconnection_count(false));

    // Neither journal contains an I/O-error teardown or keep-alive loss.
    for analytics in [&discoverer.analytics, &advertiser.analytics] {
        let io_errors = analytics
            .events()
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    AnalyticsEvent::Disconnection {
                        reason: nearlink::DisconnectionReason::IoError,
                        ..
                    } | AnalyticsEvent::KeepAliveTimeout { .. }
                )
            })
            .count();
        assert_eq!(0, io_errors);
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_close_is_idempotent() -> anyhow::Result<()> {
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

    let closes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    connection.set_disconnect_listener(move || {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    connection.close().await;
    connection.close().await;
    connection.close().await;

    assert_eq!(1, closes.load(std::sync::atomic::Ordering::SeqCst));
    wait_for(|| (discoverer.analytics.disconnection_count(true) > 0).then_some(())).await;
    assert_eq!(1, discoverer.analytics.disconnection_count(true));

    Ok(())
}
