use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{DiscoveredPeer, DiscoveryEvent, Medium};
use crate::error::MediumError;
use crate::ids::EndpointId;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Manufacturer-data key our advertisements are published under.
pub(crate) const MANUFACTURER_ID: u16 = 0x00E0;

/// OS-level BLE discovery driver.
///
/// Polls every adapter's peripheral table for manufacturer-data records under
/// our manufacturer id and surfaces them as discovery events. The record
/// layout matches what our own advertiser publishes: the first four bytes are
/// the ASCII endpoint id, the remainder the opaque endpoint info.
#[derive(Debug)]
pub struct BleScanner {
    manager: Manager,
}

impl BleScanner {
    /// Creates a scanner over the platform Bluetooth stack.
    ///
    /// # Errors
    ///
    /// Returns an error when the platform manager cannot be created.
    pub async fn new() -> Result<Self, MediumError> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    /// Scans until cancelled, forwarding events to `events`.
    ///
    /// # Errors
    ///
    /// Returns an error when no adapter is usable or scanning fails to start.
    #[instrument(skip(self, events, cancel), level = "debug")]
    pub async fn run(
        &self,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
        cancel: CancellationToken,
    ) -> Result<(), MediumError> {
        let adapters = self.adapters().await?;
        info!(adapter_count = adapters.len(), "starting BLE scan");
        for adapter in &adapters {
            adapter.start_scan(ScanFilter::default()).await?;
        }

        let mut seen: Vec<EndpointId> = Vec::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            for adapter in &adapters {
                let peripherals = adapter.peripherals().await?;
                for peripheral in peripherals {
                    let Some(properties) = peripheral.properties().await? else {
                        continue;
                    };
                    let Some(record) = properties.manufacturer_data.get(&MANUFACTURER_ID) else {
                        continue;
                    };
                    let Some(peer) = decode_advertisement(record) else {
                        continue;
                    };
                    if seen.contains(&peer.endpoint_id) {
                        continue;
                    }
                    seen.push(peer.endpoint_id.clone());
                    if events.send(DiscoveryEvent::Found(peer)).is_err() {
                        break;
                    }
                }
            }
            sleep(SCAN_POLL_INTERVAL).await;
        }

        for adapter in &adapters {
            if let Err(error) = adapter.stop_scan().await {
                debug!(?error, "failed to stop adapter scan cleanly");
            }
        }
        Ok(())
    }

    async fn adapters(&self) -> Result<Vec<Adapter>, MediumError> {
        let adapters = self.manager.adapters().await?;
        if adapters.is_empty() {
            return Err(MediumError::NotAvailable {
                medium: Medium::Ble,
            });
        }
        Ok(adapters)
    }
}

fn decode_advertisement(record: &[u8]) -> Option<DiscoveredPeer> {
    let (id, info) = record.split_at_checked(crate::config::ENDPOINT_ID_LENGTH)?;
    let endpoint_id = std::str::from_utf8(id).ok()?;
    if !endpoint_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(DiscoveredPeer {
        endpoint_id: EndpointId::from(endpoint_id),
        service_name: String::new(),
        endpoint_info: info.to_vec(),
        medium: Medium::Ble,
    })
}
