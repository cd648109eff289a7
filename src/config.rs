use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::medium::Medium;

/// How often a keep-alive frame is written when the channel is otherwise idle.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// How long a channel may stay silent before the keep-alive loop drops it.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for an outgoing connection to reach the accepted state.
pub const INITIATE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Barrier deadline for frame processors handling an endpoint disconnection.
pub const DISCONNECT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(11);

/// Deadline for re-decrypting a frame that raced the encryption enable event.
pub const ENCRYPTION_RACE_RETRY_DEADLINE: Duration = Duration::from_secs(3);

/// Poll interval while waiting out the encryption race.
pub const ENCRYPTION_RACE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Deadline for the upgrade target to find the initiator's upgraded service.
pub const UPGRADE_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long queued file sends wait for a high-quality medium before flushing.
pub const MEDIUM_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the upgrade initiator accepts on the new medium before reverting.
pub const UPGRADE_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the introduction exchange on a freshly dialed upgrade socket.
pub const UPGRADE_INTRODUCTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for reading a single expected frame on a fresh channel.
pub const READ_FRAMES_TIMEOUT: Duration = Duration::from_secs(15);

/// Minimum spacing between non-terminal transfer progress updates.
pub const MIN_PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Window after a channel replacement during which an I/O teardown is deferred
/// for one extra read attempt on the freshly published channel.
pub const CHANNEL_REPLACEMENT_GRACE: Duration = Duration::from_millis(500);

/// Window during which a dropped channel may be transparently re-established.
pub const AUTO_RECONNECT_GRACE: Duration = Duration::from_secs(10);

/// How long a locally initiated safe disconnect waits for the remote ack.
pub const SAFE_DISCONNECT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on concurrently handled inbound sockets per listener.
pub const MAX_CONCURRENT_ACCEPTS: usize = 5;

/// Largest endpoint-info byte count that still fits a fast advertisement:
/// one version/flags byte, a 2-byte salt, and a 14-byte metadata key hash.
pub const MINIMUM_ADVERTISEMENT_SIZE: usize = 1 + 2 + 14;

/// Length of locally generated endpoint ids.
pub const ENDPOINT_ID_LENGTH: usize = 4;

/// Data-usage policy gating internet-requiring mediums.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize, Deserialize)]
pub enum DataUsage {
    /// Never touch mediums that route through the internet.
    #[strum(to_string = "offline")]
    Offline,
    /// Online mediums allowed only while on unmetered Wi-Fi.
    #[strum(to_string = "wifi_only")]
    WifiOnly,
    /// Online mediums always allowed.
    #[strum(to_string = "online")]
    Online,
}

/// Power budget gating the listening radios.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize, Deserialize)]
pub enum PowerLevel {
    #[strum(to_string = "low")]
    Low,
    #[strum(to_string = "high")]
    High,
}

/// Transfer-quality expectation attached to an outgoing connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize, Deserialize)]
pub enum TransportType {
    #[strum(to_string = "any")]
    Any,
    #[strum(to_string = "high_quality")]
    HighQuality,
    #[strum(to_string = "high_quality_non_disruptive")]
    HighQualityNonDisruptive,
}

impl TransportType {
    /// Returns whether file payloads should wait for a high-quality medium.
    #[must_use]
    pub const fn wants_high_quality(self) -> bool {
        matches!(self, Self::HighQuality | Self::HighQualityNonDisruptive)
    }
}

/// Explicit per-medium allowance set.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct AllowedMediums {
    pub bluetooth: bool,
    pub ble: bool,
    pub web_rtc: bool,
    pub wifi_lan: bool,
    pub wifi_hotspot: bool,
}

impl AllowedMediums {
    /// Returns whether `medium` is enabled in this set.
    #[must_use]
    pub const fn allows(&self, medium: Medium) -> bool {
        match medium {
            Medium::Bluetooth => self.bluetooth,
            Medium::Ble => self.ble,
            Medium::WebRtc => self.web_rtc,
            Medium::WifiLan => self.wifi_lan,
            Medium::WifiHotspot => self.wifi_hotspot,
            // AWDL piggybacks on the Wi-Fi allowance.
            Medium::Awdl => self.wifi_lan,
        }
    }
}

impl Default for AllowedMediums {
    fn default() -> Self {
        Self {
            bluetooth: true,
            ble: true,
            web_rtc: false,
            wifi_lan: true,
            wifi_hotspot: true,
        }
    }
}

/// Per-connection options negotiated at registration time.
#[derive(Debug, Clone, Builder)]
pub struct ConnectionOptions {
    #[builder(default = KEEP_ALIVE_INTERVAL)]
    pub keep_alive_interval: Duration,
    #[builder(default = KEEP_ALIVE_TIMEOUT)]
    pub keep_alive_timeout: Duration,
    #[builder(default)]
    pub allowed_mediums: AllowedMediums,
    /// Upgrades are always explicit in this core.
    #[builder(default = false)]
    pub auto_upgrade_bandwidth: bool,
    #[builder(default = true)]
    pub enforce_topology_constraints: bool,
    #[builder(default = false)]
    pub enable_bluetooth_listening: bool,
    #[builder(default = false)]
    pub enable_webrtc_listening: bool,
    #[builder(default = false)]
    pub use_stable_endpoint_id: bool,
    #[builder(default = false)]
    pub non_disruptive_hotspot_mode: bool,
    pub fast_advertisement_service_uuid: Option<String>,
    #[builder(default = TransportType::Any)]
    pub transport_type: TransportType,
    #[builder(default = DataUsage::Offline)]
    pub data_usage: DataUsage,
    #[builder(default = PowerLevel::High)]
    pub power_level: PowerLevel,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Options controlling one advertising session.
#[derive(Debug, Clone, Builder)]
pub struct AdvertisingOptions {
    #[builder(default = PowerLevel::High)]
    pub power_level: PowerLevel,
    #[builder(default = DataUsage::Offline)]
    pub data_usage: DataUsage,
    #[builder(default = false)]
    pub use_stable_endpoint_id: bool,
    #[builder(default = false)]
    pub enable_bluetooth_listening: bool,
    pub fast_advertisement_service_uuid: Option<String>,
}

impl Default for AdvertisingOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Options controlling one discovery session.
#[derive(Debug, Clone, Builder)]
pub struct DiscoveryOptions {
    #[builder(default = DataUsage::Offline)]
    pub data_usage: DataUsage,
    /// Also drive the OS BLE scanner instead of only the in-process fabric.
    #[builder(default = false)]
    pub hardware_ble_scan: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Feature toggles passed to the façade at construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Cancel unexpected incoming file payloads and queue their paths for
    /// deletion.
    pub delete_unexpected_received_files: bool,
    /// Re-dial a dropped channel within the grace window instead of
    /// surfacing the disconnect immediately.
    pub auto_reconnect: bool,
    /// Advertise the safe-disconnect capability on new connections.
    pub safe_disconnect: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            delete_unexpected_received_files: true,
            auto_reconnect: false,
            safe_disconnect: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn connection_options_defaults_match_policy() {
        let options = ConnectionOptions::default();
        assert_eq!(KEEP_ALIVE_INTERVAL, options.keep_alive_interval);
        assert_eq!(KEEP_ALIVE_TIMEOUT, options.keep_alive_timeout);
        assert_eq!(false, options.auto_upgrade_bandwidth);
        assert_eq!(true, options.enforce_topology_constraints);
        assert_eq!(None, options.fast_advertisement_service_uuid);
    }

    #[rstest]
    #[case(TransportType::Any, false)]
    #[case(TransportType::HighQuality, true)]
    #[case(TransportType::HighQualityNonDisruptive, true)]
    fn transport_type_gates_high_quality(#[case] transport: TransportType, #[case] expected: bool) {
        assert_eq!(expected, transport.wants_high_quality());
    }

    #[rstest]
    #[case(Medium::Bluetooth, true)]
    #[case(Medium::WebRtc, false)]
    #[case(Medium::Awdl, true)]
    fn allowed_mediums_default_set(#[case] medium: Medium, #[case] expected: bool) {
        assert_eq!(expected, AllowedMediums::default().allows(medium));
    }
}
