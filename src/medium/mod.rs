mod ble_scan;
mod credentials;
mod hub;
mod wifi_lan;

use serde_with::SerializeDisplay;
use strum_macros::{Display, EnumIter};
use tokio::io::{AsyncRead, AsyncWrite};

pub use ble_scan::BleScanner;
pub use credentials::{UpgradeCredentials, generate_password, generate_service_name, service_type_for};
pub use hub::{AdvertisedService, DiscoverySession, MediumHub};
pub use wifi_lan::{WifiLanDialer, WifiLanListener};

use crate::ids::EndpointId;

/// A concrete wireless transport.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, SerializeDisplay,
)]
pub enum Medium {
    #[strum(to_string = "bluetooth")]
    Bluetooth,
    #[strum(to_string = "ble")]
    Ble,
    #[strum(to_string = "wifi_lan")]
    WifiLan,
    #[strum(to_string = "wifi_hotspot")]
    WifiHotspot,
    #[strum(to_string = "awdl")]
    Awdl,
    #[strum(to_string = "web_rtc")]
    WebRtc,
}

impl Medium {
    /// Returns whether transfers on this medium count as high quality.
    #[must_use]
    pub const fn is_high_quality(self) -> bool {
        !matches!(self, Self::Bluetooth | Self::Ble)
    }

    /// Returns whether this medium routes traffic through the internet.
    #[must_use]
    pub const fn requires_internet(self) -> bool {
        matches!(self, Self::WebRtc)
    }

    /// Largest frame accepted on a single packet of this medium.
    #[must_use]
    pub const fn max_packet_size(self) -> usize {
        match self {
            Self::Bluetooth => 1980,
            Self::Ble => 512,
            Self::WifiLan | Self::WifiHotspot | Self::Awdl => 1024 * 1024,
            Self::WebRtc => 256 * 1024,
        }
    }
}

/// Byte pipe produced by a medium driver.
pub trait MediumSocket: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> MediumSocket for T {}

/// Owned, type-erased medium socket.
pub type BoxedSocket = Box<dyn MediumSocket>;

/// A peer surfaced by discovery.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DiscoveredPeer {
    pub endpoint_id: EndpointId,
    pub service_name: String,
    pub endpoint_info: Vec<u8>,
    pub medium: Medium,
}

/// Event stream element emitted by a discovery session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DiscoveryEvent {
    Found(DiscoveredPeer),
    Lost { endpoint_id: EndpointId },
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Medium::Bluetooth, false)]
    #[case(Medium::Ble, false)]
    #[case(Medium::WifiLan, true)]
    #[case(Medium::Awdl, true)]
    #[case(Medium::WebRtc, true)]
    fn high_quality_excludes_seed_radios(#[case] medium: Medium, #[case] expected: bool) {
        assert_eq!(expected, medium.is_high_quality());
    }

    #[test]
    fn only_webrtc_requires_internet() {
        assert_eq!(true, Medium::WebRtc.requires_internet());
        assert_eq!(false, Medium::WifiHotspot.requires_internet());
    }
}
