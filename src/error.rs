use std::io;

use serde_with::SerializeDisplay;
use strum_macros::Display;
use thiserror::Error;

use crate::frame::FrameCodecError;
use crate::medium::Medium;

/// Operation outcome surfaced to clients of the connections core.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, SerializeDisplay)]
pub enum Status {
    #[strum(to_string = "success")]
    Success,
    #[strum(to_string = "error")]
    Error,
    #[strum(to_string = "out_of_order_call")]
    OutOfOrderCall,
    #[strum(to_string = "already_have_active_strategy")]
    AlreadyHaveActiveStrategy,
    #[strum(to_string = "already_advertising")]
    AlreadyAdvertising,
    #[strum(to_string = "already_discovering")]
    AlreadyDiscovering,
    #[strum(to_string = "already_listening")]
    AlreadyListening,
    #[strum(to_string = "endpoint_io_error")]
    EndpointIoError,
    #[strum(to_string = "endpoint_unknown")]
    EndpointUnknown,
    #[strum(to_string = "connection_rejected")]
    ConnectionRejected,
    #[strum(to_string = "already_connected_to_endpoint")]
    AlreadyConnectedToEndpoint,
    #[strum(to_string = "not_connected_to_endpoint")]
    NotConnectedToEndpoint,
    #[strum(to_string = "bluetooth_error")]
    BluetoothError,
    #[strum(to_string = "ble_error")]
    BleError,
    #[strum(to_string = "wifi_lan_error")]
    WifiLanError,
    #[strum(to_string = "payload_unknown")]
    PayloadUnknown,
    #[strum(to_string = "reset")]
    Reset,
    #[strum(to_string = "timeout")]
    Timeout,
    #[strum(to_string = "unknown")]
    Unknown,
}

impl Status {
    /// Returns whether this status reports a completed operation.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Errors surfaced by medium drivers while discovering, dialing, or listening.
#[derive(Debug, Error)]
pub enum MediumError {
    #[error("medium `{medium}` is not available on this device")]
    NotAvailable { medium: Medium },
    #[error("no advertised service `{service_name}` was found before the deadline")]
    ServiceNotFound { service_name: String },
    #[error("the remote listener refused the connection")]
    Refused,
    #[error("credentials were rejected by the remote listener")]
    BadCredentials,
    #[error("listener for service `{service_name}` is already registered")]
    AlreadyListening { service_name: String },
    #[error("BLE scanning failed")]
    Ble(#[from] btleplug::Error),
    #[error("transport I/O failed")]
    Io(#[from] io::Error),
}

/// Errors raised on a single endpoint channel.
///
/// The reader loop keys its recovery policy off these variants: `Io` and
/// `InvalidFrame` are retried against the freshly fetched channel, while
/// `Interrupted` always terminates the loop.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel I/O failed")]
    Io(#[from] io::Error),
    #[error("received bytes did not decode into a frame")]
    InvalidFrame(#[from] FrameCodecError),
    #[error("channel was closed locally")]
    Interrupted,
    #[error("frame of {frame_len} bytes exceeds the channel packet limit of {max_packet_size}")]
    FrameTooLarge {
        frame_len: usize,
        max_packet_size: usize,
    },
    #[error("encryption context rejected the frame")]
    Decrypt,
}

impl ChannelError {
    /// Returns whether the reader may retry this failure on a replacement channel.
    #[must_use]
    pub(crate) fn is_decode_failure(&self) -> bool {
        matches!(self, Self::InvalidFrame(_) | Self::Decrypt)
    }
}

impl From<ChannelError> for Status {
    fn from(value: ChannelError) -> Self {
        match value {
            ChannelError::Interrupted => Self::Reset,
            _ => Self::EndpointIoError,
        }
    }
}

impl From<MediumError> for Status {
    fn from(value: MediumError) -> Self {
        match value {
            MediumError::NotAvailable { medium } => match medium {
                Medium::Bluetooth => Self::BluetoothError,
                Medium::Ble => Self::BleError,
                Medium::WifiLan => Self::WifiLanError,
                _ => Self::Error,
            },
            MediumError::ServiceNotFound { .. } => Self::EndpointUnknown,
            MediumError::Refused | MediumError::BadCredentials => Self::ConnectionRejected,
            MediumError::AlreadyListening { .. } => Self::AlreadyListening,
            MediumError::Ble(_) => Self::BleError,
            MediumError::Io(_) => Self::EndpointIoError,
        }
    }
}
