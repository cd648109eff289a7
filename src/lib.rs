mod analytics;
mod bwu;
mod channel;
mod channel_manager;
mod config;
mod connection;
mod encryption;
mod endpoint_manager;
mod error;
mod frame;
mod ids;
mod manager;
mod medium;
mod payload;
mod payload_manager;
mod reconnect;
mod service;
mod telemetry;
mod transfer_manager;

pub use analytics::{
    AnalyticsEvent, AnalyticsRecorder, DisconnectionReason, InMemoryAnalyticsRecorder,
    NoopAnalyticsRecorder,
};
pub use bwu::{BwuHandler, BwuManager, HubBwuHandler, UpgradePath, WifiLanBwuHandler};
pub use channel::{EndpointChannel, LinkInfo, PacketMetaData};
pub use channel_manager::EndpointChannelManager;
pub use config::{
    AdvertisingOptions, AllowedMediums, ConnectionOptions, DataUsage, DiscoveryOptions,
    FeatureFlags, INITIATE_CONNECTION_TIMEOUT, KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIMEOUT,
    MEDIUM_UPGRADE_TIMEOUT, MINIMUM_ADVERTISEMENT_SIZE, PowerLevel, TransportType,
};
pub use connection::{NearbyConnection, NoopWakeLockProvider, WakeLease, WakeLockProvider};
pub use encryption::{CipherContext, EncryptionRunner, HandshakeError, HandshakeOutcome, HandshakeRole};
pub use endpoint_manager::{
    ClientProxy, ConnectionInfo, CountDownLatch, EndpointManager, FrameProcessor,
};
pub use error::{ChannelError, MediumError, Status};
pub use frame::{
    AutoReconnectEvent, BwuEvent, ConnectionRequest, ConnectionResponse, ControlMessage, Frame,
    FrameCodecError, FrameType, PayloadChunk, PayloadHeader, PayloadTransferBody,
};
pub use ids::{EndpointId, PayloadId, ServiceId};
pub use manager::{DiscoveryListener, IncomingConnectionListener, NearbyConnectionsManager};
pub use medium::{
    AdvertisedService, BleScanner, BoxedSocket, DiscoveredPeer, DiscoveryEvent, DiscoverySession,
    Medium, MediumHub, MediumSocket, UpgradeCredentials,
};
pub use payload::{
    Payload, PayloadKind, PayloadStatus, PayloadStatusListener, PayloadTransferUpdate,
    StreamPayload,
};
pub use payload_manager::{PayloadEventSink, PayloadManager};
pub use reconnect::{AutoReconnectManager, ReconnectDelegate, ReconnectInfo};
pub use service::{ConnectionsService, OfflineService, ServiceDelegate};
pub use telemetry::initialise_tracing;
pub use transfer_manager::TransferManager;
