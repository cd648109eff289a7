use strum_macros::{Display, EnumIter};
use thiserror::Error;

use crate::ids::{EndpointId, PayloadId};
use crate::medium::{Medium, UpgradeCredentials};
use crate::payload::PayloadKind;

const CRC_LEN: usize = 4;
const MIN_FRAME_LEN: usize = 1 + CRC_LEN;

/// Errors returned by frame encoding and decoding.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FrameCodecError {
    /// The frame has fewer bytes than a tag plus checksum.
    #[error("frame is too short: expected at least {MIN_FRAME_LEN} bytes, got {actual}")]
    TooShort { actual: usize },
    /// The trailing checksum does not match the frame body.
    #[error("frame checksum mismatch: declared {declared:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { declared: u32, computed: u32 },
    /// The frame-type tag is outside the known set.
    #[error("unknown frame type tag {tag}")]
    UnknownFrameType { tag: u8 },
    /// A sub-event tag is outside the known set for its frame type.
    #[error("unknown {scope} event tag {tag}")]
    UnknownEventTag { scope: &'static str, tag: u8 },
    /// A field extended past the end of the frame.
    #[error("frame truncated while reading `{field}`")]
    Truncated { field: &'static str },
    /// Bytes remained after the last field of the frame.
    #[error("frame has {remaining} undecoded trailing bytes")]
    TrailingBytes { remaining: usize },
    /// A string field held invalid UTF-8.
    #[error("frame field `{field}` is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    /// A medium tag is outside the known set.
    #[error("unknown medium tag {tag}")]
    UnknownMedium { tag: u8 },
}

/// Frame discriminant carried in the envelope.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter)]
pub enum FrameType {
    #[strum(to_string = "connection_request")]
    ConnectionRequest,
    #[strum(to_string = "connection_response")]
    ConnectionResponse,
    #[strum(to_string = "payload_transfer")]
    PayloadTransfer,
    #[strum(to_string = "bandwidth_upgrade_negotiation")]
    BandwidthUpgradeNegotiation,
    #[strum(to_string = "keep_alive")]
    KeepAlive,
    #[strum(to_string = "disconnection")]
    Disconnection,
    #[strum(to_string = "auto_reconnect")]
    AutoReconnect,
}

impl FrameType {
    const fn tag(self) -> u8 {
        match self {
            Self::ConnectionRequest => 0x01,
            Self::ConnectionResponse => 0x02,
            Self::PayloadTransfer => 0x03,
            Self::BandwidthUpgradeNegotiation => 0x04,
            Self::KeepAlive => 0x05,
            Self::Disconnection => 0x06,
            Self::AutoReconnect => 0x07,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, FrameCodecError> {
        match tag {
            0x01 => Ok(Self::ConnectionRequest),
            0x02 => Ok(Self::ConnectionResponse),
            0x03 => Ok(Self::PayloadTransfer),
            0x04 => Ok(Self::BandwidthUpgradeNegotiation),
            0x05 => Ok(Self::KeepAlive),
            0x06 => Ok(Self::Disconnection),
            0x07 => Ok(Self::AutoReconnect),
            _ => Err(FrameCodecError::UnknownFrameType { tag }),
        }
    }
}

/// Opening frame written by the dialing side.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionRequest {
    pub endpoint_id: EndpointId,
    pub endpoint_info: Vec<u8>,
    pub nonce: u32,
    pub keep_alive_interval_millis: u32,
    pub keep_alive_timeout_millis: u32,
    pub supported_mediums: Vec<Medium>,
    pub safe_to_disconnect: bool,
}

/// Accept/reject answer to a connection request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectionResponse {
    pub accepted: bool,
    pub safe_to_disconnect: bool,
}

/// Header shared by all payload-transfer frames of one payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PayloadHeader {
    pub id: PayloadId,
    pub kind: PayloadKind,
    pub total_size: i64,
    pub file_name: Option<String>,
}

/// One data chunk of a payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PayloadChunk {
    pub offset: i64,
    pub is_last: bool,
    pub body: Vec<u8>,
}

/// Out-of-band payload control event.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ControlMessage {
    PayloadCanceled { offset: i64 },
    PayloadError { offset: i64 },
}

/// Data or control body of a payload-transfer frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PayloadTransferBody {
    Data(PayloadChunk),
    Control(ControlMessage),
}

/// Bandwidth-upgrade negotiation events.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BwuEvent {
    UpgradePathAvailable {
        medium: Medium,
        credentials: UpgradeCredentials,
    },
    LastWriteToPriorChannel,
    SafeToClosePriorChannel,
    ClientIntroduction {
        endpoint_id: EndpointId,
    },
    ClientIntroductionAck,
}

/// Auto-reconnect negotiation events.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AutoReconnectEvent {
    ClientIntroduction { endpoint_id: EndpointId },
    ClientIntroductionAck,
}

/// One wire-level unit exchanged on a channel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    PayloadTransfer {
        header: PayloadHeader,
        body: PayloadTransferBody,
    },
    BandwidthUpgradeNegotiation(BwuEvent),
    KeepAlive,
    Disconnection {
        request_safe_to_disconnect: bool,
        ack_safe_to_disconnect: bool,
    },
    AutoReconnect(AutoReconnectEvent),
}

impl Frame {
    /// Returns this frame's envelope discriminant.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::ConnectionRequest(_) => FrameType::ConnectionRequest,
            Self::ConnectionResponse(_) => FrameType::ConnectionResponse,
            Self::PayloadTransfer { .. } => FrameType::PayloadTransfer,
            Self::BandwidthUpgradeNegotiation(_) => FrameType::BandwidthUpgradeNegotiation,
            Self::KeepAlive => FrameType::KeepAlive,
            Self::Disconnection { .. } => FrameType::Disconnection,
            Self::AutoReconnect(_) => FrameType::AutoReconnect,
        }
    }

    /// Encodes the frame as tag, fields, and trailing CRC-32.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = FrameWriter::new(self.frame_type().tag());
        match self {
            Self::ConnectionRequest(request) => {
                writer.put_str(request.endpoint_id.as_str());
                writer.put_bytes(&request.endpoint_info);
                writer.put_u32(request.nonce);
                writer.put_u32(request.keep_alive_interval_millis);
                writer.put_u32(request.keep_alive_timeout_millis);
                writer.put_u8(request.supported_mediums.len() as u8);
                for medium in &request.supported_mediums {
                    writer.put_u8(medium_tag(*medium));
                }
                writer.put_bool(request.safe_to_disconnect);
            }
            Self::ConnectionResponse(response) => {
                writer.put_bool(response.accepted);
                writer.put_bool(response.safe_to_disconnect);
            }
            Self::PayloadTransfer { header, body } => {
                writer.put_i64(header.id.value());
                writer.put_u8(payload_kind_tag(header.kind));
                writer.put_i64(header.total_size);
                match &header.file_name {
                    Some(name) => {
                        writer.put_bool(true);
                        writer.put_str(name);
                    }
                    None => writer.put_bool(false),
                }
                match body {
                    PayloadTransferBody::Data(chunk) => {
                        writer.put_u8(0x01);
                        writer.put_i64(chunk.offset);
                        writer.put_bool(chunk.is_last);
                        writer.put_bytes(&chunk.body);
                    }
                    PayloadTransferBody::Control(control) => {
                        writer.put_u8(0x02);
                        match control {
                            ControlMessage::PayloadCanceled { offset } => {
                                writer.put_u8(0x01);
                                writer.put_i64(*offset);
                            }
                            ControlMessage::PayloadError { offset } => {
                                writer.put_u8(0x02);
                                writer.put_i64(*offset);
                            }
                        }
                    }
                }
            }
            Self::BandwidthUpgradeNegotiation(event) => match event {
                BwuEvent::UpgradePathAvailable {
                    medium,
                    credentials,
                } => {
                    writer.put_u8(0x01);
                    writer.put_u8(medium_tag(*medium));
                    encode_credentials(&mut writer, credentials);
                }
                BwuEvent::LastWriteToPriorChannel => writer.put_u8(0x02),
                BwuEvent::SafeToClosePriorChannel => writer.put_u8(0x03),
                BwuEvent::ClientIntroduction { endpoint_id } => {
                    writer.put_u8(0x04);
                    writer.put_str(endpoint_id.as_str());
                }
                BwuEvent::ClientIntroductionAck => writer.put_u8(0x05),
            },
            Self::KeepAlive => {}
            Self::Disconnection {
                request_safe_to_disconnect,
                ack_safe_to_disconnect,
            } => {
                writer.put_bool(*request_safe_to_disconnect);
                writer.put_bool(*ack_safe_to_disconnect);
            }
            Self::AutoReconnect(event) => match event {
                AutoReconnectEvent::ClientIntroduction { endpoint_id } => {
                    writer.put_u8(0x01);
                    writer.put_str(endpoint_id.as_str());
                }
                AutoReconnectEvent::ClientIntroductionAck => writer.put_u8(0x02),
            },
        }
        writer.finish()
    }

    /// Decodes a frame, validating the trailing checksum.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes are truncated, carry an unknown tag,
    /// fail the checksum, or leave undecoded trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameCodecError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(FrameCodecError::TooShort {
                actual: bytes.len(),
            });
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - CRC_LEN);
        let declared = u32::from_le_bytes(
            crc_bytes
                .try_into()
                .expect("split_at leaves exactly CRC_LEN bytes"),
        );
        let computed = crc32fast::hash(body);
        if declared != computed {
            return Err(FrameCodecError::ChecksumMismatch { declared, computed });
        }

        let mut reader = FrameReader::new(&body[1..]);
        let frame = match FrameType::from_tag(body[0])? {
            FrameType::ConnectionRequest => {
                let endpoint_id = EndpointId::from(reader.take_str("endpoint_id")?);
                let endpoint_info = reader.take_bytes("endpoint_info")?;
                let nonce = reader.take_u32("nonce")?;
                let keep_alive_interval_millis = reader.take_u32("keep_alive_interval")?;
                let keep_alive_timeout_millis = reader.take_u32("keep_alive_timeout")?;
                let medium_count = reader.take_u8("medium_count")?;
                let mut supported_mediums = Vec::with_capacity(usize::from(medium_count));
                for _slot in 0..medium_count {
                    supported_mediums.push(medium_from_tag(reader.take_u8("medium")?)?);
                }
                let safe_to_disconnect = reader.take_bool("safe_to_disconnect")?;
                Self::ConnectionRequest(ConnectionRequest {
                    endpoint_id,
                    endpoint_info,
                    nonce,
                    keep_alive_interval_millis,
                    keep_alive_timeout_millis,
                    supported_mediums,
                    safe_to_disconnect,
                })
            }
            FrameType::ConnectionResponse => Self::ConnectionResponse(ConnectionResponse {
                accepted: reader.take_bool("accepted")?,
                safe_to_disconnect: reader.take_bool("safe_to_disconnect")?,
            }),
            FrameType::PayloadTransfer => {
                let id = PayloadId::new(reader.take_i64("payload_id")?);
                let kind = payload_kind_from_tag(reader.take_u8("payload_kind")?)?;
                let total_size = reader.take_i64("total_size")?;
                let file_name = if reader.take_bool("has_file_name")? {
                    Some(reader.take_str("file_name")?)
                } else {
                    None
                };
                let header = PayloadHeader {
                    id,
                    kind,
                    total_size,
                    file_name,
                };
                let body = match reader.take_u8("transfer_body")? {
                    0x01 => PayloadTransferBody::Data(PayloadChunk {
                        offset: reader.take_i64("offset")?,
                        is_last: reader.take_bool("is_last")?,
                        body: reader.take_bytes("chunk_body")?,
                    }),
                    0x02 => {
                        let control = match reader.take_u8("control_event")? {
                            0x01 => ControlMessage::PayloadCanceled {
                                offset: reader.take_i64("offset")?,
                            },
                            0x02 => ControlMessage::PayloadError {
                                offset: reader.take_i64("offset")?,
                            },
                            tag => {
                                return Err(FrameCodecError::UnknownEventTag {
                                    scope: "payload control",
                                    tag,
                                });
                            }
                        };
                        PayloadTransferBody::Control(control)
                    }
                    tag => {
                        return Err(FrameCodecError::UnknownEventTag {
                            scope: "payload transfer",
                            tag,
                        });
                    }
                };
                Self::PayloadTransfer { header, body }
            }
            FrameType::BandwidthUpgradeNegotiation => {
                let event = match reader.take_u8("bwu_event")? {
                    0x01 => {
                        let medium = medium_from_tag(reader.take_u8("medium")?)?;
                        let credentials = decode_credentials(&mut reader, medium)?;
                        BwuEvent::UpgradePathAvailable {
                            medium,
                            credentials,
                        }
                    }
                    0x02 => BwuEvent::LastWriteToPriorChannel,
                    0x03 => BwuEvent::SafeToClosePriorChannel,
                    0x04 => BwuEvent::ClientIntroduction {
                        endpoint_id: EndpointId::from(reader.take_str("endpoint_id")?),
                    },
                    0x05 => BwuEvent::ClientIntroductionAck,
                    tag => {
                        return Err(FrameCodecError::UnknownEventTag {
                            scope: "bandwidth upgrade",
                            tag,
                        });
                    }
                };
                Self::BandwidthUpgradeNegotiation(event)
            }
            FrameType::KeepAlive => Self::KeepAlive,
            FrameType::Disconnection => Self::Disconnection {
                request_safe_to_disconnect: reader.take_bool("request_safe_to_disconnect")?,
                ack_safe_to_disconnect: reader.take_bool("ack_safe_to_disconnect")?,
            },
            FrameType::AutoReconnect => {
                let event = match reader.take_u8("auto_reconnect_event")? {
                    0x01 => AutoReconnectEvent::ClientIntroduction {
                        endpoint_id: EndpointId::from(reader.take_str("endpoint_id")?),
                    },
                    0x02 => AutoReconnectEvent::ClientIntroductionAck,
                    tag => {
                        return Err(FrameCodecError::UnknownEventTag {
                            scope: "auto reconnect",
                            tag,
                        });
                    }
                };
                Self::AutoReconnect(event)
            }
        };

        reader.finish()?;
        Ok(frame)
    }
}

fn encode_credentials(writer: &mut FrameWriter, credentials: &UpgradeCredentials) {
    match credentials {
        UpgradeCredentials::WifiHotspot {
            ssid,
            password,
            gateway,
            port,
        } => {
            writer.put_str(ssid);
            writer.put_str(password);
            writer.put_str(gateway);
            writer.put_u16(*port);
        }
        UpgradeCredentials::WifiLan { ip, port } => {
            writer.put_str(ip);
            writer.put_u16(*port);
        }
        UpgradeCredentials::Awdl {
            service_name,
            service_type,
            password,
        } => {
            writer.put_str(service_name);
            writer.put_str(service_type);
            writer.put_str(password);
        }
        UpgradeCredentials::WebRtc { peer_id } => writer.put_str(peer_id),
        UpgradeCredentials::Bluetooth { mac } => writer.put_raw(mac),
    }
}

fn decode_credentials(
    reader: &mut FrameReader<'_>,
    medium: Medium,
) -> Result<UpgradeCredentials, FrameCodecError> {
    match medium {
        Medium::WifiHotspot => Ok(UpgradeCredentials::WifiHotspot {
            ssid: reader.take_str("ssid")?,
            password: reader.take_str("password")?,
            gateway: reader.take_str("gateway")?,
            port: reader.take_u16("port")?,
        }),
        Medium::WifiLan => Ok(UpgradeCredentials::WifiLan {
            ip: reader.take_str("ip")?,
            port: reader.take_u16("port")?,
        }),
        Medium::Awdl => Ok(UpgradeCredentials::Awdl {
            service_name: reader.take_str("service_name")?,
            service_type: reader.take_str("service_type")?,
            password: reader.take_str("password")?,
        }),
        Medium::WebRtc => Ok(UpgradeCredentials::WebRtc {
            peer_id: reader.take_str("peer_id")?,
        }),
        Medium::Bluetooth | Medium::Ble => {
            let raw = reader.take_raw("mac", 6)?;
            let mut mac = [0u8; 6];
            mac.copy_from_slice(raw);
            Ok(UpgradeCredentials::Bluetooth { mac })
        }
    }
}

const fn medium_tag(medium: Medium) -> u8 {
    match medium {
        Medium::Bluetooth => 0x01,
        Medium::Ble => 0x02,
        Medium::WifiLan => 0x03,
        Medium::WifiHotspot => 0x04,
        Medium::Awdl => 0x05,
        Medium::WebRtc => 0x06,
    }
}

fn medium_from_tag(tag: u8) -> Result<Medium, FrameCodecError> {
    match tag {
        0x01 => Ok(Medium::Bluetooth),
        0x02 => Ok(Medium::Ble),
        0x03 => Ok(Medium::WifiLan),
        0x04 => Ok(Medium::WifiHotspot),
        0x05 => Ok(Medium::Awdl),
        0x06 => Ok(Medium::WebRtc),
        _ => Err(FrameCodecError::UnknownMedium { tag }),
    }
}

const fn payload_kind_tag(kind: PayloadKind) -> u8 {
    match kind {
        PayloadKind::Bytes => 0x01,
        PayloadKind::File => 0x02,
        PayloadKind::Stream => 0x03,
    }
}

fn payload_kind_from_tag(tag: u8) -> Result<PayloadKind, FrameCodecError> {
    match tag {
        0x01 => Ok(PayloadKind::Bytes),
        0x02 => Ok(PayloadKind::File),
        0x03 => Ok(PayloadKind::Stream),
        _ => Err(FrameCodecError::UnknownEventTag {
            scope: "payload kind",
            tag,
        }),
    }
}

struct FrameWriter {
    buffer: Vec<u8>,
}

impl FrameWriter {
    fn new(tag: u8) -> Self {
        Self { buffer: vec![tag] }
    }

    fn put_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    fn put_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    fn put_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn put_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buffer.extend_from_slice(bytes);
    }

    fn put_str(&mut self, value: &str) {
        self.put_u16(value.len() as u16);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    fn finish(mut self) -> Vec<u8> {
        let crc = crc32fast::hash(&self.buffer);
        self.buffer.extend_from_slice(&crc.to_le_bytes());
        self.buffer
    }
}

struct FrameReader<'a> {
    bytes: &'a [u8],
}

impl<'a> FrameReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take_raw(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], FrameCodecError> {
        let (taken, rest) = self
            .bytes
            .split_at_checked(len)
            .ok_or(FrameCodecError::Truncated { field })?;
        self.bytes = rest;
        Ok(taken)
    }

    fn take_u8(&mut self, field: &'static str) -> Result<u8, FrameCodecError> {
        Ok(self.take_raw(field, 1)?[0])
    }

    fn take_bool(&mut self, field: &'static str) -> Result<bool, FrameCodecError> {
        Ok(self.take_u8(field)? != 0)
    }

    fn take_u16(&mut self, field: &'static str) -> Result<u16, FrameCodecError> {
        let raw = self.take_raw(field, 2)?;
        Ok(u16::from_le_bytes(raw.try_into().expect("exactly 2 bytes")))
    }

    fn take_u32(&mut self, field: &'static str) -> Result<u32, FrameCodecError> {
        let raw = self.take_raw(field, 4)?;
        Ok(u32::from_le_bytes(raw.try_into().expect("exactly 4 bytes")))
    }

    fn take_i64(&mut self, field: &'static str) -> Result<i64, FrameCodecError> {
        let raw = self.take_raw(field, 8)?;
        Ok(i64::from_le_bytes(raw.try_into().expect("exactly 8 bytes")))
    }

    fn take_bytes(&mut self, field: &'static str) -> Result<Vec<u8>, FrameCodecError> {
        let len = self.take_u32(field)? as usize;
        Ok(self.take_raw(field, len)?.to_vec())
    }

    fn take_str(&mut self, field: &'static str) -> Result<String, FrameCodecError> {
        let len = usize::from(self.take_u16(field)?);
        let raw = self.take_raw(field, len)?;
        String::from_utf8(raw.to_vec()).map_err(|_utf8| FrameCodecError::InvalidUtf8 { field })
    }

    fn finish(self) -> Result<(), FrameCodecError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(FrameCodecError::TrailingBytes {
                remaining: self.bytes.len(),
            })
        }
    }
}
