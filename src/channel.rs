use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::analytics::DisconnectionReason;
use crate::encryption::CipherContext;
use crate::error::ChannelError;
use crate::frame::Frame;
use crate::ids::ServiceId;
use crate::medium::{BoxedSocket, Medium};

/// AEAD tag overhead allowed on top of the packet limit for inbound messages.
const CIPHER_OVERHEAD: usize = 16;

/// Read-path timing marks handed to frame processors and analytics.
#[derive(Debug, Clone, Copy)]
pub struct PacketMetaData {
    received_at: Instant,
    decrypted_at: Option<Instant>,
    dispatched_at: Option<Instant>,
}

impl PacketMetaData {
    /// Marks the packet as received now.
    #[must_use]
    pub fn received() -> Self {
        Self {
            received_at: Instant::now(),
            decrypted_at: None,
            dispatched_at: None,
        }
    }

    /// Marks the decryption instant.
    pub fn mark_decrypted(&mut self) {
        self.decrypted_at = Some(Instant::now());
    }

    /// Marks the dispatch instant.
    pub fn mark_dispatched(&mut self) {
        self.dispatched_at = Some(Instant::now());
    }

    /// Returns when the packet was received.
    #[must_use]
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Returns the decryption instant, when the channel was encrypted.
    #[must_use]
    pub fn decrypted_at(&self) -> Option<Instant> {
        self.decrypted_at
    }

    /// Returns the dispatch instant, once set.
    #[must_use]
    pub fn dispatched_at(&self) -> Option<Instant> {
        self.dispatched_at
    }
}

/// Radio-level details reported by the medium driver, when known.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LinkInfo {
    pub technology: Option<String>,
    pub band: Option<String>,
    pub frequency_mhz: Option<u32>,
}

#[derive(Debug)]
struct ChannelState {
    cipher: Option<Arc<CipherContext>>,
    paused: bool,
    closed: Option<DisconnectionReason>,
    last_read: Instant,
    last_write: Instant,
    try_count: u32,
}

/// A single full-duplex byte pipe bound to one medium.
///
/// The channel owns its socket halves and is the only thing that touches
/// them. Reads and writes are length-prefixed messages; once encryption is
/// enabled, message bodies are sealed and opened by the installed cipher
/// context. Closing is idempotent and unblocks any reader or writer.
pub struct EndpointChannel {
    name: String,
    service_id: ServiceId,
    medium: Medium,
    max_packet_size: usize,
    link_info: LinkInfo,
    read_half: AsyncMutex<ReadHalf<BoxedSocket>>,
    write_half: AsyncMutex<WriteHalf<BoxedSocket>>,
    state: Mutex<ChannelState>,
    resume_notify: Notify,
    closed_token: CancellationToken,
}

impl PartialEq for EndpointChannel {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl EndpointChannel {
    /// Wraps a freshly established medium socket.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        service_id: ServiceId,
        medium: Medium,
        socket: BoxedSocket,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(socket);
        let now = Instant::now();
        Self {
            name: name.into(),
            service_id,
            medium,
            max_packet_size: medium.max_packet_size(),
            link_info: LinkInfo::default(),
            read_half: AsyncMutex::new(read_half),
            write_half: AsyncMutex::new(write_half),
            state: Mutex::new(ChannelState {
                cipher: None,
                paused: false,
                closed: None,
                last_read: now,
                last_write: now,
                try_count: 0,
            }),
            resume_notify: Notify::new(),
            closed_token: CancellationToken::new(),
        }
    }

    /// Returns the channel's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the service this channel belongs to.
    #[must_use]
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Returns the bound medium.
    #[must_use]
    pub fn medium(&self) -> Medium {
        self.medium
    }

    /// Returns the largest frame this channel accepts in one packet.
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Returns the radio-link details, when the driver reported them.
    #[must_use]
    pub fn link_info(&self) -> &LinkInfo {
        &self.link_info
    }

    /// Reads one message, opening it when encryption is enabled.
    ///
    /// The returned bytes are ciphertext when the remote already encrypts but
    /// this side has not observed the encryption-enable event yet; callers
    /// resolve that race with [`Self::try_decrypt`].
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` when the channel was closed locally, `Io` on
    /// socket failure, and `Decrypt` when the installed cipher rejects the
    /// message.
    pub async fn read(&self) -> Result<Vec<u8>, ChannelError> {
        let mut guard = tokio::select! {
            guard = self.read_half.lock() => guard,
            () = self.closed_token.cancelled() => return Err(ChannelError::Interrupted),
        };
        if self.is_closed() {
            return Err(ChannelError::Interrupted);
        }

        let limit = self.max_packet_size + CIPHER_OVERHEAD;
        let raw = tokio::select! {
            message = read_message(&mut guard, limit) => message?,
            () = self.closed_token.cancelled() => return Err(ChannelError::Interrupted),
        };
        drop(guard);
        self.mark_read();

        let cipher = self.encryption_context();
        match cipher {
            Some(context) => context.decrypt(&raw),
            None => Ok(raw),
        }
    }

    /// Re-attempts decryption of raw bytes read before encryption was
    /// observed locally. Returns `None` while the channel is still
    /// unencrypted.
    #[must_use]
    pub fn try_decrypt(&self, raw: &[u8]) -> Option<Result<Vec<u8>, ChannelError>> {
        self.encryption_context()
            .map(|context| context.decrypt(raw))
    }

    /// Writes one opaque message, sealing it when encryption is enabled.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` when the channel was closed locally and `Io` on
    /// socket failure.
    pub async fn write_message(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        let payload = match self.encryption_context() {
            Some(context) => context.encrypt(bytes),
            None => bytes.to_vec(),
        };

        let mut guard = tokio::select! {
            guard = self.write_half.lock() => guard,
            () = self.closed_token.cancelled() => return Err(ChannelError::Interrupted),
        };
        if self.is_closed() {
            return Err(ChannelError::Interrupted);
        }

        tokio::select! {
            result = write_message(&mut guard, &payload) => result?,
            () = self.closed_token.cancelled() => return Err(ChannelError::Interrupted),
        }
        drop(guard);
        self.mark_write();
        Ok(())
    }

    /// Encodes and writes one frame, honoring the paused flag.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` when the encoded frame exceeds the packet
    /// limit, plus any [`Self::write_message`] error.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), ChannelError> {
        self.wait_until_resumed().await?;
        let encoded = frame.encode();
        if encoded.len() > self.max_packet_size {
            return Err(ChannelError::FrameTooLarge {
                frame_len: encoded.len(),
                max_packet_size: self.max_packet_size,
            });
        }
        trace!(
            channel = %self.name,
            frame_type = %frame.frame_type(),
            len = encoded.len(),
            "writing frame"
        );
        self.write_message(&encoded).await
    }

    /// Installs the cipher context produced by the encryption runner.
    pub fn enable_encryption(&self, context: Arc<CipherContext>) {
        let mut state = self.state.lock().expect("channel state poisoned");
        state.cipher = Some(context);
        debug!(channel = %self.name, "encryption enabled");
    }

    /// Returns the installed cipher context, when encryption is enabled.
    #[must_use]
    pub fn encryption_context(&self) -> Option<Arc<CipherContext>> {
        self.state
            .lock()
            .expect("channel state poisoned")
            .cipher
            .clone()
    }

    /// Returns whether encryption is enabled.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.state
            .lock()
            .expect("channel state poisoned")
            .cipher
            .is_some()
    }

    /// Pauses frame writes; messages already in flight are unaffected.
    pub fn pause(&self) {
        self.state.lock().expect("channel state poisoned").paused = true;
    }

    /// Resumes frame writes and wakes paused writers.
    pub fn resume(&self) {
        self.state.lock().expect("channel state poisoned").paused = false;
        self.resume_notify.notify_waiters();
    }

    /// Returns whether frame writes are currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().expect("channel state poisoned").paused
    }

    /// Closes the channel with `reason`, unblocking readers and writers.
    ///
    /// Only the first close records its reason; later calls return `false`.
    pub async fn close(&self, reason: DisconnectionReason) -> bool {
        {
            let mut state = self.state.lock().expect("channel state poisoned");
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason);
        }
        debug!(channel = %self.name, %reason, "channel closed");
        self.closed_token.cancel();
        self.resume_notify.notify_waiters();
        if let Ok(mut guard) = self.write_half.try_lock() {
            let _ = guard.shutdown().await;
        }
        true
    }

    /// Returns the close reason, once closed.
    #[must_use]
    pub fn closed_reason(&self) -> Option<DisconnectionReason> {
        self.state.lock().expect("channel state poisoned").closed
    }

    /// Returns whether the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .expect("channel state poisoned")
            .closed
            .is_some()
    }

    /// Returns the instant of the last completed read.
    #[must_use]
    pub fn last_read_time(&self) -> Instant {
        self.state.lock().expect("channel state poisoned").last_read
    }

    /// Returns the instant of the last completed write.
    #[must_use]
    pub fn last_write_time(&self) -> Instant {
        self.state.lock().expect("channel state poisoned").last_write
    }

    /// Returns how often this channel has been re-dialed.
    #[must_use]
    pub fn try_count(&self) -> u32 {
        self.state.lock().expect("channel state poisoned").try_count
    }

    /// Bumps the re-dial counter.
    pub fn increment_try_count(&self) {
        self.state.lock().expect("channel state poisoned").try_count += 1;
    }

    async fn wait_until_resumed(&self) -> Result<(), ChannelError> {
        loop {
            if self.is_closed() {
                return Err(ChannelError::Interrupted);
            }
            {
                let state = self.state.lock().expect("channel state poisoned");
                if !state.paused {
                    return Ok(());
                }
            }
            tokio::select! {
                () = self.resume_notify.notified() => {}
                () = self.closed_token.cancelled() => return Err(ChannelError::Interrupted),
            }
        }
    }

    fn mark_read(&self) {
        self.state.lock().expect("channel state poisoned").last_read = Instant::now();
    }

    fn mark_write(&self) {
        self.state.lock().expect("channel state poisoned").last_write = Instant::now();
    }
}

impl std::fmt::Debug for EndpointChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointChannel")
            .field("name", &self.name)
            .field("medium", &self.medium)
            .field("encrypted", &self.is_encrypted())
            .field("closed", &self.closed_reason())
            .finish_non_exhaustive()
    }
}

async fn read_message(
    half: &mut ReadHalf<BoxedSocket>,
    limit: usize,
) -> Result<Vec<u8>, ChannelError> {
    let mut len_bytes = [0u8; 4];
    half.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > limit {
        return Err(ChannelError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("inbound message of {len} bytes exceeds the {limit}-byte limit"),
        )));
    }
    let mut body = vec![0u8; len];
    half.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_message(
    half: &mut WriteHalf<BoxedSocket>,
    payload: &[u8],
) -> Result<(), ChannelError> {
    half.write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    half.write_all(payload).await?;
    half.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn channel_pair(medium: Medium) -> (EndpointChannel, EndpointChannel) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let service = ServiceId::from("svc");
        (
            EndpointChannel::new("near", service.clone(), medium, Box::new(near)),
            EndpointChannel::new("far", service, medium, Box::new(far)),
        )
    }

    #[tokio::test]
    async fn frames_cross_the_pipe() {
        let (near, far) = channel_pair(Medium::Bluetooth);
        near.write_frame(&Frame::KeepAlive).await.expect("write");
        let raw = far.read().await.expect("read");
        let frame = Frame::decode(&raw).expect("decode");
        assert_eq!(Frame::KeepAlive, frame);
    }

    #[tokio::test]
    async fn close_unblocks_a_pending_read() {
        let (near, _far) = channel_pair(Medium::Bluetooth);
        let near = Arc::new(near);
        let reader = Arc::clone(&near);
        let pending = tokio::spawn(async move { reader.read().await });

        tokio::task::yield_now().await;
        assert_eq!(true, near.close(DisconnectionReason::LocalDisconnection).await);

        let result = pending.await.expect("reader task");
        assert_matches!(result, Err(ChannelError::Interrupted));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_keeps_first_reason() {
        let (near, _far) = channel_pair(Medium::Bluetooth);
        assert_eq!(true, near.close(DisconnectionReason::Upgraded).await);
        assert_eq!(false, near.close(DisconnectionReason::IoError).await);
        assert_eq!(
            Some(DisconnectionReason::Upgraded),
            near.closed_reason()
        );
    }

    #[tokio::test]
    async fn paused_channel_defers_frame_writes() {
        let (near, far) = channel_pair(Medium::Bluetooth);
        let near = Arc::new(near);
        near.pause();

        let writer = Arc::clone(&near);
        let pending = tokio::spawn(async move { writer.write_frame(&Frame::KeepAlive).await });
        tokio::task::yield_now().await;
        assert_eq!(false, pending.is_finished());

        near.resume();
        pending.await.expect("writer task").expect("write succeeds");
        let raw = far.read().await.expect("read");
        assert_eq!(Frame::KeepAlive, Frame::decode(&raw).expect("decode"));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_the_wire() {
        let (near, _far) = channel_pair(Medium::Ble);
        let frame = Frame::PayloadTransfer {
            header: crate::frame::PayloadHeader {
                id: crate::ids::PayloadId::new(1),
                kind: crate::payload::PayloadKind::Bytes,
                total_size: 4096,
                file_name: None,
            },
            body: crate::frame::PayloadTransferBody::Data(crate::frame::PayloadChunk {
                offset: 0,
                is_last: false,
                body: vec![0u8; 4096],
            }),
        };
        let result = near.write_frame(&frame).await;
        assert_matches!(result, Err(ChannelError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn encrypted_traffic_roundtrips_and_raced_bytes_recover() {
        let (near, far) = channel_pair(Medium::WifiLan);
        let key_a = [0x33u8; 32];
        let key_b = [0x44u8; 32];
        let near_ctx = Arc::new(crate::encryption::test_support::context(&key_a, &key_b));
        let far_ctx = Arc::new(crate::encryption::test_support::context(&key_b, &key_a));

        // Remote enables encryption first: the local side reads ciphertext.
        near.enable_encryption(near_ctx);
        near.write_frame(&Frame::KeepAlive).await.expect("write");

        let raw = far.read().await.expect("read ciphertext");
        assert_matches!(Frame::decode(&raw), Err(_));

        far.enable_encryption(far_ctx);
        let opened = far
            .try_decrypt(&raw)
            .expect("cipher installed")
            .expect("decrypts");
        assert_eq!(Frame::KeepAlive, Frame::decode(&opened).expect("decode"));
    }
}
