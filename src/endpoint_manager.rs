use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::analytics::{AnalyticsEvent, AnalyticsRecorder, DisconnectionReason};
use crate::channel::{EndpointChannel, PacketMetaData};
use crate::channel_manager::EndpointChannelManager;
use crate::config::{
    CHANNEL_REPLACEMENT_GRACE, ConnectionOptions, DISCONNECT_PROCESSING_TIMEOUT,
    ENCRYPTION_RACE_POLL_INTERVAL, ENCRYPTION_RACE_RETRY_DEADLINE, SAFE_DISCONNECT_ACK_TIMEOUT,
};
use crate::error::ChannelError;
use crate::frame::{
    ControlMessage, Frame, FrameType, PayloadChunk, PayloadHeader, PayloadTransferBody,
};
use crate::ids::EndpointId;
use crate::medium::Medium;

/// Authentication and direction details of a registered endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub endpoint_info: Vec<u8>,
    pub authentication_token: String,
    pub raw_authentication_token: Vec<u8>,
    pub is_incoming: bool,
    pub connection_token: String,
    pub safe_to_disconnect: bool,
}

/// Callbacks a client of the endpoint manager receives.
pub trait ClientProxy: Send + Sync {
    /// A new endpoint finished registration and its workers started.
    fn on_connection_initiated(&self, endpoint_id: &EndpointId, info: &ConnectionInfo);

    /// The endpoint is gone and all frame processors have drained.
    fn on_disconnected(&self, endpoint_id: &EndpointId, reason: DisconnectionReason);
}

/// Barrier counted down by every frame processor handling a disconnection.
#[derive(Debug, Clone)]
pub struct CountDownLatch {
    count: watch::Sender<usize>,
}

impl CountDownLatch {
    /// Creates a latch expecting `count` count-downs.
    #[must_use]
    pub fn new(count: usize) -> Self {
        let (tx, _rx) = watch::channel(count);
        Self { count: tx }
    }

    /// Records one completion.
    pub fn count_down(&self) {
        self.count.send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Waits until every expected completion was recorded.
    pub async fn wait(&self) {
        let mut receiver = self.count.subscribe();
        let _ = receiver.wait_for(|count| *count == 0).await;
    }
}

/// Handles one frame type's traffic and its disconnection bookkeeping.
#[async_trait]
pub trait FrameProcessor: Send + Sync {
    /// Consumes one inbound frame read on the endpoint's reader task.
    async fn on_incoming_frame(
        &self,
        frame: Frame,
        endpoint_id: &EndpointId,
        medium: Medium,
        packet_meta: PacketMetaData,
    );

    /// Reacts to the endpoint disappearing. Implementations must count the
    /// barrier down exactly once, even on early return.
    async fn on_endpoint_disconnect(
        &self,
        endpoint_id: &EndpointId,
        reason: DisconnectionReason,
        barrier: CountDownLatch,
    );
}

struct EndpointState {
    client: Arc<dyn ClientProxy>,
    #[allow(dead_code)]
    info: ConnectionInfo,
    safe_to_disconnect: bool,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    keep_alive: JoinHandle<()>,
}

/// Owns the per-endpoint reader and keep-alive workers, decodes inbound
/// frames, dispatches them to registered processors, and runs the
/// safe-disconnect handshake.
pub struct EndpointManager {
    channel_manager: Arc<EndpointChannelManager>,
    analytics: Arc<dyn AnalyticsRecorder>,
    processors: Mutex<HashMap<FrameType, Arc<dyn FrameProcessor>>>,
    endpoints: AsyncMutex<HashMap<EndpointId, EndpointState>>,
    shutdown: CancellationToken,
}

impl EndpointManager {
    /// Creates a manager over `channel_manager`.
    #[must_use]
    pub fn new(
        channel_manager: Arc<EndpointChannelManager>,
        analytics: Arc<dyn AnalyticsRecorder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel_manager,
            analytics,
            processors: Mutex::new(HashMap::new()),
            endpoints: AsyncMutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns the channel registry this manager reads from.
    #[must_use]
    pub fn channel_manager(&self) -> &Arc<EndpointChannelManager> {
        &self.channel_manager
    }

    /// Registers `processor` for one frame type, replacing any prior entry.
    pub fn register_frame_processor(
        &self,
        frame_type: FrameType,
        processor: Arc<dyn FrameProcessor>,
    ) {
        self.processors
            .lock()
            .expect("processor table poisoned")
            .insert(frame_type, processor);
    }

    /// Removes `processor` if it is still the registered instance.
    pub fn unregister_frame_processor(
        &self,
        frame_type: FrameType,
        processor: &Arc<dyn FrameProcessor>,
    ) {
        let mut processors = self.processors.lock().expect("processor table poisoned");
        if processors
            .get(&frame_type)
            .is_some_and(|current| Arc::ptr_eq(current, processor))
        {
            processors.remove(&frame_type);
        }
    }

    /// Registers an endpoint: installs the channel, starts the reader and
    /// keep-alive workers, and fires `on_connection_initiated`.
    ///
    /// An endpoint re-registered under the same id first has its prior state
    /// torn down.
    #[instrument(skip_all, fields(%endpoint_id, medium = %channel.medium()))]
    pub async fn register_endpoint(
        self: &Arc<Self>,
        client: Arc<dyn ClientProxy>,
        endpoint_id: EndpointId,
        info: ConnectionInfo,
        options: ConnectionOptions,
        channel: Arc<EndpointChannel>,
    ) {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(prior) = endpoints.remove(&endpoint_id) {
            warn!(%endpoint_id, "re-registering endpoint; tearing down prior state");
            remove_endpoint_state(prior).await;
        }

        self.channel_manager
            .register_channel(endpoint_id.clone(), Arc::clone(&channel));
        self.analytics.record(AnalyticsEvent::ConnectionEstablished {
            endpoint_id: endpoint_id.clone(),
            medium: channel.medium(),
        });

        let cancel = self.shutdown.child_token();
        let reader = tokio::spawn(Arc::clone(self).endpoint_reader_loop(
            Arc::clone(&client),
            endpoint_id.clone(),
            cancel.clone(),
        ));
        let keep_alive = tokio::spawn(Arc::clone(self).keep_alive_loop(
            Arc::clone(&client),
            endpoint_id.clone(),
            options.keep_alive_interval,
            options.keep_alive_timeout,
            cancel.clone(),
        ));

        let safe_to_disconnect = info.safe_to_disconnect;
        endpoints.insert(
            endpoint_id.clone(),
            EndpointState {
                client: Arc::clone(&client),
                info: info.clone(),
                safe_to_disconnect,
                cancel,
                reader,
                keep_alive,
            },
        );
        drop(endpoints);
        client.on_connection_initiated(&endpoint_id, &info);
        info!(%endpoint_id, "endpoint registered");
    }

    /// Disconnects an endpoint on the client's request, running the
    /// safe-disconnect handshake when both sides negotiated it.
    pub async fn unregister_endpoint(self: &Arc<Self>, endpoint_id: &EndpointId) {
        let negotiated = {
            let endpoints = self.endpoints.lock().await;
            match endpoints.get(endpoint_id) {
                Some(state) => state.safe_to_disconnect,
                None => return,
            }
        };

        let mut safe = true;
        if negotiated {
            safe = self.request_safe_disconnection(endpoint_id).await;
        }
        self.remove_endpoint(endpoint_id, DisconnectionReason::LocalDisconnection, true, safe)
            .await;
    }

    /// Non-blocking teardown variant callable from I/O worker tasks.
    ///
    /// Never awaits processor callbacks in the caller's task, so a reader
    /// discarding its own endpoint cannot deadlock the disconnect barrier.
    pub fn discard_endpoint(self: &Arc<Self>, endpoint_id: EndpointId, reason: DisconnectionReason) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let safe = reason != DisconnectionReason::IoError;
            manager
                .remove_endpoint(&endpoint_id, reason, true, safe)
                .await;
        });
    }

    /// Writes one payload data chunk to every target endpoint.
    ///
    /// Returns the endpoint ids whose write failed.
    pub async fn send_payload_chunk(
        &self,
        header: PayloadHeader,
        chunk: PayloadChunk,
        endpoint_ids: &[EndpointId],
    ) -> Vec<EndpointId> {
        self.send_transfer_frame(
            endpoint_ids,
            Frame::PayloadTransfer {
                header,
                body: PayloadTransferBody::Data(chunk),
            },
        )
        .await
    }

    /// Writes one payload control message to every target endpoint.
    ///
    /// Returns the endpoint ids whose write failed.
    pub async fn send_control_message(
        &self,
        header: PayloadHeader,
        control: ControlMessage,
        endpoint_ids: &[EndpointId],
    ) -> Vec<EndpointId> {
        self.send_transfer_frame(
            endpoint_ids,
            Frame::PayloadTransfer {
                header,
                body: PayloadTransferBody::Control(control),
            },
        )
        .await
    }

    /// Tears down every endpoint and stops accepting new work.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutdown.cancel();
        let ids: Vec<EndpointId> = self.endpoints.lock().await.keys().cloned().collect();
        for endpoint_id in ids {
            self.remove_endpoint(&endpoint_id, DisconnectionReason::Shutdown, false, true)
                .await;
        }
    }

    async fn send_transfer_frame(
        &self,
        endpoint_ids: &[EndpointId],
        frame: Frame,
    ) -> Vec<EndpointId> {
        const SWAP_RETRIES: usize = 3;

        let mut failed = Vec::new();
        'endpoints: for endpoint_id in endpoint_ids {
            for _attempt in 0..SWAP_RETRIES {
                let Some(channel) = self.channel_manager.channel_for_endpoint(endpoint_id) else {
                    break;
                };
                match channel.write_frame(&frame).await {
                    Ok(()) => continue 'endpoints,
                    Err(ChannelError::Interrupted)
                        if matches!(
                            channel.closed_reason(),
                            Some(DisconnectionReason::Upgraded)
                                | Some(DisconnectionReason::PrevChannelDisconnectionInReconnect)
                        ) =>
                    {
                        // The channel was swapped under us; re-fetch and retry.
                        continue;
                    }
                    Err(error) => {
                        warn!(%endpoint_id, ?error, "transfer frame write failed");
                        break;
                    }
                }
            }
            failed.push(endpoint_id.clone());
        }
        failed
    }

    /// Sends the safe-disconnect request and waits for the remote ack.
    ///
    /// Returns whether the ack arrived before the timer fired.
    async fn request_safe_disconnection(self: &Arc<Self>, endpoint_id: &EndpointId) -> bool {
        let Some(channel) = self.channel_manager.channel_for_endpoint(endpoint_id) else {
            return false;
        };
        // The channel may still be paused by an abandoned upgrade.
        channel.resume();
        let request = Frame::Disconnection {
            request_safe_to_disconnect: true,
            ack_safe_to_disconnect: false,
        };
        if let Err(error) = channel.write_frame(&request).await {
            warn!(%endpoint_id, ?error, "safe-disconnect request write failed");
            return false;
        }

        let acked = self
            .channel_manager
            .wait_safe_to_disconnect(endpoint_id, SAFE_DISCONNECT_ACK_TIMEOUT)
            .await;
        if !acked {
            warn!(%endpoint_id, "safe-disconnect ack timer fired");
        }
        acked
    }

    /// Idempotent endpoint teardown: unregisters the channel, joins workers,
    /// broadcasts the disconnect barrier, then notifies the client.
    #[instrument(skip(self), level = "debug")]
    async fn remove_endpoint(
        self: &Arc<Self>,
        endpoint_id: &EndpointId,
        reason: DisconnectionReason,
        notify: bool,
        safe: bool,
    ) {
        let state = self.endpoints.lock().await.remove(endpoint_id);
        let Some(state) = state else {
            return;
        };

        self.channel_manager
            .unregister_channel_for_endpoint(endpoint_id, reason)
            .await;
        let client = Arc::clone(&state.client);
        remove_endpoint_state(state).await;

        let processors: Vec<Arc<dyn FrameProcessor>> = {
            let table = self.processors.lock().expect("processor table poisoned");
            table.values().map(Arc::clone).collect()
        };
        let barrier = CountDownLatch::new(processors.len());
        for processor in processors {
            let barrier = barrier.clone();
            let endpoint_id = endpoint_id.clone();
            tokio::spawn(async move {
                processor
                    .on_endpoint_disconnect(&endpoint_id, reason, barrier)
                    .await;
            });
        }
        if timeout(DISCONNECT_PROCESSING_TIMEOUT, barrier.wait())
            .await
            .is_err()
        {
            warn!(%endpoint_id, "disconnect processing barrier expired");
        }

        self.analytics.record(AnalyticsEvent::Disconnection {
            endpoint_id: endpoint_id.clone(),
            reason,
            safe,
        });
        if notify {
            client.on_disconnected(endpoint_id, reason);
        }
        info!(%endpoint_id, %reason, safe, "endpoint removed");
    }

    /// Per-endpoint reader: fetch the current channel, read one frame,
    /// dispatch, repeat. Channel swaps by the upgrade manager are picked up
    /// transparently on the next fetch.
    async fn endpoint_reader_loop(
        self: Arc<Self>,
        client: Arc<dyn ClientProxy>,
        endpoint_id: EndpointId,
        cancel: CancellationToken,
    ) {
        let mut last_failed_medium: Option<Medium> = None;
        let mut tolerated_decode_mediums: Vec<Medium> = Vec::new();
        let mut grace_retry_used = false;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            let Some(channel) = self.channel_manager.channel_for_endpoint(&endpoint_id) else {
                return;
            };
            let medium = channel.medium();

            match self
                .read_and_dispatch(&client, &endpoint_id, &channel)
                .await
            {
                Ok(()) => {
                    last_failed_medium = None;
                    grace_retry_used = false;
                }
                Err(error) if error.is_decode_failure() => {
                    // One undecodable frame per medium is tolerable.
                    if tolerated_decode_mediums.contains(&medium) {
                        warn!(%endpoint_id, %medium, "second undecodable frame; dropping endpoint");
                        break;
                    }
                    debug!(%endpoint_id, %medium, ?error, "tolerating undecodable frame");
                    tolerated_decode_mediums.push(medium);
                    last_failed_medium = Some(medium);
                }
                Err(ChannelError::Interrupted) => {
                    match channel.closed_reason() {
                        Some(DisconnectionReason::Upgraded)
                        | Some(DisconnectionReason::PrevChannelDisconnectionInReconnect) => {
                            // Replacement published; re-fetch and continue.
                            continue;
                        }
                        _ => return,
                    }
                }
                Err(error) => {
                    if last_failed_medium == Some(medium) {
                        // A replacement may be about to publish; give the new
                        // channel one extra read before declaring the endpoint
                        // lost.
                        if !grace_retry_used
                            && self
                                .channel_manager
                                .replaced_within(&endpoint_id, CHANNEL_REPLACEMENT_GRACE)
                        {
                            grace_retry_used = true;
                            continue;
                        }
                        warn!(%endpoint_id, %medium, ?error, "repeated read failure on medium");
                        break;
                    }
                    debug!(%endpoint_id, %medium, ?error, "read failed; re-fetching channel");
                    last_failed_medium = Some(medium);
                }
            }
        }

        self.discard_endpoint(endpoint_id, DisconnectionReason::IoError);
    }

    async fn read_and_dispatch(
        self: &Arc<Self>,
        client: &Arc<dyn ClientProxy>,
        endpoint_id: &EndpointId,
        channel: &Arc<EndpointChannel>,
    ) -> Result<(), ChannelError> {
        let encrypted_at_start = channel.is_encrypted();
        let raw = channel.read().await?;
        let mut packet_meta = PacketMetaData::received();
        if encrypted_at_start {
            packet_meta.mark_decrypted();
        }

        let frame = match Frame::decode(&raw) {
            Ok(frame) => frame,
            Err(decode_error) if !encrypted_at_start => {
                // The remote may have encrypted this frame before we observed
                // the encryption-enable event; retry the decrypt until the
                // cipher shows up or the deadline passes.
                let frame = self.retry_decrypt(channel, &raw).await.ok_or(decode_error)?;
                packet_meta.mark_decrypted();
                frame
            }
            Err(decode_error) => return Err(decode_error.into()),
        };
        packet_meta.mark_dispatched();

        let processor = {
            let table = self.processors.lock().expect("processor table poisoned");
            table.get(&frame.frame_type()).map(Arc::clone)
        };
        match processor {
            Some(processor) => {
                processor
                    .on_incoming_frame(frame, endpoint_id, channel.medium(), packet_meta)
                    .await;
            }
            None => match frame {
                Frame::Disconnection {
                    request_safe_to_disconnect,
                    ack_safe_to_disconnect,
                } => {
                    self.handle_disconnection_frame(
                        client,
                        endpoint_id,
                        channel,
                        request_safe_to_disconnect,
                        ack_safe_to_disconnect,
                    )
                    .await;
                }
                Frame::KeepAlive => {}
                other => {
                    debug!(
                        %endpoint_id,
                        frame_type = %other.frame_type(),
                        "no processor registered for frame"
                    );
                }
            },
        }
        Ok(())
    }

    async fn retry_decrypt(
        self: &Arc<Self>,
        channel: &Arc<EndpointChannel>,
        raw: &[u8],
    ) -> Option<Frame> {
        let deadline = Instant::now() + ENCRYPTION_RACE_RETRY_DEADLINE;
        loop {
            if let Some(decrypted) = channel.try_decrypt(raw) {
                return decrypted.ok().and_then(|bytes| Frame::decode(&bytes).ok());
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(ENCRYPTION_RACE_POLL_INTERVAL).await;
        }
    }

    /// Remote side of the safe-disconnect handshake.
    async fn handle_disconnection_frame(
        self: &Arc<Self>,
        _client: &Arc<dyn ClientProxy>,
        endpoint_id: &EndpointId,
        channel: &Arc<EndpointChannel>,
        request_safe_to_disconnect: bool,
        ack_safe_to_disconnect: bool,
    ) {
        if ack_safe_to_disconnect {
            // Our own request was acknowledged; wake the waiting teardown.
            self.channel_manager.mark_safe_to_disconnect(endpoint_id);
            return;
        }

        if request_safe_to_disconnect {
            self.channel_manager.mark_safe_to_disconnect(endpoint_id);
            channel.resume();
            let ack = Frame::Disconnection {
                request_safe_to_disconnect: true,
                ack_safe_to_disconnect: true,
            };
            if let Err(error) = channel.write_frame(&ack).await {
                debug!(%endpoint_id, ?error, "safe-disconnect ack write failed");
            }
        }

        let manager = Arc::clone(self);
        let endpoint_id = endpoint_id.clone();
        tokio::spawn(async move {
            manager
                .remove_endpoint(
                    &endpoint_id,
                    DisconnectionReason::RemoteDisconnection,
                    true,
                    true,
                )
                .await;
        });
    }

    /// Writes a keep-alive whenever the channel sat idle for the interval and
    /// drops the endpoint once nothing was read for the timeout.
    async fn keep_alive_loop(
        self: Arc<Self>,
        _client: Arc<dyn ClientProxy>,
        endpoint_id: EndpointId,
        interval: Duration,
        read_timeout: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            let Some(channel) = self.channel_manager.channel_for_endpoint(&endpoint_id) else {
                return;
            };

            let now = Instant::now();
            let idle_read = now.saturating_duration_since(channel.last_read_time());
            if idle_read >= read_timeout {
                self.analytics.record(AnalyticsEvent::KeepAliveTimeout {
                    endpoint_id: endpoint_id.clone(),
                });
                warn!(%endpoint_id, ?idle_read, "keep-alive read timeout");
                break;
            }

            let idle_write = now.saturating_duration_since(channel.last_write_time());
            if idle_write >= interval
                && let Err(error) = channel.write_frame(&Frame::KeepAlive).await
            {
                debug!(%endpoint_id, ?error, "keep-alive write failed");
            }

            let now = Instant::now();
            let until_timeout = read_timeout
                .saturating_sub(now.saturating_duration_since(channel.last_read_time()));
            let until_write = interval
                .saturating_sub(now.saturating_duration_since(channel.last_write_time()));
            tokio::select! {
                () = sleep(until_timeout.min(until_write).max(Duration::from_millis(1))) => {}
                () = cancel.cancelled() => return,
            }
        }

        self.discard_endpoint(endpoint_id, DisconnectionReason::IoError);
    }
}

/// Stops both worker tasks and waits for them to settle.
async fn remove_endpoint_state(state: EndpointState) {
    state.cancel.cancel();
    state.reader.abort();
    state.keep_alive.abort();
    let _ = state.reader.await;
    let _ = state.keep_alive.await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::analytics::InMemoryAnalyticsRecorder;
    use crate::ids::ServiceId;

    #[derive(Debug, Default)]
    struct RecordingClient {
        initiated: Mutex<Vec<EndpointId>>,
        disconnected: Mutex<Vec<EndpointId>>,
    }

    impl ClientProxy for RecordingClient {
        fn on_connection_initiated(&self, endpoint_id: &EndpointId, _info: &ConnectionInfo) {
            self.initiated
                .lock()
                .expect("client state poisoned")
                .push(endpoint_id.clone());
        }

        fn on_disconnected(&self, endpoint_id: &EndpointId, _reason: DisconnectionReason) {
            self.disconnected
                .lock()
                .expect("client state poisoned")
                .push(endpoint_id.clone());
        }
    }

    #[derive(Default)]
    struct RecordingProcessor {
        frames: Mutex<Vec<Frame>>,
        disconnects: Mutex<Vec<(EndpointId, DisconnectionReason)>>,
    }

    #[async_trait]
    impl FrameProcessor for RecordingProcessor {
        async fn on_incoming_frame(
            &self,
            frame: Frame,
            _endpoint_id: &EndpointId,
            _medium: Medium,
            _packet_meta: PacketMetaData,
        ) {
            self.frames.lock().expect("frames poisoned").push(frame);
        }

        async fn on_endpoint_disconnect(
            &self,
            endpoint_id: &EndpointId,
            reason: DisconnectionReason,
            barrier: CountDownLatch,
        ) {
            self.disconnects
                .lock()
                .expect("disconnects poisoned")
                .push((endpoint_id.clone(), reason));
            barrier.count_down();
        }
    }

    fn connection_info(safe_to_disconnect: bool) -> ConnectionInfo {
        ConnectionInfo {
            endpoint_info: vec![0x0d, 0x07],
            authentication_token: "74657374".into(),
            raw_authentication_token: vec![0x74, 0x65, 0x73, 0x74],
            is_incoming: false,
            connection_token: "token".into(),
            safe_to_disconnect,
        }
    }

    fn channel_pair() -> (Arc<EndpointChannel>, Arc<EndpointChannel>) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let service = ServiceId::from("svc");
        (
            Arc::new(EndpointChannel::new(
                "near",
                service.clone(),
                Medium::Bluetooth,
                Box::new(near),
            )),
            Arc::new(EndpointChannel::new(
                "far",
                service,
                Medium::Bluetooth,
                Box::new(far),
            )),
        )
    }

    fn manager() -> Arc<EndpointManager> {
        EndpointManager::new(
            Arc::new(EndpointChannelManager::new()),
            Arc::new(InMemoryAnalyticsRecorder::new()),
        )
    }

    fn slow_keep_alive_options() -> ConnectionOptions {
        ConnectionOptions::builder()
            .keep_alive_interval(Duration::from_secs(600))
            .keep_alive_timeout(Duration::from_secs(3_600))
            .build()
    }

    #[tokio::test]
    async fn latch_releases_after_all_count_downs() {
        let latch = CountDownLatch::new(2);
        latch.count_down();
        let waiter = latch.clone();
        let wait = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        assert_eq!(false, wait.is_finished());
        latch.count_down();
        wait.await.expect("latch wait");
    }

    #[tokio::test]
    async fn unregister_processor_compares_instance_identity() {
        let manager = manager();
        let registered: Arc<dyn FrameProcessor> = Arc::new(RecordingProcessor::default());
        let imposter: Arc<dyn FrameProcessor> = Arc::new(RecordingProcessor::default());
        manager.register_frame_processor(FrameType::PayloadTransfer, Arc::clone(&registered));

        manager.unregister_frame_processor(FrameType::PayloadTransfer, &imposter);
        let still_there = manager
            .processors
            .lock()
            .expect("processor table poisoned")
            .contains_key(&FrameType::PayloadTransfer);
        assert_eq!(true, still_there);

        manager.unregister_frame_processor(FrameType::PayloadTransfer, &registered);
        let gone = manager
            .processors
            .lock()
            .expect("processor table poisoned")
            .contains_key(&FrameType::PayloadTransfer);
        assert_eq!(false, gone);
    }

    #[tokio::test]
    async fn reader_dispatches_frames_to_registered_processor() {
        let manager = manager();
        let processor = Arc::new(RecordingProcessor::default());
        manager.register_frame_processor(
            FrameType::PayloadTransfer,
            Arc::clone(&processor) as Arc<dyn FrameProcessor>,
        );

        let client = Arc::new(RecordingClient::default());
        let (near, far) = channel_pair();
        manager
            .register_endpoint(
                Arc::clone(&client) as Arc<dyn ClientProxy>,
                EndpointId::from("E1"),
                connection_info(false),
                slow_keep_alive_options(),
                near,
            )
            .await;
        assert_eq!(
            vec![EndpointId::from("E1")],
            client.initiated.lock().expect("client state").clone()
        );

        let frame = Frame::PayloadTransfer {
            header: PayloadHeader {
                id: crate::ids::PayloadId::new(7),
                kind: crate::payload::PayloadKind::Bytes,
                total_size: 3,
                file_name: None,
            },
            body: PayloadTransferBody::Data(PayloadChunk {
                offset: 0,
                is_last: true,
                body: vec![1, 2, 3],
            }),
        };
        far.write_frame(&frame).await.expect("remote write");

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !processor.frames.lock().expect("frames").is_empty() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("frame should be dispatched");
        assert_eq!(
            vec![frame],
            processor.frames.lock().expect("frames").clone()
        );
    }

    #[tokio::test]
    async fn remote_disconnection_request_is_acked_and_torn_down() {
        let manager = manager();
        let client = Arc::new(RecordingClient::default());
        let (near, far) = channel_pair();
        manager
            .register_endpoint(
                Arc::clone(&client) as Arc<dyn ClientProxy>,
                EndpointId::from("E1"),
                connection_info(true),
                slow_keep_alive_options(),
                near,
            )
            .await;

        far.write_frame(&Frame::Disconnection {
            request_safe_to_disconnect: true,
            ack_safe_to_disconnect: false,
        })
        .await
        .expect("remote write");

        let raw = tokio::time::timeout(Duration::from_secs(1), far.read())
            .await
            .expect("ack within deadline")
            .expect("ack read");
        assert_eq!(
            Frame::Disconnection {
                request_safe_to_disconnect: true,
                ack_safe_to_disconnect: true,
            },
            Frame::decode(&raw).expect("ack decodes")
        );

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !client.disconnected.lock().expect("client state").is_empty() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("disconnect callback");
        assert_eq!(
            vec![EndpointId::from("E1")],
            client.disconnected.lock().expect("client state").clone()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn two_successive_invalid_frames_terminate_the_reader() {
        let manager = manager();
        let client = Arc::new(RecordingClient::default());
        let (near, far) = channel_pair();
        manager
            .register_endpoint(
                Arc::clone(&client) as Arc<dyn ClientProxy>,
                EndpointId::from("E1"),
                connection_info(false),
                slow_keep_alive_options(),
                near,
            )
            .await;

        // Neither blob decodes; the first is tolerated, the second is not.
        far.write_message(b"not a frame").await.expect("first write");
        far.write_message(b"still not a frame")
            .await
            .expect("second write");

        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if !client.disconnected.lock().expect("client state").is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("endpoint should be discarded after the second bad frame");
        assert_eq!(
            vec![EndpointId::from("E1")],
            client.disconnected.lock().expect("client state").clone()
        );
    }

    #[tokio::test]
    async fn unregister_waits_for_ack_and_reports_safe() {
        let analytics = Arc::new(InMemoryAnalyticsRecorder::new());
        let manager = EndpointManager::new(
            Arc::new(EndpointChannelManager::new()),
            Arc::clone(&analytics) as Arc<dyn AnalyticsRecorder>,
        );
        let client = Arc::new(RecordingClient::default());
        let (near, far) = channel_pair();
        manager
            .register_endpoint(
                Arc::clone(&client) as Arc<dyn ClientProxy>,
                EndpointId::from("E1"),
                connection_info(true),
                slow_keep_alive_options(),
                near,
            )
            .await;

        // The remote peer answers the disconnect request with an ack.
        let remote = tokio::spawn(async move {
            let raw = far.read().await.expect("request read");
            let request = Frame::decode(&raw).expect("request decodes");
            assert_eq!(
                Frame::Disconnection {
                    request_safe_to_disconnect: true,
                    ack_safe_to_disconnect: false,
                },
                request
            );
            far.write_frame(&Frame::Disconnection {
                request_safe_to_disconnect: true,
                ack_safe_to_disconnect: true,
            })
            .await
            .expect("ack write");
        });

        manager.unregister_endpoint(&EndpointId::from("E1")).await;
        remote.await.expect("remote task");

        assert_eq!(1, analytics.disconnection_count(true));
        assert_eq!(0, analytics.disconnection_count(false));
    }
}
