use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::analytics::DisconnectionReason;
use crate::channel::PacketMetaData;
use crate::config::MIN_PROGRESS_UPDATE_INTERVAL;
use crate::endpoint_manager::{CountDownLatch, EndpointManager, FrameProcessor};
use crate::frame::{
    ControlMessage, Frame, PayloadChunk, PayloadHeader, PayloadTransferBody,
};
use crate::ids::{EndpointId, PayloadId};
use crate::medium::Medium;
use crate::payload::{Payload, PayloadKind, PayloadStatus, PayloadTransferUpdate, StreamPayload};

/// Envelope, header, and cipher margin reserved inside one packet.
const CHUNK_OVERHEAD: usize = 256;

/// Buffer depth handed to stream-payload consumers.
const STREAM_CHUNK_BUFFER: usize = 32;

/// Receives payload lifecycle events from the payload manager.
pub trait PayloadEventSink: Send + Sync {
    /// An incoming payload's first chunk arrived. For file payloads,
    /// `file_path` names where the bytes are being materialized.
    fn on_incoming_payload_started(
        &self,
        endpoint_id: &EndpointId,
        payload_id: PayloadId,
        kind: PayloadKind,
        total_size: i64,
        file_path: Option<PathBuf>,
    );

    /// A reassembled payload is ready for the client: completed bytes and
    /// file payloads, or the readable half of a started stream payload.
    fn on_incoming_payload(&self, endpoint_id: &EndpointId, payload: Payload);

    /// One progress or terminal update for an incoming or outgoing payload.
    fn on_payload_transfer_update(&self, endpoint_id: &EndpointId, update: PayloadTransferUpdate);
}

enum Assembler {
    Bytes(Vec<u8>),
    // The file handle is taken out while a write awaits, so the registry
    // lock is never held across file I/O.
    File {
        file: Option<fs::File>,
        path: PathBuf,
    },
    Stream(mpsc::Sender<Vec<u8>>),
}

struct IncomingState {
    endpoint_id: EndpointId,
    header: PayloadHeader,
    assembler: Assembler,
    received: i64,
    last_progress_at: Option<Instant>,
}

struct OutgoingState {
    endpoint_ids: Vec<EndpointId>,
    cancel: CancellationToken,
}

struct OutgoingTask {
    payload: Payload,
    endpoint_ids: Vec<EndpointId>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    incoming: HashMap<PayloadId, IncomingState>,
    outgoing: HashMap<PayloadId, OutgoingState>,
}

/// Splits outgoing payloads into channel-sized data chunks and reassembles
/// incoming ones, reporting throttled progress along the way.
///
/// One writer worker runs per payload kind, so a large file transfer never
/// starves control-sized byte payloads.
pub struct PayloadManager {
    endpoint_manager: Arc<EndpointManager>,
    sink: Arc<dyn PayloadEventSink>,
    registry: Mutex<Registry>,
    save_directory: Mutex<PathBuf>,
    workers: HashMap<PayloadKind, mpsc::UnboundedSender<OutgoingTask>>,
}

impl PayloadManager {
    /// Creates the manager and starts its three writer workers.
    #[must_use]
    pub fn new(
        endpoint_manager: Arc<EndpointManager>,
        sink: Arc<dyn PayloadEventSink>,
    ) -> Arc<Self> {
        let mut workers = HashMap::new();
        let mut receivers = Vec::new();
        for kind in [PayloadKind::Bytes, PayloadKind::File, PayloadKind::Stream] {
            let (tx, rx) = mpsc::unbounded_channel();
            workers.insert(kind, tx);
            receivers.push((kind, rx));
        }

        let manager = Arc::new(Self {
            endpoint_manager,
            sink,
            registry: Mutex::new(Registry::default()),
            save_directory: Mutex::new(std::env::temp_dir()),
            workers,
        });

        for (kind, mut rx) in receivers {
            // Weak so the workers drain and stop once the manager is gone.
            let worker = Arc::downgrade(&manager);
            tokio::spawn(async move {
                while let Some(task) = rx.recv().await {
                    let Some(manager) = worker.upgrade() else { break };
                    manager.run_outgoing(task).await;
                }
                debug!(%kind, "payload writer worker stopped");
            });
        }
        manager
    }

    /// Points incoming file materialization at `path`.
    pub fn set_save_directory(&self, path: PathBuf) {
        *self.save_directory.lock().expect("save path poisoned") = path;
    }

    /// Queues `payload` for delivery to `endpoint_ids` on the kind-specific
    /// writer worker.
    pub fn send_payload(&self, payload: Payload, endpoint_ids: Vec<EndpointId>) {
        let cancel = CancellationToken::new();
        let id = payload.id();
        {
            let mut registry = self.registry.lock().expect("payload registry poisoned");
            registry.outgoing.insert(
                id,
                OutgoingState {
                    endpoint_ids: endpoint_ids.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        let sender = self
            .workers
            .get(&payload.kind())
            .expect("all payload kinds have a worker");
        if sender
            .send(OutgoingTask {
                payload,
                endpoint_ids,
                cancel,
            })
            .is_err()
        {
            warn!(payload_id = %id, "payload worker is gone; dropping send");
        }
    }

    /// Cancels an in-flight payload in either direction.
    ///
    /// Idempotent: unknown or already-terminal ids are ignored.
    pub async fn cancel_payload(&self, payload_id: PayloadId) {
        let outgoing_cancel = {
            let registry = self.registry.lock().expect("payload registry poisoned");
            registry
                .outgoing
                .get(&payload_id)
                .map(|state| state.cancel.clone())
        };
        if let Some(cancel) = outgoing_cancel {
            cancel.cancel();
            return;
        }

        let incoming = {
            let mut registry = self.registry.lock().expect("payload registry poisoned");
            registry.incoming.remove(&payload_id)
        };
        if let Some(state) = incoming {
            info!(%payload_id, "canceling incoming payload");
            self.send_control(
                &state.header,
                ControlMessage::PayloadCanceled {
                    offset: state.received,
                },
                std::slice::from_ref(&state.endpoint_id),
            )
            .await;
            discard_assembler(state.assembler).await;
            self.sink.on_payload_transfer_update(
                &state.endpoint_id,
                PayloadTransferUpdate::terminal(
                    payload_id,
                    PayloadStatus::Canceled,
                    state.header.total_size,
                    state.received,
                ),
            );
        }
    }

    async fn send_control(
        &self,
        header: &PayloadHeader,
        control: ControlMessage,
        endpoint_ids: &[EndpointId],
    ) {
        let failed = self
            .endpoint_manager
            .send_control_message(header.clone(), control, endpoint_ids)
            .await;
        if !failed.is_empty() {
            debug!(?failed, "control message delivery failed");
        }
    }

    #[instrument(skip_all, fields(payload_id = %task.payload.id(), kind = %task.payload.kind()))]
    async fn run_outgoing(self: &Arc<Self>, task: OutgoingTask) {
        let OutgoingTask {
            payload,
            mut endpoint_ids,
            cancel,
        } = task;
        let id = payload.id();
        let header = PayloadHeader {
            id,
            kind: payload.kind(),
            total_size: payload.total_size(),
            file_name: payload.file_name(),
        };

        let mut source = match OutgoingSource::open(payload).await {
            Ok(source) => source,
            Err(error) => {
                warn!(?error, "payload source failed to open");
                self.finish_outgoing(id, &header, &endpoint_ids, PayloadStatus::Failure, 0)
                    .await;
                return;
            }
        };

        let mut offset: i64 = 0;
        let mut last_progress_at: Option<Instant> = None;
        loop {
            if cancel.is_cancelled() {
                self.send_control(
                    &header,
                    ControlMessage::PayloadCanceled { offset },
                    &endpoint_ids,
                )
                .await;
                self.finish_outgoing(id, &header, &endpoint_ids, PayloadStatus::Canceled, offset)
                    .await;
                return;
            }

            let chunk_limit = self.chunk_limit(&endpoint_ids);
            let (body, is_last) = match source.next_chunk(chunk_limit).await {
                Ok(chunk) => chunk,
                Err(error) => {
                    warn!(?error, "payload source read failed");
                    self.send_control(
                        &header,
                        ControlMessage::PayloadError { offset },
                        &endpoint_ids,
                    )
                    .await;
                    self.finish_outgoing(id, &header, &endpoint_ids, PayloadStatus::Failure, offset)
                        .await;
                    return;
                }
            };

            let chunk_len = body.len() as i64;
            let chunk = PayloadChunk {
                offset,
                is_last,
                body,
            };
            let failed = self
                .endpoint_manager
                .send_payload_chunk(header.clone(), chunk, &endpoint_ids)
                .await;
            if !failed.is_empty() {
                for endpoint_id in &failed {
                    self.sink.on_payload_transfer_update(
                        endpoint_id,
                        PayloadTransferUpdate::terminal(
                            id,
                            PayloadStatus::Failure,
                            header.total_size,
                            offset,
                        ),
                    );
                }
                endpoint_ids.retain(|endpoint_id| !failed.contains(endpoint_id));
                if endpoint_ids.is_empty() {
                    self.clear_outgoing(id);
                    return;
                }
            }

            offset += chunk_len;
            if is_last {
                self.finish_outgoing(id, &header, &endpoint_ids, PayloadStatus::Success, offset)
                    .await;
                return;
            }

            let now = Instant::now();
            let due = last_progress_at
                .is_none_or(|at| now.saturating_duration_since(at) >= MIN_PROGRESS_UPDATE_INTERVAL);
            if due {
                last_progress_at = Some(now);
                for endpoint_id in &endpoint_ids {
                    self.sink.on_payload_transfer_update(
                        endpoint_id,
                        PayloadTransferUpdate::in_progress(id, header.total_size, offset),
                    );
                }
            }
        }
    }

    async fn finish_outgoing(
        &self,
        id: PayloadId,
        header: &PayloadHeader,
        endpoint_ids: &[EndpointId],
        status: PayloadStatus,
        bytes_transferred: i64,
    ) {
        self.clear_outgoing(id);
        for endpoint_id in endpoint_ids {
            self.sink.on_payload_transfer_update(
                endpoint_id,
                PayloadTransferUpdate::terminal(id, status, header.total_size, bytes_transferred),
            );
        }
    }

    fn clear_outgoing(&self, id: PayloadId) {
        self.registry
            .lock()
            .expect("payload registry poisoned")
            .outgoing
            .remove(&id);
    }

    fn chunk_limit(&self, endpoint_ids: &[EndpointId]) -> usize {
        endpoint_ids
            .iter()
            .filter_map(|endpoint_id| {
                self.endpoint_manager
                    .channel_manager()
                    .channel_for_endpoint(endpoint_id)
                    .map(|channel| channel.max_packet_size())
            })
            .min()
            .unwrap_or(Medium::Bluetooth.max_packet_size())
            .saturating_sub(CHUNK_OVERHEAD)
            .max(1)
    }

    async fn handle_incoming_chunk(
        &self,
        endpoint_id: &EndpointId,
        header: PayloadHeader,
        chunk: PayloadChunk,
    ) {
        let id = header.id;
        let known = {
            let registry = self.registry.lock().expect("payload registry poisoned");
            if registry.outgoing.contains_key(&id) {
                warn!(payload_id = %id, "data chunk for an outgoing payload id; dropping");
                return;
            }
            registry.incoming.contains_key(&id)
        };

        if !known && !self.start_incoming(endpoint_id, &header).await {
            return;
        }

        // Feed the assembler outside the registry lock for file and stream
        // sinks; the chunk itself was already moved out.
        let write_result = self.append_chunk(id, &chunk.body).await;
        if let Err(error) = write_result {
            warn!(payload_id = %id, ?error, "assembler write failed");
            let removed = self
                .registry
                .lock()
                .expect("payload registry poisoned")
                .incoming
                .remove(&id);
            if let Some(state) = removed {
                self.send_control(
                    &state.header,
                    ControlMessage::PayloadError {
                        offset: state.received,
                    },
                    std::slice::from_ref(endpoint_id),
                )
                .await;
                discard_assembler(state.assembler).await;
                self.sink.on_payload_transfer_update(
                    endpoint_id,
                    PayloadTransferUpdate::terminal(
                        id,
                        PayloadStatus::Failure,
                        state.header.total_size,
                        state.received,
                    ),
                );
            }
            return;
        }

        if chunk.is_last {
            self.complete_incoming(endpoint_id, id).await;
            return;
        }

        // Throttled progress.
        let update = {
            let mut registry = self.registry.lock().expect("payload registry poisoned");
            let Some(state) = registry.incoming.get_mut(&id) else {
                return;
            };
            let now = Instant::now();
            let due = state
                .last_progress_at
                .is_none_or(|at| now.saturating_duration_since(at) >= MIN_PROGRESS_UPDATE_INTERVAL);
            if due {
                state.last_progress_at = Some(now);
                Some(PayloadTransferUpdate::in_progress(
                    id,
                    state.header.total_size,
                    state.received,
                ))
            } else {
                None
            }
        };
        if let Some(update) = update {
            self.sink.on_payload_transfer_update(endpoint_id, update);
        }
    }

    async fn start_incoming(&self, endpoint_id: &EndpointId, header: &PayloadHeader) -> bool {
        let (assembler, file_path, started_payload) = match header.kind {
            PayloadKind::Bytes => (Assembler::Bytes(Vec::new()), None, None),
            PayloadKind::File => {
                let path = self.incoming_file_path(header);
                let file = match fs::File::create(&path).await {
                    Ok(file) => file,
                    Err(error) => {
                        warn!(?path, ?error, "failed to create incoming file");
                        return false;
                    }
                };
                (
                    Assembler::File {
                        file: Some(file),
                        path: path.clone(),
                    },
                    Some(path),
                    None,
                )
            }
            PayloadKind::Stream => {
                let (tx, rx) = mpsc::channel(STREAM_CHUNK_BUFFER);
                (
                    Assembler::Stream(tx),
                    None,
                    Some(Payload::Stream {
                        id: header.id,
                        stream: StreamPayload::new(rx),
                    }),
                )
            }
        };

        {
            let mut registry = self.registry.lock().expect("payload registry poisoned");
            registry.incoming.insert(
                header.id,
                IncomingState {
                    endpoint_id: endpoint_id.clone(),
                    header: header.clone(),
                    assembler,
                    received: 0,
                    last_progress_at: None,
                },
            );
        }
        self.sink.on_incoming_payload_started(
            endpoint_id,
            header.id,
            header.kind,
            header.total_size,
            file_path,
        );
        if let Some(payload) = started_payload {
            self.sink.on_incoming_payload(endpoint_id, payload);
        }
        true
    }

    async fn append_chunk(&self, id: PayloadId, body: &[u8]) -> std::io::Result<()> {
        // Bytes assemble under the lock; file and stream sinks are taken out
        // and restored so the await points run unlocked.
        enum Borrowed {
            File(fs::File),
            Stream(mpsc::Sender<Vec<u8>>),
        }

        let borrowed = {
            let mut registry = self.registry.lock().expect("payload registry poisoned");
            let Some(state) = registry.incoming.get_mut(&id) else {
                return Ok(());
            };
            state.received += body.len() as i64;
            match &mut state.assembler {
                Assembler::Bytes(buffer) => {
                    buffer.extend_from_slice(body);
                    return Ok(());
                }
                Assembler::File { file, .. } => match file.take() {
                    Some(taken) => Borrowed::File(taken),
                    None => return Ok(()),
                },
                Assembler::Stream(tx) => Borrowed::Stream(tx.clone()),
            }
        };

        match borrowed {
            Borrowed::File(mut file) => {
                let result = file.write_all(body).await;
                let mut registry = self.registry.lock().expect("payload registry poisoned");
                if let Some(state) = registry.incoming.get_mut(&id)
                    && let Assembler::File { file: slot, .. } = &mut state.assembler
                {
                    *slot = Some(file);
                }
                result
            }
            Borrowed::Stream(tx) => {
                if tx.send(body.to_vec()).await.is_err() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "stream payload consumer is gone",
                    ));
                }
                Ok(())
            }
        }
    }

    async fn complete_incoming(&self, endpoint_id: &EndpointId, id: PayloadId) {
        let state = {
            let mut registry = self.registry.lock().expect("payload registry poisoned");
            registry.incoming.remove(&id)
        };
        let Some(state) = state else {
            return;
        };

        let completed = match state.assembler {
            Assembler::Bytes(buffer) => Some(Payload::Bytes { id, bytes: buffer }),
            Assembler::File { file, path } => {
                if let Some(mut file) = file {
                    let _ = file.flush().await;
                }
                Some(Payload::File {
                    id,
                    path,
                    size: state.received,
                })
            }
            // The stream half was handed over when the payload started;
            // dropping the sender signals end-of-stream.
            Assembler::Stream(_tx) => None,
        };
        if let Some(payload) = completed {
            self.sink.on_incoming_payload(endpoint_id, payload);
        }
        self.sink.on_payload_transfer_update(
            endpoint_id,
            PayloadTransferUpdate::terminal(
                id,
                PayloadStatus::Success,
                state.header.total_size,
                state.received,
            ),
        );
        info!(payload_id = %id, bytes = state.received, "incoming payload complete");
    }

    fn incoming_file_path(&self, header: &PayloadHeader) -> PathBuf {
        let directory = self.save_directory.lock().expect("save path poisoned");
        let name = match &header.file_name {
            Some(name) => format!("{}_{name}", header.id),
            None => format!("{}.payload", header.id),
        };
        directory.join(name)
    }

    async fn handle_incoming_control(
        &self,
        endpoint_id: &EndpointId,
        header: PayloadHeader,
        control: ControlMessage,
    ) {
        let id = header.id;
        // Remote canceled or failed one of our outgoing payloads.
        let outgoing_cancel = {
            let registry = self.registry.lock().expect("payload registry poisoned");
            registry
                .outgoing
                .get(&id)
                .map(|state| state.cancel.clone())
        };
        if let Some(cancel) = outgoing_cancel {
            debug!(payload_id = %id, ?control, "remote control for outgoing payload");
            cancel.cancel();
            return;
        }

        // Remote canceled or failed a payload we are receiving.
        let state = {
            let mut registry = self.registry.lock().expect("payload registry poisoned");
            registry.incoming.remove(&id)
        };
        let Some(state) = state else {
            debug!(payload_id = %id, "control for unknown payload");
            return;
        };
        let status = match control {
            ControlMessage::PayloadCanceled { .. } => PayloadStatus::Canceled,
            ControlMessage::PayloadError { .. } => PayloadStatus::Failure,
        };
        discard_assembler(state.assembler).await;
        self.sink.on_payload_transfer_update(
            endpoint_id,
            PayloadTransferUpdate::terminal(id, status, state.header.total_size, state.received),
        );
    }
}

async fn discard_assembler(assembler: Assembler) {
    if let Assembler::File { file, path } = assembler {
        drop(file);
        if let Err(error) = fs::remove_file(&path).await {
            debug!(?path, ?error, "failed to remove a partial incoming file");
        }
    }
}

#[async_trait]
impl FrameProcessor for PayloadManager {
    async fn on_incoming_frame(
        &self,
        frame: Frame,
        endpoint_id: &EndpointId,
        _medium: Medium,
        _packet_meta: PacketMetaData,
    ) {
        let Frame::PayloadTransfer { header, body } = frame else {
            return;
        };
        match body {
            PayloadTransferBody::Data(chunk) => {
                self.handle_incoming_chunk(endpoint_id, header, chunk).await;
            }
            PayloadTransferBody::Control(control) => {
                self.handle_incoming_control(endpoint_id, header, control)
                    .await;
            }
        }
    }

    async fn on_endpoint_disconnect(
        &self,
        endpoint_id: &EndpointId,
        _reason: DisconnectionReason,
        barrier: CountDownLatch,
    ) {
        // Fail everything still in flight with this endpoint.
        let (incoming, outgoing): (Vec<IncomingState>, Vec<CancellationToken>) = {
            let mut registry = self.registry.lock().expect("payload registry poisoned");
            let incoming_ids: Vec<PayloadId> = registry
                .incoming
                .iter()
                .filter(|(_id, state)| state.endpoint_id == *endpoint_id)
                .map(|(id, _state)| *id)
                .collect();
            let incoming = incoming_ids
                .into_iter()
                .filter_map(|id| registry.incoming.remove(&id))
                .collect();
            let outgoing = registry
                .outgoing
                .values()
                .filter(|state| state.endpoint_ids == std::slice::from_ref(endpoint_id))
                .map(|state| state.cancel.clone())
                .collect();
            (incoming, outgoing)
        };

        for state in incoming {
            let id = state.header.id;
            let total = state.header.total_size;
            let received = state.received;
            discard_assembler(state.assembler).await;
            self.sink.on_payload_transfer_update(
                endpoint_id,
                PayloadTransferUpdate::terminal(id, PayloadStatus::Failure, total, received),
            );
        }
        for cancel in outgoing {
            cancel.cancel();
        }
        barrier.count_down();
    }
}

enum OutgoingSource {
    Bytes { bytes: Vec<u8>, cursor: usize },
    File { file: fs::File, remaining: i64 },
    Stream { payload: StreamPayload, pending: Vec<u8>, finished: bool },
}

impl OutgoingSource {
    async fn open(payload: Payload) -> std::io::Result<Self> {
        match payload {
            Payload::Bytes { bytes, .. } => Ok(Self::Bytes { bytes, cursor: 0 }),
            Payload::File { path, size, .. } => {
                let file = fs::File::open(&path).await?;
                Ok(Self::File {
                    file,
                    remaining: size,
                })
            }
            Payload::Stream { stream, .. } => Ok(Self::Stream {
                payload: stream,
                pending: Vec::new(),
                finished: false,
            }),
        }
    }

    /// Returns the next chunk capped at `limit` bytes and whether it is the
    /// final one.
    async fn next_chunk(&mut self, limit: usize) -> std::io::Result<(Vec<u8>, bool)> {
        match self {
            Self::Bytes { bytes, cursor } => {
                let end = (*cursor + limit).min(bytes.len());
                let chunk = bytes[*cursor..end].to_vec();
                *cursor = end;
                Ok((chunk, *cursor == bytes.len()))
            }
            Self::File { file, remaining } => {
                let want = limit.min(usize::try_from(*remaining).unwrap_or(limit)).max(1);
                let mut buffer = vec![0u8; want];
                let read = file.read(&mut buffer).await?;
                buffer.truncate(read);
                *remaining -= read as i64;
                Ok((buffer, read == 0 || *remaining <= 0))
            }
            Self::Stream {
                payload,
                pending,
                finished,
            } => {
                if pending.is_empty() && !*finished {
                    match payload.next_chunk().await {
                        Some(chunk) => *pending = chunk,
                        None => *finished = true,
                    }
                }
                if pending.is_empty() {
                    return Ok((Vec::new(), true));
                }
                let take = limit.min(pending.len());
                let chunk: Vec<u8> = pending.drain(..take).collect();
                Ok((chunk, false))
            }
        }
    }
}
