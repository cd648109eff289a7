use std::path::PathBuf;

use strum_macros::Display;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::ids::PayloadId;
use crate::medium::Medium;

/// Discriminant of the payload union.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
pub enum PayloadKind {
    #[strum(to_string = "bytes")]
    Bytes,
    #[strum(to_string = "file")]
    File,
    #[strum(to_string = "stream")]
    Stream,
}

/// Consumer half of a stream payload.
#[derive(Debug)]
pub struct StreamPayload {
    chunks: ReceiverStream<Vec<u8>>,
}

impl StreamPayload {
    /// Wraps a chunk receiver.
    #[must_use]
    pub fn new(chunks: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            chunks: ReceiverStream::new(chunks),
        }
    }

    /// Waits for the next chunk; `None` once the stream finished.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.chunks.next().await
    }
}

/// An application-visible unit of transfer.
#[derive(Debug)]
pub enum Payload {
    Bytes {
        id: PayloadId,
        bytes: Vec<u8>,
    },
    File {
        id: PayloadId,
        path: PathBuf,
        size: i64,
    },
    Stream {
        id: PayloadId,
        stream: StreamPayload,
    },
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bytes { id: a, bytes: ab }, Self::Bytes { id: b, bytes: bb }) => {
                a == b && ab == bb
            }
            (
                Self::File {
                    id: a,
                    path: ap,
                    size: asz,
                },
                Self::File {
                    id: b,
                    path: bp,
                    size: bsz,
                },
            ) => a == b && ap == bp && asz == bsz,
            (Self::Stream { id: a, .. }, Self::Stream { id: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Payload {
    /// Creates a bytes payload with a fresh id.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::Bytes {
            id: PayloadId::generate(),
            bytes,
        }
    }

    /// Creates a file payload with a fresh id.
    #[must_use]
    pub fn from_file(path: PathBuf, size: i64) -> Self {
        Self::File {
            id: PayloadId::generate(),
            path,
            size,
        }
    }

    /// Creates a stream payload with a fresh id.
    #[must_use]
    pub fn from_stream(chunks: mpsc::Receiver<Vec<u8>>) -> Self {
        Self::Stream {
            id: PayloadId::generate(),
            stream: StreamPayload::new(chunks),
        }
    }

    /// Returns the payload id.
    #[must_use]
    pub fn id(&self) -> PayloadId {
        match self {
            Self::Bytes { id, .. } | Self::File { id, .. } | Self::Stream { id, .. } => *id,
        }
    }

    /// Returns the payload discriminant.
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Bytes { .. } => PayloadKind::Bytes,
            Self::File { .. } => PayloadKind::File,
            Self::Stream { .. } => PayloadKind::Stream,
        }
    }

    /// Returns the total byte count, `-1` when unbounded (streams).
    #[must_use]
    pub fn total_size(&self) -> i64 {
        match self {
            Self::Bytes { bytes, .. } => bytes.len() as i64,
            Self::File { size, .. } => *size,
            Self::Stream { .. } => -1,
        }
    }

    /// Returns the file name used to materialize this payload remotely.
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::File { path, .. } => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            Self::Bytes { .. } | Self::Stream { .. } => None,
        }
    }
}

/// Transfer state reported by a payload status update.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
pub enum PayloadStatus {
    #[strum(to_string = "in_progress")]
    InProgress,
    #[strum(to_string = "success")]
    Success,
    #[strum(to_string = "failure")]
    Failure,
    #[strum(to_string = "canceled")]
    Canceled,
}

impl PayloadStatus {
    /// Returns whether no further updates follow this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// One progress report for a payload transfer.
///
/// For a given payload id, `bytes_transferred` is non-decreasing until a
/// terminal status, and exactly one terminal update is delivered per
/// registered listener.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PayloadTransferUpdate {
    pub payload_id: PayloadId,
    pub status: PayloadStatus,
    pub total_bytes: i64,
    pub bytes_transferred: i64,
}

impl PayloadTransferUpdate {
    /// Builds an in-progress update.
    #[must_use]
    pub fn in_progress(payload_id: PayloadId, total_bytes: i64, bytes_transferred: i64) -> Self {
        Self {
            payload_id,
            status: PayloadStatus::InProgress,
            total_bytes,
            bytes_transferred,
        }
    }

    /// Builds a terminal update.
    #[must_use]
    pub fn terminal(
        payload_id: PayloadId,
        status: PayloadStatus,
        total_bytes: i64,
        bytes_transferred: i64,
    ) -> Self {
        Self {
            payload_id,
            status,
            total_bytes,
            bytes_transferred,
        }
    }
}

/// Receives status updates for payload ids it was registered under.
pub trait PayloadStatusListener: Send + Sync {
    /// Delivers one update, along with the best known upgraded medium.
    fn on_status_update(&self, update: &PayloadTransferUpdate, upgraded_medium: Option<Medium>);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn bytes_payload_reports_inline_size() {
        let payload = Payload::from_bytes(vec![1, 2, 3]);
        assert_eq!(PayloadKind::Bytes, payload.kind());
        assert_eq!(3, payload.total_size());
        assert_eq!(None, payload.file_name());
    }

    #[test]
    fn stream_payload_size_is_unbounded() {
        let (_tx, rx) = mpsc::channel(1);
        let payload = Payload::from_stream(rx);
        assert_eq!(-1, payload.total_size());
    }

    #[test]
    fn file_payload_exposes_file_name() {
        let payload = Payload::from_file(PathBuf::from("/tmp/incoming/photo.jpg"), 42);
        assert_eq!(Some("photo.jpg".to_owned()), payload.file_name());
    }

    #[rstest]
    #[case(PayloadStatus::InProgress, false)]
    #[case(PayloadStatus::Success, true)]
    #[case(PayloadStatus::Failure, true)]
    #[case(PayloadStatus::Canceled, true)]
    fn terminal_statuses(#[case] status: PayloadStatus, #[case] expected: bool) {
        assert_eq!(expected, status.is_terminal());
    }
}
