use std::sync::Mutex;

use strum_macros::Display;
use time::OffsetDateTime;
use tracing::debug;

use crate::ids::EndpointId;
use crate::medium::Medium;

/// Why a channel or endpoint was torn down.
///
/// Doubles as the policy key for the safe-disconnect handshake: reasons other
/// than `LocalDisconnection`/`RemoteDisconnection` skip the handshake, and
/// `IoError` marks the disconnection unsafe.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
pub enum DisconnectionReason {
    #[strum(to_string = "local_disconnection")]
    LocalDisconnection,
    #[strum(to_string = "remote_disconnection")]
    RemoteDisconnection,
    #[strum(to_string = "io_error")]
    IoError,
    #[strum(to_string = "upgraded")]
    Upgraded,
    #[strum(to_string = "shutdown")]
    Shutdown,
    #[strum(to_string = "unfinished")]
    Unfinished,
    #[strum(to_string = "prev_channel_disconnection_in_reconnect")]
    PrevChannelDisconnectionInReconnect,
}

impl DisconnectionReason {
    /// Returns whether teardown with this reason skips the disconnect frames.
    #[must_use]
    pub const fn skips_handshake(self) -> bool {
        matches!(
            self,
            Self::Upgraded
                | Self::Shutdown
                | Self::Unfinished
                | Self::PrevChannelDisconnectionInReconnect
        )
    }
}

/// A single analytics event.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AnalyticsEvent {
    ConnectionEstablished {
        endpoint_id: EndpointId,
        medium: Medium,
    },
    Disconnection {
        endpoint_id: EndpointId,
        reason: DisconnectionReason,
        safe: bool,
    },
    UpgradeAttempt {
        endpoint_id: EndpointId,
        medium: Medium,
    },
    UpgradeSuccess {
        endpoint_id: EndpointId,
        medium: Medium,
    },
    UpgradeRevert {
        endpoint_id: EndpointId,
        medium: Medium,
    },
    KeepAliveTimeout {
        endpoint_id: EndpointId,
    },
}

/// Sink for lifecycle events.
///
/// Implementations must be cheap and non-blocking; events are recorded from
/// reader and lifecycle paths.
pub trait AnalyticsRecorder: Send + Sync {
    /// Records one event.
    fn record(&self, event: AnalyticsEvent);
}

/// Recorder that keeps a bounded in-memory journal, inspectable by tests.
#[derive(Debug, Default)]
pub struct InMemoryAnalyticsRecorder {
    events: Mutex<Vec<(OffsetDateTime, AnalyticsEvent)>>,
}

impl InMemoryAnalyticsRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all recorded events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events
            .lock()
            .expect("analytics journal poisoned")
            .iter()
            .map(|(_at, event)| event.clone())
            .collect()
    }

    /// Counts recorded disconnections matching `safe`.
    #[must_use]
    pub fn disconnection_count(&self, safe: bool) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, AnalyticsEvent::Disconnection { safe: s, .. } if *s == safe))
            .count()
    }
}

impl AnalyticsRecorder for InMemoryAnalyticsRecorder {
    fn record(&self, event: AnalyticsEvent) {
        debug!(?event, "analytics event");
        self.events
            .lock()
            .expect("analytics journal poisoned")
            .push((OffsetDateTime::now_utc(), event));
    }
}

/// Recorder that drops every event.
#[derive(Debug, Default)]
pub struct NoopAnalyticsRecorder;

impl AnalyticsRecorder for NoopAnalyticsRecorder {
    fn record(&self, _event: AnalyticsEvent) {}
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(DisconnectionReason::LocalDisconnection, false)]
    #[case(DisconnectionReason::RemoteDisconnection, false)]
    #[case(DisconnectionReason::IoError, false)]
    #[case(DisconnectionReason::Upgraded, true)]
    #[case(DisconnectionReason::Shutdown, true)]
    #[case(DisconnectionReason::Unfinished, true)]
    #[case(DisconnectionReason::PrevChannelDisconnectionInReconnect, true)]
    fn handshake_skip_policy(#[case] reason: DisconnectionReason, #[case] expected: bool) {
        assert_eq!(expected, reason.skips_handshake());
    }

    #[test]
    fn in_memory_recorder_counts_safe_disconnections() {
        let recorder = InMemoryAnalyticsRecorder::new();
        recorder.record(AnalyticsEvent::Disconnection {
            endpoint_id: EndpointId::from("E1"),
            reason: DisconnectionReason::LocalDisconnection,
            safe: true,
        });
        recorder.record(AnalyticsEvent::Disconnection {
            endpoint_id: EndpointId::from("E2"),
            reason: DisconnectionReason::IoError,
            safe: false,
        });

        assert_eq!(1, recorder.disconnection_count(true));
        assert_eq!(1, recorder.disconnection_count(false));
        assert_eq!(2, recorder.events().len());
    }
}
