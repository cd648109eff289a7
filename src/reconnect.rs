use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analytics::DisconnectionReason;
use crate::channel::EndpointChannel;
use crate::config::{AUTO_RECONNECT_GRACE, UPGRADE_INTRODUCTION_TIMEOUT};
use crate::frame::{AutoReconnectEvent, Frame};
use crate::ids::{EndpointId, ServiceId};
use crate::medium::{Medium, MediumHub};

const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// What the reconnect manager needs to re-dial a lost seed channel.
#[derive(Debug, Clone)]
pub struct ReconnectInfo {
    pub medium: Medium,
    pub service_name: String,
    pub local_endpoint_id: EndpointId,
    pub is_incoming: bool,
}

/// Completes a recovered connection: the delegate re-runs encryption and
/// re-registers the endpoint, or surfaces the deferred disconnect.
#[async_trait]
pub trait ReconnectDelegate: Send + Sync {
    /// A replacement channel was dialed and acknowledged.
    async fn on_reconnected(&self, endpoint_id: &EndpointId, channel: Arc<EndpointChannel>);

    /// The grace window closed without recovery.
    fn on_reconnect_failed(&self, endpoint_id: &EndpointId);
}

#[derive(Default)]
struct ReconnectState {
    known: HashMap<EndpointId, ReconnectInfo>,
    pending: HashMap<EndpointId, CancellationToken>,
}

/// Re-establishes a dropped seed channel within a grace window while
/// preserving the logical endpoint id.
///
/// The dialing side re-dials the remembered service and introduces itself
/// with an auto-reconnect frame; the hosting side keeps listening and treats
/// a matching introduction as the recovered connection.
pub struct AutoReconnectManager {
    hub: Arc<MediumHub>,
    state: Mutex<ReconnectState>,
    delegate: Mutex<Option<Arc<dyn ReconnectDelegate>>>,
}

impl AutoReconnectManager {
    /// Creates a manager dialing over `hub`.
    #[must_use]
    pub fn new(hub: Arc<MediumHub>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            state: Mutex::new(ReconnectState::default()),
            delegate: Mutex::new(None),
        })
    }

    /// Installs the delegate that finishes recovered connections.
    pub fn set_delegate(&self, delegate: Arc<dyn ReconnectDelegate>) {
        *self.delegate.lock().expect("delegate slot poisoned") = Some(delegate);
    }

    /// Remembers how to reach `endpoint_id` again.
    pub fn register_endpoint(&self, endpoint_id: EndpointId, info: ReconnectInfo) {
        self.state
            .lock()
            .expect("reconnect state poisoned")
            .known
            .insert(endpoint_id, info);
    }

    /// Drops all memory of `endpoint_id`.
    pub fn forget_endpoint(&self, endpoint_id: &EndpointId) {
        let mut state = self.state.lock().expect("reconnect state poisoned");
        state.known.remove(endpoint_id);
        if let Some(pending) = state.pending.remove(endpoint_id) {
            pending.cancel();
        }
    }

    /// Returns whether a reconnect attempt is running for `endpoint_id`.
    #[must_use]
    pub fn is_pending(&self, endpoint_id: &EndpointId) -> bool {
        self.state
            .lock()
            .expect("reconnect state poisoned")
            .pending
            .contains_key(endpoint_id)
    }

    /// Returns whether `endpoint_id` is eligible for host-side recovery.
    #[must_use]
    pub fn knows_endpoint(&self, endpoint_id: &EndpointId) -> bool {
        self.state
            .lock()
            .expect("reconnect state poisoned")
            .known
            .contains_key(endpoint_id)
    }

    /// Marks a host-side recovery as complete, stopping the grace timer.
    pub fn notify_reconnected(&self, endpoint_id: &EndpointId) {
        let mut state = self.state.lock().expect("reconnect state poisoned");
        if let Some(pending) = state.pending.remove(endpoint_id) {
            pending.cancel();
            info!(%endpoint_id, "endpoint recovered");
        }
    }

    /// Starts a recovery attempt after a channel loss.
    ///
    /// Returns `true` when an attempt was started, in which case the caller
    /// must suppress the client-facing disconnect until the attempt resolves.
    pub fn try_begin_reconnect(
        self: &Arc<Self>,
        endpoint_id: &EndpointId,
        reason: DisconnectionReason,
    ) -> bool {
        if reason != DisconnectionReason::IoError {
            return false;
        }
        let info = {
            let mut state = self.state.lock().expect("reconnect state poisoned");
            if state.pending.contains_key(endpoint_id) {
                return true;
            }
            let Some(info) = state.known.get(endpoint_id).cloned() else {
                return false;
            };
            let cancel = CancellationToken::new();
            state.pending.insert(endpoint_id.clone(), cancel.clone());
            info
        };

        let manager = Arc::clone(self);
        let endpoint_id = endpoint_id.clone();
        tokio::spawn(async move {
            if info.is_incoming {
                manager.await_host_side_recovery(endpoint_id).await;
            } else {
                manager.run_dial_attempts(endpoint_id, info).await;
            }
        });
        true
    }

    /// Host role: the remote dials us back; all we do is bound the wait.
    async fn await_host_side_recovery(self: Arc<Self>, endpoint_id: EndpointId) {
        let cancel = {
            let state = self.state.lock().expect("reconnect state poisoned");
            match state.pending.get(&endpoint_id) {
                Some(cancel) => cancel.clone(),
                None => return,
            }
        };
        tokio::select! {
            () = sleep(AUTO_RECONNECT_GRACE) => {
                warn!(%endpoint_id, "reconnect grace window closed while hosting");
                self.finish_failed(&endpoint_id);
            }
            () = cancel.cancelled() => {}
        }
    }

    /// Dialer role: re-dial the remembered service until the window closes.
    async fn run_dial_attempts(self: Arc<Self>, endpoint_id: EndpointId, info: ReconnectInfo) {
        let deadline = Instant::now() + AUTO_RECONNECT_GRACE;
        loop {
            if Instant::now() >= deadline {
                warn!(%endpoint_id, "reconnect grace window closed while dialing");
                self.finish_failed(&endpoint_id);
                return;
            }
            match self.dial_once(&endpoint_id, &info).await {
                Ok(channel) => {
                    let delegate = self.delegate.lock().expect("delegate slot poisoned").clone();
                    self.notify_reconnected(&endpoint_id);
                    if let Some(delegate) = delegate {
                        delegate.on_reconnected(&endpoint_id, channel).await;
                    }
                    return;
                }
                Err(error) => {
                    debug!(%endpoint_id, ?error, "reconnect dial attempt failed");
                    sleep(DIAL_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn dial_once(
        &self,
        endpoint_id: &EndpointId,
        info: &ReconnectInfo,
    ) -> Result<Arc<EndpointChannel>, crate::error::MediumError> {
        let socket = self.hub.dial(info.medium, &info.service_name, None)?;
        let channel = Arc::new(EndpointChannel::new(
            format!("{endpoint_id}:{}:reconnect", info.medium),
            ServiceId::from(info.service_name.as_str()),
            info.medium,
            socket,
        ));

        let introduction = Frame::AutoReconnect(AutoReconnectEvent::ClientIntroduction {
            endpoint_id: info.local_endpoint_id.clone(),
        });
        channel
            .write_frame(&introduction)
            .await
            .map_err(|_write| io_error("introduction write failed"))?;

        let ack = timeout(UPGRADE_INTRODUCTION_TIMEOUT, channel.read())
            .await
            .map_err(|_elapsed| io_error("introduction ack timed out"))?
            .map_err(|_read| io_error("introduction ack read failed"))?;
        match Frame::decode(&ack) {
            Ok(Frame::AutoReconnect(AutoReconnectEvent::ClientIntroductionAck)) => Ok(channel),
            _ => Err(io_error("unexpected introduction answer")),
        }
    }

    fn finish_failed(&self, endpoint_id: &EndpointId) {
        {
            let mut state = self.state.lock().expect("reconnect state poisoned");
            state.pending.remove(endpoint_id);
            state.known.remove(endpoint_id);
        }
        let delegate = self.delegate.lock().expect("delegate slot poisoned").clone();
        if let Some(delegate) = delegate {
            delegate.on_reconnect_failed(endpoint_id);
        }
    }
}

fn io_error(message: &str) -> crate::error::MediumError {
    crate::error::MediumError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        message.to_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::frame::Frame;

    #[derive(Default)]
    struct RecordingDelegate {
        reconnected: Mutex<Vec<EndpointId>>,
        failed: Mutex<Vec<EndpointId>>,
    }

    #[async_trait]
    impl ReconnectDelegate for RecordingDelegate {
        async fn on_reconnected(&self, endpoint_id: &EndpointId, _channel: Arc<EndpointChannel>) {
            self.reconnected
                .lock()
                .expect("reconnected poisoned")
                .push(endpoint_id.clone());
        }

        fn on_reconnect_failed(&self, endpoint_id: &EndpointId) {
            self.failed
                .lock()
                .expect("failed poisoned")
                .push(endpoint_id.clone());
        }
    }

    fn info(is_incoming: bool) -> ReconnectInfo {
        ReconnectInfo {
            medium: Medium::Ble,
            service_name: "NearbySharing".into(),
            local_endpoint_id: EndpointId::from("AAAA"),
            is_incoming,
        }
    }

    #[tokio::test]
    async fn dialer_recovers_within_the_grace_window() {
        let hub = crate::medium::MediumHub::new();
        let mut advertised = hub
            .advertise(
                Medium::Ble,
                "NearbySharing",
                EndpointId::from("HOST"),
                Vec::new(),
                None,
                true,
            )
            .expect("host advertises");

        // Host half: answer the introduction with an ack.
        tokio::spawn(async move {
            let socket = advertised.next_inbound().await.expect("inbound dial");
            let channel = EndpointChannel::new(
                "host",
                ServiceId::from("NearbySharing"),
                Medium::Ble,
                socket,
            );
            let raw = channel.read().await.expect("introduction read");
            let frame = Frame::decode(&raw).expect("introduction decodes");
            assert_eq!(
                Frame::AutoReconnect(AutoReconnectEvent::ClientIntroduction {
                    endpoint_id: EndpointId::from("AAAA"),
                }),
                frame
            );
            channel
                .write_frame(&Frame::AutoReconnect(
                    AutoReconnectEvent::ClientIntroductionAck,
                ))
                .await
                .expect("ack write");
            // Keep the host channel alive until the dialer read the ack.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let manager = AutoReconnectManager::new(hub);
        let delegate = Arc::new(RecordingDelegate::default());
        manager.set_delegate(Arc::clone(&delegate) as Arc<dyn ReconnectDelegate>);
        manager.register_endpoint(EndpointId::from("E1"), info(false));

        let started =
            manager.try_begin_reconnect(&EndpointId::from("E1"), DisconnectionReason::IoError);
        assert_eq!(true, started);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !delegate.reconnected.lock().expect("reconnected").is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("delegate should observe the recovery");
        assert_eq!(
            vec![EndpointId::from("E1")],
            delegate.reconnected.lock().expect("reconnected").clone()
        );
        assert_eq!(false, manager.is_pending(&EndpointId::from("E1")));
    }

    #[tokio::test]
    async fn clean_disconnects_and_unknown_endpoints_are_not_recovered() {
        let hub = crate::medium::MediumHub::new();
        let manager = AutoReconnectManager::new(hub);
        manager.register_endpoint(EndpointId::from("E1"), info(false));

        assert_eq!(
            false,
            manager.try_begin_reconnect(
                &EndpointId::from("E1"),
                DisconnectionReason::LocalDisconnection,
            )
        );
        assert_eq!(
            false,
            manager.try_begin_reconnect(&EndpointId::from("E2"), DisconnectionReason::IoError)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn host_side_window_expiry_reports_failure() {
        let hub = crate::medium::MediumHub::new();
        let manager = AutoReconnectManager::new(hub);
        let delegate = Arc::new(RecordingDelegate::default());
        manager.set_delegate(Arc::clone(&delegate) as Arc<dyn ReconnectDelegate>);
        manager.register_endpoint(EndpointId::from("E1"), info(true));

        assert_eq!(
            true,
            manager.try_begin_reconnect(&EndpointId::from("E1"), DisconnectionReason::IoError)
        );

        tokio::time::sleep(crate::config::AUTO_RECONNECT_GRACE + Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(
            vec![EndpointId::from("E1")],
            delegate.failed.lock().expect("failed").clone()
        );
        assert_eq!(false, manager.knows_endpoint(&EndpointId::from("E1")));
    }
}
