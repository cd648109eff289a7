mod handlers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use handlers::{BwuHandler, HubBwuHandler, UpgradePath, WifiLanBwuHandler};

use crate::analytics::{AnalyticsEvent, AnalyticsRecorder, DisconnectionReason};
use crate::channel::{EndpointChannel, PacketMetaData};
use crate::channel_manager::EndpointChannelManager;
use crate::config::{AllowedMediums, DataUsage, UPGRADE_ACCEPT_TIMEOUT, UPGRADE_INTRODUCTION_TIMEOUT};
use crate::endpoint_manager::{CountDownLatch, EndpointManager, FrameProcessor};
use crate::error::Status;
use crate::frame::{BwuEvent, Frame};
use crate::ids::EndpointId;
use crate::medium::{Medium, UpgradeCredentials};

/// Preference order for the upgraded medium, best first.
const MEDIUM_PREFERENCE: [Medium; 5] = [
    Medium::Awdl,
    Medium::WifiLan,
    Medium::WifiHotspot,
    Medium::WebRtc,
    Medium::Bluetooth,
];

/// Picks the upgrade medium for a seed channel, honoring the allowance set,
/// the data-usage policy, the peer's advertised capabilities, and which
/// handlers exist.
fn choose_upgrade_medium(
    seed_medium: Medium,
    allowed: &AllowedMediums,
    data_usage: DataUsage,
    peer_mediums: &[Medium],
    available: impl Fn(Medium) -> bool,
) -> Option<Medium> {
    MEDIUM_PREFERENCE.into_iter().find(|&medium| {
        medium != seed_medium
            && allowed.allows(medium)
            && peer_mediums.contains(&medium)
            && !(medium.requires_internet() && data_usage == DataUsage::Offline)
            && available(medium)
    })
}

enum InFlight {
    /// Initiator advertised credentials and is accepting on the new medium.
    InitiatorAccepting { cancel: CancellationToken },
    /// Initiator holds the introduced channel and is draining the seed.
    InitiatorDraining {
        medium: Medium,
        new_channel: Arc<EndpointChannel>,
    },
    /// Target is dialing the advertised credentials.
    TargetDialing,
    /// Target holds the acked channel and waits for the seed to drain.
    TargetDraining {
        medium: Medium,
        new_channel: Arc<EndpointChannel>,
    },
}

#[derive(Default)]
struct BwuState {
    in_flight: HashMap<EndpointId, InFlight>,
    local_ids: HashMap<EndpointId, EndpointId>,
    peer_mediums: HashMap<EndpointId, Vec<Medium>>,
}

type MediumObserver = Arc<dyn Fn(&EndpointId, Medium) + Send + Sync>;

/// Bandwidth-upgrade orchestrator.
///
/// The initiator side mints credentials on a faster medium, advertises them
/// over the seed channel, and atomically swaps the endpoint's channel once
/// the target dialed in and both sides drained the seed. The target side
/// consumes `UpgradePathAvailable` frames and dials. At most one upgrade is
/// in flight per endpoint; a revert requires the client to ask again.
pub struct BwuManager {
    weak_self: std::sync::Weak<Self>,
    channel_manager: Arc<EndpointChannelManager>,
    analytics: Arc<dyn AnalyticsRecorder>,
    handlers: HashMap<Medium, Arc<dyn BwuHandler>>,
    state: Mutex<BwuState>,
    observer: Mutex<Option<MediumObserver>>,
}

impl BwuManager {
    /// Creates the manager over the endpoint manager's channel registry.
    #[must_use]
    pub fn new(
        endpoint_manager: &Arc<EndpointManager>,
        analytics: Arc<dyn AnalyticsRecorder>,
        handlers: Vec<Arc<dyn BwuHandler>>,
    ) -> Arc<Self> {
        let channel_manager = Arc::clone(endpoint_manager.channel_manager());
        let handlers = handlers
            .into_iter()
            .map(|handler| (handler.medium(), handler))
            .collect();
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            channel_manager,
            analytics,
            handlers,
            state: Mutex::new(BwuState::default()),
            observer: Mutex::new(None),
        })
    }

    /// Sets the callback fired when an endpoint lands on an upgraded medium.
    pub fn set_medium_observer(&self, observer: MediumObserver) {
        *self.observer.lock().expect("observer slot poisoned") = Some(observer);
    }

    /// Records connection-scoped facts the upgrade protocol needs: our own
    /// endpoint id for the introduction frame and the peer's mediums for the
    /// selection policy.
    pub fn register_connection(
        &self,
        peer_endpoint_id: EndpointId,
        local_endpoint_id: EndpointId,
        peer_mediums: Vec<Medium>,
    ) {
        let mut state = self.state.lock().expect("upgrade state poisoned");
        state
            .local_ids
            .insert(peer_endpoint_id.clone(), local_endpoint_id);
        state.peer_mediums.insert(peer_endpoint_id, peer_mediums);
    }

    /// Starts an upgrade for `endpoint_id` as the initiator.
    ///
    /// # Errors
    ///
    /// Returns `OutOfOrderCall` when an upgrade is already in flight,
    /// `NotConnectedToEndpoint` when there is no seed channel, and `Error`
    /// when no eligible medium remains or it cannot start accepting.
    #[instrument(skip(self, allowed), fields(%endpoint_id))]
    pub async fn initiate_upgrade(
        self: &Arc<Self>,
        endpoint_id: &EndpointId,
        allowed: &AllowedMediums,
        data_usage: DataUsage,
    ) -> Result<(), Status> {
        let Some(seed) = self.channel_manager.channel_for_endpoint(endpoint_id) else {
            return Err(Status::NotConnectedToEndpoint);
        };

        let medium = {
            let mut state = self.state.lock().expect("upgrade state poisoned");
            if state.in_flight.contains_key(endpoint_id) {
                return Err(Status::OutOfOrderCall);
            }
            let peer_mediums = state
                .peer_mediums
                .get(endpoint_id)
                .cloned()
                .unwrap_or_default();
            let Some(medium) = choose_upgrade_medium(
                seed.medium(),
                allowed,
                data_usage,
                &peer_mediums,
                |candidate| self.handlers.contains_key(&candidate),
            ) else {
                return Err(Status::Error);
            };
            let cancel = CancellationToken::new();
            state.in_flight.insert(
                endpoint_id.clone(),
                InFlight::InitiatorAccepting {
                    cancel: cancel.clone(),
                },
            );
            medium
        };

        self.analytics.record(AnalyticsEvent::UpgradeAttempt {
            endpoint_id: endpoint_id.clone(),
            medium,
        });

        let handler = Arc::clone(
            self.handlers
                .get(&medium)
                .expect("selection policy only yields handled mediums"),
        );
        let path = match handler
            .initialize_upgrade_path(seed.service_id(), endpoint_id)
            .await
        {
            Ok(path) => path,
            Err(error) => {
                warn!(?error, %medium, "upgrade path initialization failed");
                self.revert(endpoint_id, medium);
                return Err(Status::from(error));
            }
        };

        let advertise = Frame::BandwidthUpgradeNegotiation(BwuEvent::UpgradePathAvailable {
            medium,
            credentials: path.credentials().clone(),
        });
        if let Err(error) = seed.write_frame(&advertise).await {
            warn!(?error, "failed to advertise the upgrade path");
            self.revert(endpoint_id, medium);
            return Err(Status::EndpointIoError);
        }

        let manager = Arc::clone(self);
        let endpoint_id = endpoint_id.clone();
        tokio::spawn(async move {
            manager
                .run_initiator_accept(endpoint_id, medium, seed, path)
                .await;
        });
        Ok(())
    }

    /// Initiator: wait for the target to dial in and introduce itself, then
    /// start draining the seed channel.
    async fn run_initiator_accept(
        self: Arc<Self>,
        endpoint_id: EndpointId,
        medium: Medium,
        seed: Arc<EndpointChannel>,
        mut path: UpgradePath,
    ) {
        let cancel = {
            let state = self.state.lock().expect("upgrade state poisoned");
            match state.in_flight.get(&endpoint_id) {
                Some(InFlight::InitiatorAccepting { cancel }) => cancel.clone(),
                _ => return,
            }
        };

        let accepted = tokio::select! {
            accepted = timeout(
                UPGRADE_ACCEPT_TIMEOUT,
                self.accept_introduced_channel(&endpoint_id, medium, &seed, &mut path),
            ) => accepted.ok().flatten(),
            () = cancel.cancelled() => None,
        };

        let Some(new_channel) = accepted else {
            debug!(%endpoint_id, %medium, "upgrade accept timed out or was cancelled");
            self.revert(&endpoint_id, medium);
            return;
        };

        // Drain the seed: hold further frame writes, then tell the target
        // nothing more will be written on it. The pause comes first so no
        // payload chunk can slip in after the last-write marker.
        seed.pause();
        let last_write = Frame::BandwidthUpgradeNegotiation(BwuEvent::LastWriteToPriorChannel);
        if let Err(error) = seed.write_message(&last_write.encode()).await {
            warn!(%endpoint_id, ?error, "failed to start draining the seed channel");
            seed.resume();
            new_channel.close(DisconnectionReason::Shutdown).await;
            self.revert(&endpoint_id, medium);
            return;
        }

        {
            let mut state = self.state.lock().expect("upgrade state poisoned");
            state.in_flight.insert(
                endpoint_id.clone(),
                InFlight::InitiatorDraining {
                    medium,
                    new_channel,
                },
            );
        }

        // If the drain confirmation never arrives, revert and resume the seed.
        let manager = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::time::sleep(UPGRADE_ACCEPT_TIMEOUT).await;
            let still_draining = {
                let state = manager.state.lock().expect("upgrade state poisoned");
                matches!(
                    state.in_flight.get(&endpoint_id),
                    Some(InFlight::InitiatorDraining { .. })
                )
            };
            if still_draining {
                warn!(%endpoint_id, "seed drain confirmation never arrived");
                seed.resume();
                manager.revert(&endpoint_id, medium);
            }
        });
    }

    async fn accept_introduced_channel(
        &self,
        endpoint_id: &EndpointId,
        medium: Medium,
        seed: &Arc<EndpointChannel>,
        path: &mut UpgradePath,
    ) -> Option<Arc<EndpointChannel>> {
        loop {
            let socket = path.next_inbound().await?;
            let channel = Arc::new(EndpointChannel::new(
                format!("{endpoint_id}:{medium}:upgrade"),
                seed.service_id().clone(),
                medium,
                socket,
            ));

            let introduction = timeout(UPGRADE_INTRODUCTION_TIMEOUT, channel.read()).await;
            let frame = introduction
                .ok()
                .and_then(Result::ok)
                .and_then(|raw| Frame::decode(&raw).ok());
            match frame {
                Some(Frame::BandwidthUpgradeNegotiation(BwuEvent::ClientIntroduction {
                    endpoint_id: introduced,
                })) if introduced == *endpoint_id => {
                    let ack =
                        Frame::BandwidthUpgradeNegotiation(BwuEvent::ClientIntroductionAck);
                    if channel.write_frame(&ack).await.is_err() {
                        channel.close(DisconnectionReason::IoError).await;
                        continue;
                    }
                    return Some(channel);
                }
                _ => {
                    debug!(%endpoint_id, "inbound upgrade socket failed the introduction");
                    channel.close(DisconnectionReason::IoError).await;
                }
            }
        }
    }

    /// Target: dial the advertised path, introduce ourselves, await the ack.
    #[instrument(skip(self, credentials), fields(%endpoint_id, %medium))]
    async fn run_target_dial(
        self: Arc<Self>,
        endpoint_id: EndpointId,
        medium: Medium,
        credentials: UpgradeCredentials,
    ) {
        let Some(seed) = self.channel_manager.channel_for_endpoint(&endpoint_id) else {
            self.clear_in_flight(&endpoint_id);
            return;
        };
        let Some(handler) = self.handlers.get(&medium).map(Arc::clone) else {
            debug!(%medium, "no handler for the advertised upgrade medium");
            self.clear_in_flight(&endpoint_id);
            return;
        };
        let local_id = {
            let state = self.state.lock().expect("upgrade state poisoned");
            state.local_ids.get(&endpoint_id).cloned()
        };
        let Some(local_id) = local_id else {
            warn!(%endpoint_id, "no local endpoint id registered for upgrade");
            self.clear_in_flight(&endpoint_id);
            return;
        };

        self.analytics.record(AnalyticsEvent::UpgradeAttempt {
            endpoint_id: endpoint_id.clone(),
            medium,
        });

        let socket = match handler
            .connect_to_upgrade_path(seed.service_id(), &credentials)
            .await
        {
            Ok(socket) => socket,
            Err(error) => {
                debug!(?error, "upgrade dial failed; staying on the seed channel");
                self.revert(&endpoint_id, medium);
                return;
            }
        };

        let channel = Arc::new(EndpointChannel::new(
            format!("{endpoint_id}:{medium}:upgrade"),
            seed.service_id().clone(),
            medium,
            socket,
        ));
        let introduction = Frame::BandwidthUpgradeNegotiation(BwuEvent::ClientIntroduction {
            endpoint_id: local_id,
        });
        if let Err(error) = channel.write_frame(&introduction).await {
            debug!(?error, "upgrade introduction write failed");
            channel.close(DisconnectionReason::IoError).await;
            self.revert(&endpoint_id, medium);
            return;
        }

        let ack = timeout(UPGRADE_INTRODUCTION_TIMEOUT, channel.read()).await;
        let acked = matches!(
            ack.ok()
                .and_then(Result::ok)
                .and_then(|raw| Frame::decode(&raw).ok()),
            Some(Frame::BandwidthUpgradeNegotiation(
                BwuEvent::ClientIntroductionAck
            ))
        );
        if !acked {
            debug!(%endpoint_id, "upgrade introduction was not acknowledged");
            channel.close(DisconnectionReason::IoError).await;
            self.revert(&endpoint_id, medium);
            return;
        }

        let mut state = self.state.lock().expect("upgrade state poisoned");
        state.in_flight.insert(
            endpoint_id,
            InFlight::TargetDraining {
                medium,
                new_channel: channel,
            },
        );
    }

    /// Swaps the endpoint onto `new_channel` and reports the outcome.
    async fn finalize_upgrade(
        &self,
        endpoint_id: &EndpointId,
        medium: Medium,
        new_channel: Arc<EndpointChannel>,
    ) {
        let replaced = self
            .channel_manager
            .replace_channel_for_endpoint(
                endpoint_id,
                Arc::clone(&new_channel),
                false,
                DisconnectionReason::Upgraded,
            )
            .await;
        self.clear_in_flight(endpoint_id);

        if replaced {
            info!(%endpoint_id, %medium, "bandwidth upgrade complete");
            self.analytics.record(AnalyticsEvent::UpgradeSuccess {
                endpoint_id: endpoint_id.clone(),
                medium,
            });
            let observer = self.observer.lock().expect("observer slot poisoned").clone();
            if let Some(observer) = observer {
                observer(endpoint_id, medium);
            }
        } else {
            new_channel.close(DisconnectionReason::Shutdown).await;
            self.analytics.record(AnalyticsEvent::UpgradeRevert {
                endpoint_id: endpoint_id.clone(),
                medium,
            });
        }
    }

    fn revert(&self, endpoint_id: &EndpointId, medium: Medium) {
        self.clear_in_flight(endpoint_id);
        self.analytics.record(AnalyticsEvent::UpgradeRevert {
            endpoint_id: endpoint_id.clone(),
            medium,
        });
    }

    fn clear_in_flight(&self, endpoint_id: &EndpointId) {
        let mut state = self.state.lock().expect("upgrade state poisoned");
        state.in_flight.remove(endpoint_id);
    }
}

#[async_trait]
impl FrameProcessor for BwuManager {
    async fn on_incoming_frame(
        &self,
        frame: Frame,
        endpoint_id: &EndpointId,
        _medium: Medium,
        _packet_meta: PacketMetaData,
    ) {
        let Frame::BandwidthUpgradeNegotiation(event) = frame else {
            return;
        };
        match event {
            BwuEvent::UpgradePathAvailable {
                medium,
                credentials,
            } => {
                let claimed = {
                    let mut state = self.state.lock().expect("upgrade state poisoned");
                    if state.in_flight.contains_key(endpoint_id) {
                        debug!(%endpoint_id, "ignoring upgrade path while one is in flight");
                        false
                    } else {
                        state
                            .in_flight
                            .insert(endpoint_id.clone(), InFlight::TargetDialing);
                        true
                    }
                };
                if claimed && let Some(manager) = self.weak_self.upgrade() {
                    // The dial blocks on discovery; run it off the reader task.
                    let endpoint_id = endpoint_id.clone();
                    tokio::spawn(async move {
                        manager
                            .run_target_dial(endpoint_id, medium, credentials)
                            .await;
                    });
                }
            }
            BwuEvent::LastWriteToPriorChannel => {
                let draining = {
                    let state = self.state.lock().expect("upgrade state poisoned");
                    match state.in_flight.get(endpoint_id) {
                        Some(InFlight::TargetDraining {
                            medium,
                            new_channel,
                        }) => Some((*medium, Arc::clone(new_channel))),
                        _ => None,
                    }
                };
                let Some((medium, new_channel)) = draining else {
                    debug!(%endpoint_id, "last-write received with no upgrade pending");
                    return;
                };
                if let Some(seed) = self.channel_manager.channel_for_endpoint(endpoint_id) {
                    let safe_to_close =
                        Frame::BandwidthUpgradeNegotiation(BwuEvent::SafeToClosePriorChannel);
                    if let Err(error) = seed.write_frame(&safe_to_close).await {
                        debug!(%endpoint_id, ?error, "safe-to-close write failed");
                    }
                }
                self.finalize_upgrade(endpoint_id, medium, new_channel).await;
            }
            BwuEvent::SafeToClosePriorChannel => {
                let draining = {
                    let state = self.state.lock().expect("upgrade state poisoned");
                    match state.in_flight.get(endpoint_id) {
                        Some(InFlight::InitiatorDraining {
                            medium,
                            new_channel,
                        }) => Some((*medium, Arc::clone(new_channel))),
                        _ => None,
                    }
                };
                let Some((medium, new_channel)) = draining else {
                    debug!(%endpoint_id, "safe-to-close received with no drain pending");
                    return;
                };
                self.finalize_upgrade(endpoint_id, medium, new_channel).await;
            }
            BwuEvent::ClientIntroduction { .. } | BwuEvent::ClientIntroductionAck => {
                // Introductions travel on the new channel, never the seed.
                debug!(%endpoint_id, "unexpected introduction frame on the seed channel");
            }
        }
    }

    async fn on_endpoint_disconnect(
        &self,
        endpoint_id: &EndpointId,
        _reason: DisconnectionReason,
        barrier: CountDownLatch,
    ) {
        let removed = {
            let mut state = self.state.lock().expect("upgrade state poisoned");
            state.local_ids.remove(endpoint_id);
            state.peer_mediums.remove(endpoint_id);
            state.in_flight.remove(endpoint_id)
        };
        match removed {
            Some(InFlight::InitiatorAccepting { cancel }) => cancel.cancel(),
            Some(InFlight::InitiatorDraining { new_channel, .. })
            | Some(InFlight::TargetDraining { new_channel, .. }) => {
                new_channel.close(DisconnectionReason::Shutdown).await;
            }
            Some(InFlight::TargetDialing) | None => {}
        }
        barrier.count_down();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::prefers_awdl(Medium::Bluetooth, vec![Medium::Awdl, Medium::WifiLan], Some(Medium::Awdl))]
    #[case::falls_back_to_lan(Medium::Bluetooth, vec![Medium::WifiLan], Some(Medium::WifiLan))]
    #[case::skips_seed_medium(Medium::WifiLan, vec![Medium::WifiLan], None)]
    #[case::peer_gates(Medium::Bluetooth, vec![], None)]
    fn medium_selection_honors_preference_and_gates(
        #[case] seed: Medium,
        #[case] peer: Vec<Medium>,
        #[case] expected: Option<Medium>,
    ) {
        let observed = choose_upgrade_medium(
            seed,
            &AllowedMediums::default(),
            DataUsage::Offline,
            &peer,
            |_medium| true,
        );
        assert_eq!(expected, observed);
    }

    #[test]
    fn offline_policy_excludes_webrtc() {
        let mut allowed = AllowedMediums::default();
        allowed.web_rtc = true;
        let observed = choose_upgrade_medium(
            Medium::Bluetooth,
            &allowed,
            DataUsage::Offline,
            &[Medium::WebRtc],
            |_medium| true,
        );
        assert_eq!(None, observed);

        let online = choose_upgrade_medium(
            Medium::Bluetooth,
            &allowed,
            DataUsage::Online,
            &[Medium::WebRtc],
            |_medium| true,
        );
        assert_eq!(Some(Medium::WebRtc), online);
    }

    #[test]
    fn selection_requires_an_available_handler() {
        let observed = choose_upgrade_medium(
            Medium::Bluetooth,
            &AllowedMediums::default(),
            DataUsage::Offline,
            &[Medium::Awdl, Medium::WifiLan],
            |medium| medium == Medium::WifiLan,
        );
        assert_eq!(Some(Medium::WifiLan), observed);
    }
}
