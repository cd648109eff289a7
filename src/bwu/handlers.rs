use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::config::{MAX_CONCURRENT_ACCEPTS, UPGRADE_DISCOVERY_TIMEOUT};
use crate::error::MediumError;
use crate::ids::{EndpointId, ServiceId};
use crate::medium::{
    BoxedSocket, Medium, MediumHub, UpgradeCredentials, WifiLanDialer, WifiLanListener,
    generate_password, generate_service_name, service_type_for,
};

/// Live accept path on the upgraded medium.
///
/// Dropping it stops the accept loop and withdraws any advertisement, which
/// is how a revert leaves no trace on the new medium.
pub struct UpgradePath {
    credentials: UpgradeCredentials,
    sockets: mpsc::Receiver<BoxedSocket>,
    _revert: DropGuard,
}

impl UpgradePath {
    /// Returns the credentials the target needs to dial.
    #[must_use]
    pub fn credentials(&self) -> &UpgradeCredentials {
        &self.credentials
    }

    /// Waits for the next inbound socket on the upgraded medium.
    pub async fn next_inbound(&mut self) -> Option<BoxedSocket> {
        self.sockets.recv().await
    }
}

/// Per-medium upgrade driver: the initiator side starts accepting and mints
/// credentials, the target side dials with them.
#[async_trait]
pub trait BwuHandler: Send + Sync {
    /// The medium this handler upgrades onto.
    fn medium(&self) -> Medium;

    /// Starts accepting on the upgraded medium and returns the credential
    /// bundle to advertise to the target.
    async fn initialize_upgrade_path(
        &self,
        service_id: &ServiceId,
        endpoint_id: &EndpointId,
    ) -> Result<UpgradePath, MediumError>;

    /// Dials the initiator with received credentials before the discovery
    /// deadline.
    async fn connect_to_upgrade_path(
        &self,
        service_id: &ServiceId,
        credentials: &UpgradeCredentials,
    ) -> Result<BoxedSocket, MediumError>;
}

/// Hub-backed upgrade driver used for AWDL, Wi-Fi Hotspot, and Bluetooth.
pub struct HubBwuHandler {
    hub: Arc<MediumHub>,
    medium: Medium,
}

impl HubBwuHandler {
    /// Creates a handler for `medium` over the shared hub.
    #[must_use]
    pub fn new(hub: Arc<MediumHub>, medium: Medium) -> Self {
        Self { hub, medium }
    }

    fn mint_credentials(&self, service_id: &ServiceId) -> (String, Option<String>, UpgradeCredentials) {
        match self.medium {
            Medium::Awdl => {
                let service_name = generate_service_name();
                let password = generate_password();
                let credentials = UpgradeCredentials::Awdl {
                    service_name: service_name.clone(),
                    service_type: service_type_for(service_id),
                    password: password.clone(),
                };
                (service_name, Some(password), credentials)
            }
            Medium::WifiHotspot => {
                let ssid = format!("DIRECT-{}", generate_service_name());
                let password = generate_password();
                let credentials = UpgradeCredentials::WifiHotspot {
                    ssid: ssid.clone(),
                    password: password.clone(),
                    gateway: "192.168.49.1".to_owned(),
                    port: 0,
                };
                (ssid, Some(password), credentials)
            }
            _ => {
                // Bluetooth-style mediums dial by listener identity alone.
                let service_name = generate_service_name();
                let mut mac = [0u8; 6];
                hex::decode_to_slice(&service_name[..12], &mut mac)
                    .expect("generated service names are hex");
                (service_name, None, UpgradeCredentials::Bluetooth { mac })
            }
        }
    }
}

#[async_trait]
impl BwuHandler for HubBwuHandler {
    fn medium(&self) -> Medium {
        self.medium
    }

    async fn initialize_upgrade_path(
        &self,
        service_id: &ServiceId,
        endpoint_id: &EndpointId,
    ) -> Result<UpgradePath, MediumError> {
        let (service_name, password, credentials) = self.mint_credentials(service_id);
        let mut advertised = self.hub.advertise(
            self.medium,
            &service_name,
            endpoint_id.clone(),
            Vec::new(),
            password,
            // Upgrade listeners are dialed by credentials, never discovered.
            false,
        )?;

        let (sockets_tx, sockets_rx) = mpsc::channel(MAX_CONCURRENT_ACCEPTS);
        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    socket = advertised.next_inbound() => {
                        let Some(socket) = socket else { break };
                        if sockets_tx.send(socket).await.is_err() {
                            break;
                        }
                    }
                    () = accept_cancel.cancelled() => break,
                }
            }
            debug!(service_name = advertised.service_name(), "upgrade accept loop stopped");
        });

        Ok(UpgradePath {
            credentials,
            sockets: sockets_rx,
            _revert: cancel.drop_guard(),
        })
    }

    async fn connect_to_upgrade_path(
        &self,
        _service_id: &ServiceId,
        credentials: &UpgradeCredentials,
    ) -> Result<BoxedSocket, MediumError> {
        let deadline = Instant::now() + UPGRADE_DISCOVERY_TIMEOUT;
        self.hub
            .dial_by_deadline(
                self.medium,
                &credentials.dial_key(),
                credentials.password(),
                deadline,
            )
            .await
    }
}

/// TCP-backed upgrade driver for the Wi-Fi LAN medium.
pub struct WifiLanBwuHandler;

#[async_trait]
impl BwuHandler for WifiLanBwuHandler {
    fn medium(&self) -> Medium {
        Medium::WifiLan
    }

    async fn initialize_upgrade_path(
        &self,
        _service_id: &ServiceId,
        _endpoint_id: &EndpointId,
    ) -> Result<UpgradePath, MediumError> {
        let listener = WifiLanListener::bind().await?;
        let credentials = UpgradeCredentials::WifiLan {
            ip: listener.ip(),
            port: listener.port(),
        };

        let (sockets_tx, sockets_rx) = mpsc::channel(MAX_CONCURRENT_ACCEPTS);
        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok(socket) = accepted else { break };
                        if sockets_tx.send(socket).await.is_err() {
                            break;
                        }
                    }
                    () = accept_cancel.cancelled() => break,
                }
            }
        });

        Ok(UpgradePath {
            credentials,
            sockets: sockets_rx,
            _revert: cancel.drop_guard(),
        })
    }

    async fn connect_to_upgrade_path(
        &self,
        _service_id: &ServiceId,
        credentials: &UpgradeCredentials,
    ) -> Result<BoxedSocket, MediumError> {
        let UpgradeCredentials::WifiLan { ip, port } = credentials else {
            return Err(MediumError::BadCredentials);
        };
        WifiLanDialer.connect(ip, *port).await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn awdl_handler_accepts_a_credentialed_dial() {
        let hub = MediumHub::new();
        let handler = HubBwuHandler::new(Arc::clone(&hub), Medium::Awdl);
        let service = ServiceId::from("svc");
        let mut path = handler
            .initialize_upgrade_path(&service, &EndpointId::from("E1"))
            .await
            .expect("initialize");

        let credentials = path.credentials().clone();
        assert_matches!(credentials, UpgradeCredentials::Awdl { .. });

        let _dialed = handler
            .connect_to_upgrade_path(&service, &credentials)
            .await
            .expect("dial with minted credentials");
        let accepted = path.next_inbound().await;
        assert_eq!(true, accepted.is_some());
    }

    #[tokio::test]
    async fn dropping_the_path_withdraws_the_listener() {
        let hub = MediumHub::new();
        let handler = HubBwuHandler::new(Arc::clone(&hub), Medium::Awdl);
        let service = ServiceId::from("svc");
        let path = handler
            .initialize_upgrade_path(&service, &EndpointId::from("E1"))
            .await
            .expect("initialize");
        let credentials = path.credentials().clone();
        drop(path);

        let withdrawn = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                let result = hub.dial(
                    Medium::Awdl,
                    &credentials.dial_key(),
                    credentials.password(),
                );
                if matches!(result, Err(MediumError::ServiceNotFound { .. })) {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert_eq!(true, withdrawn.is_ok());
    }

    #[tokio::test]
    async fn lan_handler_serves_real_tcp_sockets() {
        let handler = WifiLanBwuHandler;
        let service = ServiceId::from("svc");
        let mut path = handler
            .initialize_upgrade_path(&service, &EndpointId::from("E1"))
            .await
            .expect("bind");
        let credentials = path.credentials().clone();

        let _dialed = handler
            .connect_to_upgrade_path(&service, &credentials)
            .await
            .expect("connect");
        let accepted = path.next_inbound().await;
        assert_eq!(true, accepted.is_some());
    }
}
