use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::debug;

use super::{BoxedSocket, DiscoveredPeer, DiscoveryEvent, Medium};
use crate::config::MAX_CONCURRENT_ACCEPTS;
use crate::error::MediumError;
use crate::ids::EndpointId;

const DIAL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SOCKET_BUFFER_BYTES: usize = 256 * 1024;

/// In-process medium fabric.
///
/// Stands in for the OS radio drivers: advertisers register a service entry
/// per `(medium, service name)`, dialers get one half of an in-memory duplex
/// pipe, and discovery watchers receive found/lost events. Two peers built
/// over the same hub share a radio space, which is how the integration suites
/// wire both sides of a connection.
#[derive(Debug, Default)]
pub struct MediumHub {
    inner: Mutex<HubState>,
}

#[derive(Debug, Default)]
struct HubState {
    services: HashMap<(Medium, String), ServiceEntry>,
    watchers: Vec<WatcherEntry>,
    next_watcher_id: u64,
}

#[derive(Debug)]
struct ServiceEntry {
    endpoint_id: EndpointId,
    endpoint_info: Vec<u8>,
    password: Option<String>,
    discoverable: bool,
    inbound: mpsc::Sender<BoxedSocket>,
}

#[derive(Debug)]
struct WatcherEntry {
    id: u64,
    medium: Medium,
    service_name: Option<String>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl WatcherEntry {
    fn matches(&self, medium: Medium, service_name: &str) -> bool {
        self.medium == medium
            && self
                .service_name
                .as_deref()
                .is_none_or(|filter| filter == service_name)
    }
}

impl MediumHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a service and starts accepting inbound sockets on it.
    ///
    /// # Errors
    ///
    /// Returns an error when the `(medium, service name)` slot is taken.
    pub fn advertise(
        self: &Arc<Self>,
        medium: Medium,
        service_name: &str,
        endpoint_id: EndpointId,
        endpoint_info: Vec<u8>,
        password: Option<String>,
        discoverable: bool,
    ) -> Result<AdvertisedService, MediumError> {
        let (inbound_tx, inbound_rx) = mpsc::channel(MAX_CONCURRENT_ACCEPTS);
        let mut inner = self.inner.lock().expect("hub state poisoned");
        let key = (medium, service_name.to_owned());
        if inner.services.contains_key(&key) {
            return Err(MediumError::AlreadyListening {
                service_name: service_name.to_owned(),
            });
        }

        if discoverable {
            let peer = DiscoveredPeer {
                endpoint_id: endpoint_id.clone(),
                service_name: service_name.to_owned(),
                endpoint_info: endpoint_info.clone(),
                medium,
            };
            inner
                .watchers
                .retain(|watcher| !watcher.events.is_closed());
            for watcher in &inner.watchers {
                if watcher.matches(medium, service_name) {
                    let _ = watcher.events.send(DiscoveryEvent::Found(peer.clone()));
                }
            }
        }

        inner.services.insert(
            key,
            ServiceEntry {
                endpoint_id,
                endpoint_info,
                password,
                discoverable,
                inbound: inbound_tx,
            },
        );
        debug!(%medium, service_name, "hub service registered");

        Ok(AdvertisedService {
            hub: Arc::clone(self),
            medium,
            service_name: service_name.to_owned(),
            inbound: inbound_rx,
        })
    }

    /// Opens a discovery session for `medium`, optionally scoped to one
    /// service name. Already-registered discoverable services are replayed as
    /// found events.
    #[must_use]
    pub fn discover(
        self: &Arc<Self>,
        medium: Medium,
        service_name: Option<String>,
    ) -> DiscoverySession {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("hub state poisoned");
        let watcher = WatcherEntry {
            id: inner.next_watcher_id,
            medium,
            service_name,
            events: events_tx,
        };
        inner.next_watcher_id += 1;

        for ((entry_medium, entry_name), entry) in &inner.services {
            if entry.discoverable && watcher.matches(*entry_medium, entry_name) {
                let _ = watcher.events.send(DiscoveryEvent::Found(DiscoveredPeer {
                    endpoint_id: entry.endpoint_id.clone(),
                    service_name: entry_name.clone(),
                    endpoint_info: entry.endpoint_info.clone(),
                    medium: *entry_medium,
                }));
            }
        }

        let id = watcher.id;
        inner.watchers.push(watcher);
        DiscoverySession {
            hub: Arc::clone(self),
            id,
            events: events_rx,
        }
    }

    /// Dials a registered service and returns the dialer's socket half.
    ///
    /// # Errors
    ///
    /// Returns an error when the service is unknown, the password does not
    /// match, or the listener's accept backlog is full or gone.
    pub fn dial(
        &self,
        medium: Medium,
        service_name: &str,
        password: Option<&str>,
    ) -> Result<BoxedSocket, MediumError> {
        let inner = self.inner.lock().expect("hub state poisoned");
        let entry = inner
            .services
            .get(&(medium, service_name.to_owned()))
            .ok_or_else(|| MediumError::ServiceNotFound {
                service_name: service_name.to_owned(),
            })?;

        if entry.password.as_deref() != password {
            return Err(MediumError::BadCredentials);
        }

        let (near, far) = tokio::io::duplex(SOCKET_BUFFER_BYTES);
        entry
            .inbound
            .try_send(Box::new(far))
            .map_err(|_backlog| MediumError::Refused)?;
        Ok(Box::new(near))
    }

    /// Dials a service that may not be registered yet, polling until
    /// `deadline`.
    ///
    /// # Errors
    ///
    /// Returns `ServiceNotFound` when the deadline elapses first, or any dial
    /// error other than the service being absent.
    pub async fn dial_by_deadline(
        &self,
        medium: Medium,
        service_name: &str,
        password: Option<&str>,
        deadline: Instant,
    ) -> Result<BoxedSocket, MediumError> {
        loop {
            match self.dial(medium, service_name, password) {
                Err(MediumError::ServiceNotFound { .. }) if Instant::now() < deadline => {
                    sleep(DIAL_POLL_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    fn unregister(&self, medium: Medium, service_name: &str) {
        let mut inner = self.inner.lock().expect("hub state poisoned");
        let Some(entry) = inner.services.remove(&(medium, service_name.to_owned())) else {
            return;
        };
        if entry.discoverable {
            for watcher in &inner.watchers {
                if watcher.matches(medium, service_name) {
                    let _ = watcher.events.send(DiscoveryEvent::Lost {
                        endpoint_id: entry.endpoint_id.clone(),
                    });
                }
            }
        }
        debug!(%medium, service_name, "hub service unregistered");
    }

    fn remove_watcher(&self, id: u64) {
        let mut inner = self.inner.lock().expect("hub state poisoned");
        inner.watchers.retain(|watcher| watcher.id != id);
    }
}

/// Live service registration; dropping it unregisters the service.
#[derive(Debug)]
pub struct AdvertisedService {
    hub: Arc<MediumHub>,
    medium: Medium,
    service_name: String,
    inbound: mpsc::Receiver<BoxedSocket>,
}

impl AdvertisedService {
    /// Waits for the next inbound socket.
    pub async fn next_inbound(&mut self) -> Option<BoxedSocket> {
        self.inbound.recv().await
    }

    /// Returns the registered service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl Drop for AdvertisedService {
    fn drop(&mut self) {
        self.hub.unregister(self.medium, &self.service_name);
    }
}

/// Live discovery session; dropping it stops event delivery.
#[derive(Debug)]
pub struct DiscoverySession {
    hub: Arc<MediumHub>,
    id: u64,
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

impl DiscoverySession {
    /// Waits for the next discovery event.
    pub async fn next_event(&mut self) -> Option<DiscoveryEvent> {
        self.events.recv().await
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.hub.remove_watcher(self.id);
    }
}
