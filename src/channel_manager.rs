use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::analytics::DisconnectionReason;
use crate::channel::EndpointChannel;
use crate::ids::EndpointId;

#[derive(Debug)]
struct EndpointEntry {
    channel: Arc<EndpointChannel>,
    safe_to_disconnect: watch::Sender<bool>,
    last_replacement: Option<Instant>,
}

/// Registry mapping endpoint ids to their currently active channel.
///
/// Exactly one channel per endpoint is active at any time. Handles returned
/// by [`Self::channel_for_endpoint`] stay valid across a concurrent
/// replacement: readers observe either the old or the new channel, never a
/// torn state.
#[derive(Debug, Default)]
pub struct EndpointChannelManager {
    inner: Mutex<HashMap<EndpointId, EndpointEntry>>,
}

impl EndpointChannelManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the initial channel for an endpoint.
    ///
    /// A still-registered prior channel is closed asynchronously with
    /// `LocalDisconnection`; registration itself never blocks on I/O.
    pub fn register_channel(&self, endpoint_id: EndpointId, channel: Arc<EndpointChannel>) {
        let previous = {
            let mut inner = self.inner.lock().expect("channel registry poisoned");
            let (safe_tx, _safe_rx) = watch::channel(false);
            inner
                .insert(
                    endpoint_id.clone(),
                    EndpointEntry {
                        channel,
                        safe_to_disconnect: safe_tx,
                        last_replacement: None,
                    },
                )
                .map(|entry| entry.channel)
        };
        if let Some(previous) = previous {
            warn!(%endpoint_id, "replacing a still-registered channel");
            tokio::spawn(async move {
                previous.close(DisconnectionReason::LocalDisconnection).await;
            });
        }
        debug!(%endpoint_id, "channel registered");
    }

    /// Returns a shared handle to the endpoint's active channel.
    #[must_use]
    pub fn channel_for_endpoint(&self, endpoint_id: &EndpointId) -> Option<Arc<EndpointChannel>> {
        self.inner
            .lock()
            .expect("channel registry poisoned")
            .get(endpoint_id)
            .map(|entry| Arc::clone(&entry.channel))
    }

    /// Atomically swaps the endpoint's channel.
    ///
    /// The predecessor is closed with `close_reason` before the successor
    /// becomes visible to readers. Unless `support_encryption_disabled` is
    /// set, the predecessor's encryption context is carried forward.
    ///
    /// Returns `false` when the endpoint is not registered.
    pub async fn replace_channel_for_endpoint(
        &self,
        endpoint_id: &EndpointId,
        new_channel: Arc<EndpointChannel>,
        support_encryption_disabled: bool,
        close_reason: DisconnectionReason,
    ) -> bool {
        let previous = {
            let inner = self.inner.lock().expect("channel registry poisoned");
            match inner.get(endpoint_id) {
                Some(entry) => Arc::clone(&entry.channel),
                None => return false,
            }
        };

        if !support_encryption_disabled
            && !new_channel.is_encrypted()
            && let Some(context) = previous.encryption_context()
        {
            new_channel.enable_encryption(context);
        }

        previous.close(close_reason).await;

        let mut inner = self.inner.lock().expect("channel registry poisoned");
        let Some(entry) = inner.get_mut(endpoint_id) else {
            return false;
        };
        entry.channel = new_channel;
        entry.last_replacement = Some(Instant::now());
        info!(
            %endpoint_id,
            medium = %entry.channel.medium(),
            %close_reason,
            "channel replaced"
        );
        true
    }

    /// Removes the endpoint's channel and closes it with `reason`.
    ///
    /// Returns `false` when the endpoint was not registered.
    pub async fn unregister_channel_for_endpoint(
        &self,
        endpoint_id: &EndpointId,
        reason: DisconnectionReason,
    ) -> bool {
        let entry = self
            .inner
            .lock()
            .expect("channel registry poisoned")
            .remove(endpoint_id);
        let Some(entry) = entry else {
            return false;
        };
        entry.channel.close(reason).await;
        debug!(%endpoint_id, %reason, "channel unregistered");
        true
    }

    /// Marks the endpoint safe to disconnect and wakes waiting teardowns.
    pub fn mark_safe_to_disconnect(&self, endpoint_id: &EndpointId) {
        let inner = self.inner.lock().expect("channel registry poisoned");
        if let Some(entry) = inner.get(endpoint_id) {
            let _ = entry.safe_to_disconnect.send(true);
        }
    }

    /// Waits until the endpoint is marked safe to disconnect.
    ///
    /// Returns `false` when the wait timed out or the endpoint is unknown.
    pub async fn wait_safe_to_disconnect(
        &self,
        endpoint_id: &EndpointId,
        timeout: Duration,
    ) -> bool {
        let mut receiver = {
            let inner = self.inner.lock().expect("channel registry poisoned");
            match inner.get(endpoint_id) {
                Some(entry) => entry.safe_to_disconnect.subscribe(),
                None => return false,
            }
        };
        tokio::time::timeout(timeout, receiver.wait_for(|safe| *safe))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    /// Returns whether this endpoint's channel was replaced within `window`.
    #[must_use]
    pub fn replaced_within(&self, endpoint_id: &EndpointId, window: Duration) -> bool {
        let inner = self.inner.lock().expect("channel registry poisoned");
        inner
            .get(endpoint_id)
            .and_then(|entry| entry.last_replacement)
            .is_some_and(|at| at.elapsed() < window)
    }

    /// Returns all registered endpoint ids.
    #[must_use]
    pub fn registered_endpoints(&self) -> Vec<EndpointId> {
        self.inner
            .lock()
            .expect("channel registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
