//! Stream registry (C3, §4.3).
//!
//! Owns the set of live bidirectional sessions keyed by agent hostname.
//! Each registered entry is an outbound channel feeding the `Connect`
//! handler's response stream for that hostname; registering a second
//! stream for the same hostname replaces the first (single-owner,
//! §8 invariant 4) and the old channel is dropped, which ends the old
//! handler's forwarding loop.

use std::collections::HashMap;
use std::sync::Arc;

use cosmos_common::proto::ControllerMessage;
use cosmos_common::CosmosError;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

pub type OutboundSender = mpsc::Sender<ControllerMessage>;

/// Channel capacity for controller -> agent sends (§5 backpressure table
/// specifies 100 for agent-side channels; the controller side mirrors it
/// since both ends of one stream share the same flow-control budget).
pub const OUTBOUND_CAPACITY: usize = 100;

#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, OutboundSender>>,
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or replace) the stream owning `hostname`. Returns the
    /// receiving half the caller's `Connect` handler should forward into
    /// the gRPC response stream.
    pub async fn register(&self, hostname: &str) -> mpsc::Receiver<ControllerMessage> {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let mut streams = self.streams.write().await;
        if streams.insert(hostname.to_string(), tx).is_some() {
            debug!(hostname, "replacing existing stream registration");
        }
        rx
    }

    /// Deregister `hostname`, but only if the sender passed still matches
    /// the one currently on file — a stale deregister from a superseded
    /// stream must not evict a newer registration.
    pub async fn deregister(&self, hostname: &str, sender: &OutboundSender) {
        let mut streams = self.streams.write().await;
        if let Some(current) = streams.get(hostname) {
            if current.same_channel(sender) {
                streams.remove(hostname);
            }
        }
    }

    pub async fn get(&self, hostname: &str) -> Option<OutboundSender> {
        self.streams.read().await.get(hostname).cloned()
    }

    pub async fn list_connected(&self) -> Vec<String> {
        self.streams.read().await.keys().cloned().collect()
    }

    /// Best-effort send to one hostname; fails with `NoStream` when the
    /// hostname is not currently registered (§4.3 "Send semantics").
    pub async fn send(&self, hostname: &str, message: ControllerMessage) -> Result<(), CosmosError> {
        let sender = self.get(hostname).await.ok_or_else(|| CosmosError::NoStream(hostname.to_string()))?;
        sender
            .send_timeout(message, std::time::Duration::from_secs(1))
            .await
            .map_err(|_| CosmosError::SendTimeout)
    }

    /// Best-effort broadcast; returns the hostnames that had no live
    /// stream so the caller can log per-node failures without aborting.
    pub async fn broadcast(&self, hostnames: &[String], message: ControllerMessage) -> Vec<String> {
        let mut failures = Vec::new();
        for hostname in hostnames {
            if let Err(err) = self.send(hostname, message.clone()).await {
                debug!(hostname, %err, "broadcast send failed");
                failures.push(hostname.clone());
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_registration_replaces_first() {
        let registry = StreamRegistry::new();
        let _rx1 = registry.register("host-a").await;
        let first = registry.get("host-a").await.unwrap();
        let _rx2 = registry.register("host-a").await;
        let second = registry.get("host-a").await.unwrap();
        assert!(!first.same_channel(&second));
    }

    #[tokio::test]
    async fn deregister_is_noop_if_superseded() {
        let registry = StreamRegistry::new();
        let _rx1 = registry.register("host-a").await;
        let first = registry.get("host-a").await.unwrap();
        let _rx2 = registry.register("host-a").await;

        registry.deregister("host-a", &first).await;
        assert!(registry.get("host-a").await.is_some());
    }

    #[tokio::test]
    async fn send_without_registration_fails() {
        let registry = StreamRegistry::new();
        let err = registry
            .send("ghost", ControllerMessage { payload: None })
            .await
            .unwrap_err();
        assert!(matches!(err, CosmosError::NoStream(_)));
    }
}
