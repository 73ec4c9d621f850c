//! Subscription types for the registry.

use crate::error::{BusError, DeliveryError, Result};
use crate::types::{AttachMode, SubscriberId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::registry::SubscriptionRegistry;

/// Callback invoked with each delivered value.
pub type Callback<T> = Arc<dyn Fn(&T) -> std::result::Result<(), DeliveryError> + Send + Sync>;

/// Configuration for a registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Mode used by `observe` and by the bus when no mode is given.
    /// Default: skip_to_latest
    pub default_mode: AttachMode,

    /// Buffered values per channel subscriber before deliveries fail.
    /// Default: 64
    pub channel_buffer_size: usize,

    /// Turn panicking callbacks into delivery failures instead of unwinding
    /// through the publisher.
    /// Default: true
    pub catch_panics: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_mode: AttachMode::SkipToLatest,
            channel_buffer_size: 64,
            catch_panics: true,
        }
    }
}

impl RegistryConfig {
    /// Parse and validate a config from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_buffer_size == 0 {
            return Err(BusError::Config(
                "channel_buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Handle to a channel-backed subscription.
pub struct SubscriptionHandle<T> {
    pub id: SubscriberId,
    /// Channel to receive delivered values.
    pub receiver: crossbeam_channel::Receiver<Arc<T>>,
}

impl<T> SubscriptionHandle<T> {
    /// Receive the next value (blocking).
    pub fn recv(&self) -> std::result::Result<Arc<T>, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a value (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<Arc<T>, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> std::result::Result<Arc<T>, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain every value currently buffered.
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.receiver.try_iter().collect()
    }
}

/// Detaches its subscriber from the registry when dropped.
///
/// This stands in for a lifecycle owner: tie the guard to whatever scope
/// the subscriber should live for.
pub struct SubscriptionGuard<T> {
    registry: Option<Arc<SubscriptionRegistry<T>>>,
    id: SubscriberId,
}

impl<T> SubscriptionGuard<T> {
    pub(crate) fn new(registry: Arc<SubscriptionRegistry<T>>, id: SubscriberId) -> Self {
        Self {
            registry: Some(registry),
            id,
        }
    }

    /// Guard for a subscriber attached elsewhere; dropping it does nothing.
    pub(crate) fn unowned(id: SubscriberId) -> Self {
        Self { registry: None, id }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// False when the scoped attach found the id already present.
    pub fn owns_subscriber(&self) -> bool {
        self.registry.is_some()
    }

    /// Detach now instead of waiting for drop.
    pub fn detach(mut self) {
        if let Some(registry) = self.registry.take() {
            registry.detach(self.id);
        }
    }

    /// Give up the guard but leave the subscriber attached.
    pub fn release(mut self) -> SubscriberId {
        self.registry = None;
        self.id
    }
}

impl<T> Drop for SubscriptionGuard<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.detach(self.id);
        }
    }
}
