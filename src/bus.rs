//! Named channels sharing one registry per name.

use crate::error::{BusError, Result};
use crate::subscriptions::{RegistryConfig, SubscriptionRegistry};
use parking_lot::RwLock;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Type-erased registry stored under a channel name.
struct Channel {
    registry: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Channel {
    fn new<T: Send + Sync + 'static>(config: RegistryConfig) -> Self {
        Self {
            registry: Arc::new(SubscriptionRegistry::<T>::with_config(config)),
            type_name: type_name::<T>(),
        }
    }

    fn downcast<T: Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<SubscriptionRegistry<T>>> {
        Arc::clone(&self.registry)
            .downcast::<SubscriptionRegistry<T>>()
            .map_err(|_| BusError::ChannelTypeMismatch {
                channel: name.to_string(),
                registered: self.type_name,
                requested: type_name::<T>(),
            })
    }
}

/// Directory of named registries.
///
/// Every caller asking for the same channel name gets the same registry,
/// so publishers and subscribers only need to agree on the name and type.
pub struct LiveBus {
    channels: RwLock<HashMap<String, Channel>>,
    /// Config applied to channels created by this bus.
    config: RegistryConfig,
}

impl LiveBus {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get the registry for a channel, creating it on first use.
    ///
    /// Fails if the channel already exists with a different value type.
    pub fn channel<T: Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<SubscriptionRegistry<T>>> {
        if let Some(channel) = self.channels.read().get(name) {
            return channel.downcast(name);
        }

        let mut channels = self.channels.write();
        let channel = channels.entry(name.to_string()).or_insert_with(|| {
            debug!(channel = name, value_type = type_name::<T>(), "channel created");
            Channel::new::<T>(self.config.clone())
        });
        channel.downcast(name)
    }

    /// Drop a channel from the bus. Existing handles to its registry keep working.
    pub fn remove_channel(&self, name: &str) -> bool {
        let removed = self.channels.write().remove(name).is_some();
        if removed {
            debug!(channel = name, "channel removed");
        }
        removed
    }

    pub fn contains_channel(&self, name: &str) -> bool {
        self.channels.read().contains_key(name)
    }

    /// Names of all channels, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

impl Default for LiveBus {
    fn default() -> Self {
        Self::new()
    }
}
