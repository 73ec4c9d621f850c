//! Error types for the broadcaster.

use crate::types::{SubscriberId, Version};
use std::fmt;
use thiserror::Error;

/// Main error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Version counter exhausted at {version}")]
    VersionOverflow { version: Version },

    #[error("Delivery failed: {0}")]
    DeliveryFailed(DeliveryReport),

    #[error("Channel {channel:?} carries {registered}, requested as {requested}")]
    ChannelTypeMismatch {
        channel: String,
        registered: &'static str,
        requested: &'static str,
    },

    #[error("Subscriber id {0} is in the range reserved for channel subscribers")]
    ReservedSubscriberId(SubscriberId),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Config(e.to_string())
    }
}

/// Why a single subscriber callback failed to take a delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Channel subscriber's buffer is full (slow consumer).
    #[error("subscriber buffer full")]
    BufferFull,

    /// Channel subscriber's receiver was dropped.
    #[error("subscriber disconnected")]
    Disconnected,

    /// Callback panicked; carries the panic message.
    #[error("subscriber panicked: {0}")]
    Panicked(String),

    /// Callback returned its own error.
    #[error("subscriber callback failed: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DeliveryError {
    /// Wrap an arbitrary callback error.
    pub fn callback(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        DeliveryError::Callback(err.into())
    }
}

/// One subscriber that failed during a delivery pass.
#[derive(Debug)]
pub struct SubscriberFailure {
    pub id: SubscriberId,
    pub error: DeliveryError,
}

/// Aggregate of every callback failure from one publish or replay.
///
/// Delivery to the remaining subscribers always completes before the
/// report is handed back.
#[derive(Debug)]
pub struct DeliveryReport {
    /// Version the failing pass was delivering.
    pub version: Version,
    pub failures: Vec<SubscriberFailure>,
}

impl DeliveryReport {
    /// Ids of every subscriber that failed.
    pub fn failed_ids(&self) -> Vec<SubscriberId> {
        self.failures.iter().map(|f| f.id).collect()
    }

    /// Failure for a specific subscriber, if it failed.
    pub fn failure_for(&self, id: SubscriberId) -> Option<&DeliveryError> {
        self.failures.iter().find(|f| f.id == id).map(|f| &f.error)
    }
}

impl fmt::Display for DeliveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} subscriber(s) failed at {}:",
            self.failures.len(),
            self.version
        )?;
        for failure in &self.failures {
            write!(f, " [{}: {}]", failure.id, failure.error)?;
        }
        Ok(())
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
