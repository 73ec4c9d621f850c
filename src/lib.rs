//! # LiveBus
//!
//! A versioned, single-slot event broadcaster. It holds the latest value of
//! a type, notifies subscribers when it changes, and lets the owner decide
//! per subscriber whether attaching replays the current value.
//!
//! ## Core Concepts
//!
//! - **Cell**: the latest value plus a publish counter (its version)
//! - **Cursor**: per-subscriber record of the last version delivered
//! - **Registry**: delivers to every subscriber whose cursor lags the cell
//! - **Bus**: named channels, one registry per name
//!
//! ## Example
//!
//! ```ignore
//! use livebus::{AttachMode, LiveBus, SubscriberId};
//!
//! let bus = LiveBus::new();
//! let status = bus.channel::<String>("status")?;
//!
//! status.publish("online".to_string())?;
//!
//! // Sticky subscriber: gets "online" right away.
//! status.attach(SubscriberId(1), AttachMode::ReplayCurrent, |s: &String| {
//!     println!("status is {s}");
//!     Ok(())
//! })?;
//!
//! // Event subscriber: waits for the next publish.
//! let events = status.subscribe_channel(AttachMode::SkipToLatest)?;
//! ```

pub mod bus;
pub mod cell;
pub mod error;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use bus::LiveBus;
pub use cell::VersionedCell;
pub use error::{BusError, DeliveryError, DeliveryReport, Result, SubscriberFailure};
pub use subscriptions::{
    Callback, RegistryConfig, SubscriptionGuard, SubscriptionHandle, SubscriptionRegistry,
};
pub use types::*;
