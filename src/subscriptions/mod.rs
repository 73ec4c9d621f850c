//! Subscription registry for live value updates.
//!
//! The registry wraps a [`VersionedCell`](crate::cell::VersionedCell) and
//! keeps one private cursor per subscriber. Subscribers attach in one of two
//! modes:
//! - `ReplayCurrent`: the value already in the cell is delivered on attach
//! - `SkipToLatest`: only values published after attach are delivered
//!
//! A pending replay can also be suppressed after the fact with
//! `force_cursor_to_latest`.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new();
//! registry.publish("ready".to_string())?;
//!
//! // Sees "ready" immediately.
//! registry.attach(SubscriberId(1), AttachMode::ReplayCurrent, |v: &String| {
//!     println!("replayed {v}");
//!     Ok(())
//! })?;
//!
//! // Sees nothing until the next publish.
//! let handle = registry.subscribe_channel(AttachMode::SkipToLatest)?;
//! registry.publish("next".to_string())?;
//! assert_eq!(*handle.recv()?, "next");
//! ```

mod registry;
mod types;

pub use registry::SubscriptionRegistry;
pub use types::{Callback, RegistryConfig, SubscriptionGuard, SubscriptionHandle};
