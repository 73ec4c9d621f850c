//! Core types shared by the cell, the registry and the bus.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Publish counter of a cell. Zero means nothing has been published yet.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(pub u64);

impl Version {
    pub const ZERO: Version = Version(0);

    /// The following version, or `None` once the counter is exhausted.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Version)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identity of a subscriber within a registry.
///
/// Uniqueness is by id, not by callback: attaching an id that is already
/// present is a no-op.
///
/// Ids with the top bit set belong to channel subscribers and are handed
/// out by the registry. Callback subscribers must use ids below
/// [`SubscriberId::RESERVED_BIT`]; `attach` rejects the rest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriberId {
    pub const RESERVED_BIT: u64 = 1 << 63;

    /// True for ids in the range the registry allocates from.
    pub fn is_reserved(self) -> bool {
        self.0 & Self::RESERVED_BIT != 0
    }

    /// Allocate a process-unique id from the reserved range.
    pub(crate) fn next_reserved() -> Self {
        let n = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        SubscriberId(Self::RESERVED_BIT | (n & !Self::RESERVED_BIT))
    }
}

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// How a newly attached subscriber treats the value already in the cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttachMode {
    /// Start the cursor at zero, so an existing value is delivered on attach.
    ReplayCurrent,
    /// Start the cursor at the current version; only later publishes are seen.
    #[default]
    SkipToLatest,
}

impl AttachMode {
    /// Initial cursor for a subscriber attaching while the cell is at `current`.
    pub fn initial_cursor(self, current: Version) -> Version {
        match self {
            AttachMode::ReplayCurrent => Version::ZERO,
            AttachMode::SkipToLatest => current,
        }
    }
}

/// Where a subscriber sits in its attach/deliver lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberState {
    /// Not present in the registry.
    Detached,
    /// Cursor equals the cell version; nothing owed.
    Current,
    /// Cursor lags the cell version; a delivery is owed.
    Pending,
}
