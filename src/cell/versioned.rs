//! Versioned cell holding the most recently published value.

use crate::error::{BusError, Result};
use crate::types::Version;

/// Holds the latest value and a monotonic publish counter.
///
/// `version` is zero exactly when no value has been published.
#[derive(Debug)]
pub struct VersionedCell<T> {
    value: Option<T>,
    version: Version,
}

impl<T> VersionedCell<T> {
    /// Create an empty cell at version zero.
    pub fn new() -> Self {
        Self {
            value: None,
            version: Version::ZERO,
        }
    }

    /// Store a new value and bump the version by one.
    ///
    /// Publishing is unconditional: an equal value still bumps the version.
    /// On overflow the cell is left untouched.
    pub fn publish(&mut self, value: T) -> Result<Version> {
        let next = self.version.next().ok_or(BusError::VersionOverflow {
            version: self.version,
        })?;
        self.value = Some(value);
        self.version = next;
        Ok(next)
    }

    /// Current value (if any) and version.
    pub fn snapshot(&self) -> (Option<&T>, Version) {
        (self.value.as_ref(), self.version)
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Whether a subscriber whose cursor sits at `cursor` is owed a delivery.
    pub fn is_delivery_due(&self, cursor: Version) -> bool {
        cursor < self.version
    }

    #[cfg(test)]
    pub(crate) fn at_version(value: T, version: Version) -> Self {
        assert!(!version.is_zero());
        Self {
            value: Some(value),
            version,
        }
    }
}

impl<T> Default for VersionedCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
