//! Single-slot versioned value holder.
//!
//! A cell keeps only the latest published value together with a publish
//! counter. Every subscriber cursor in the registry is compared against
//! this counter to decide whether a delivery is owed.

mod versioned;

pub use versioned::VersionedCell;
