//! Domain model for the item catalog and per-owner counts.
//!
//! # Responsibility
//! - Define canonical data structures used by the repository and services.
//!
//! # Invariants
//! - An item is identified by its external id; names are display data.
//! - An owner's counts are always handled as a whole snapshot.

pub mod item;
