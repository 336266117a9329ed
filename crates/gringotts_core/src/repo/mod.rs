//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts.
//! - Isolate SQLite query details from service orchestration.
//!
//! # Invariants
//! - Every call runs in its own transaction scope, closed on every exit path.
//! - Point lookups report a missing row as `None`, never as an error or zero.

pub mod inventory_repo;
