//! History storage abstraction and implementations for Runway.
//!
//! This crate provides a trait-based history store with a JSON-file reference
//! implementation and an in-memory implementation for tests.

#![warn(missing_docs)]

pub mod trait_;
pub mod json_storage;
pub mod memory;

pub use trait_::{HistoryStore, StorageError, Result};
pub use json_storage::JsonHistoryStore;
pub use memory::InMemoryHistoryStore;
