//! Sediment Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, and utilities
//! used across all Sediment components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, content_hash};
pub use config::StorageConfig;
pub use error::{Error, Result};
pub use types::*;
