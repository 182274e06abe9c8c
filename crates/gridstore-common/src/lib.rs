//! GridStore Common - Shared types and utilities
//!
//! This crate provides the identifiers, error taxonomy, configuration and
//! small binary codec helpers used across all GridStore components.

pub mod codec;
pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
