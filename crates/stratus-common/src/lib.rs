//! # Stratus Common
//!
//! Shared types, errors, and constants used across Stratus components.
//!
//! ## Modules
//! - `types` - Wire message and membership types (ClusterMessage, Payload, etc.)
//! - `error` - Common error type
//! - `constants` - Shared timing, sizing and port defaults

pub mod constants;
pub mod error;
pub mod types;

pub use error::{Result, StratusError};
pub use types::*;
