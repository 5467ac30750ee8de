//! Keygate common types and errors.
//!
//! This crate provides foundational types shared across kg-core modules:
//! - The unified error taxonomy for the supervisor, gatekeeper and interceptor
//! - Output format specifications for operator commands

pub mod error;
pub mod output;

pub use error::{Error, ErrorCategory, Result, SuggestedAction};
pub use output::OutputFormat;
