//! Keygate Core Library
//!
//! Gates SSH key use and commit/tag signing behind a vault unlock state:
//! - Socket location and the canonical `SSH_AUTH_SOCK` link
//! - Agent supervision (native linking, managed spawn, restart, purge)
//! - Session freshness and the interactive unlock flow
//! - Command interception for the VCS front-end
//! - Read-only status reporting
//!
//! The binary entry point is in `main.rs`.

pub mod agent;
pub mod config;
pub mod exit_codes;
pub mod fsutil;
pub mod gate;
pub mod intercept;
pub mod logging;
pub mod poll;
pub mod prompt;
pub mod session;
pub mod shutdown;
pub mod status;
pub mod vault;

// Re-export test utilities for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
