//! Utils Module - Helper Functions & Shared Utilities
//!
//! Constants and the retry/backoff helper shared by the Docker provider,
//! the deployer and the event watcher.

pub mod constants;
pub mod retry;

pub use constants::*;
pub use retry::*;
