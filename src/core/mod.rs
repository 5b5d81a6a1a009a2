//! Core Module - matching and deployment logic

pub mod deployer;
pub mod matcher;

pub use deployer::*;
pub use matcher::*;
