//! Providers Module - Docker engine access and outbound notifications

pub mod docker;
pub mod webhook;

pub use docker::*;
pub use webhook::*;
