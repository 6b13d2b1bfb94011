//! Core of lcm: error taxonomy, shared types, and the configuration resolver.
//!
//! Everything here is backend-agnostic; provider adapters live in
//! `lcm-providers` and the facade in `lcm`.

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use error::{ErrorKind, LcmError, Result};
pub use types::{HealthStatus, Message, Prompt};
