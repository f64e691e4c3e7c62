//! Probe module: executes HTTP checks and records their outcome.

mod http;
mod runner;

pub use http::*;
pub use runner::*;

use thiserror::Error;

/// Why a probe classified its endpoint as down.
///
/// The `Display` form is the error description stored on the check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Timeout after {0}ms")]
    Timeout(u64),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Expected status {expected}, got {actual}")]
    UnexpectedStatus { expected: u16, actual: u16 },
    #[error("{0}")]
    Request(String),
}
