//! Custom error types for the crate.
//!
//! This module defines the primary error type, `BenchError`, for the entire
//! system. Using the `thiserror` crate, it provides a centralized and
//! consistent way to distinguish the three classes of failure a caller can
//! see: "your request was invalid" (`UnknownDevice`, `UnknownStream`,
//! `LeaseNotFound`, `NotOwned`), "the device rejected the operation"
//! (`Driver`), and "the system could not communicate" (`Io`, `Protocol`,
//! `ConnectionClosed`). A transport failure is never reported where a
//! semantic error applies.
//!
//! Error scope:
//!
//! - `Structure` is fatal at tree construction time and never occurs later.
//! - `UnknownCapability` is recoverable: reconstruction skips the record and
//!   warns.
//! - Per-call errors (`UnknownDevice`, `UnknownStream`, `Driver`) and
//!   per-tunnel errors (`Tunnel`) never take down the owning connection.
//! - `Shutdown` aggregates teardown failures so one failed release never
//!   abandons sibling cleanup.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Malformed driver tree: {0}")]
    Structure(String),

    #[error("Unknown capability tag: {0}")]
    UnknownCapability(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Device {device} exports no stream named '{stream}'")]
    UnknownStream { device: String, stream: String },

    #[error("Driver error on device {device} method '{method}': {message}")]
    Driver {
        device: String,
        method: String,
        message: String,
    },

    #[error("Tunnel error on stream {stream_id}: {message}")]
    Tunnel { stream_id: u64, message: String },

    #[error("No exporter matches the requested labels")]
    NoMatch,

    #[error("Lease not found: {0}")]
    LeaseNotFound(String),

    #[error("Lease {0} is owned by another client")]
    NotOwned(String),

    #[error("Operation timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("Shutdown failed with errors")]
    Shutdown(Vec<BenchError>),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BenchError {
    /// Whether the caller may keep using the same connection after this
    /// error. Only structural and transport failures are fatal.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            BenchError::Structure(_)
                | BenchError::Io(_)
                | BenchError::Protocol(_)
                | BenchError::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_call_errors_are_recoverable() {
        assert!(BenchError::UnknownDevice("dead-beef".into()).is_recoverable());
        assert!(BenchError::Driver {
            device: "d".into(),
            method: "on".into(),
            message: "relay stuck".into(),
        }
        .is_recoverable());
        assert!(BenchError::NoMatch.is_recoverable());
    }

    #[test]
    fn transport_and_structure_errors_are_fatal() {
        assert!(!BenchError::Structure("duplicate uuid".into()).is_recoverable());
        assert!(!BenchError::ConnectionClosed.is_recoverable());
        assert!(!BenchError::Protocol("short frame".into()).is_recoverable());
    }
}
