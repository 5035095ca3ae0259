//! Error types for the address leasing protocol.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

/// Errors that can occur while running a leasing client or server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error (configuration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (configuration files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed protocol packet received.
    ///
    /// This includes frames that are truncated or oversized, carry an
    /// unknown parameter id, a parameter length outside its class, or a
    /// total length that disagrees with the header.
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Invalid client or server configuration.
    ///
    /// Returned by the `validate` methods on
    /// [`ClientConfig`](crate::ClientConfig) and
    /// [`ServerConfig`](crate::ServerConfig).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A specialized Result type for leasing protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
