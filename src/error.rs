//! Error types for the DC-net round protocol.

use std::io;

use thiserror::Error;

/// Errors surfaced by the library.
///
/// Transport failures are fatal to a round: once any link drops, the remaining pads can no
/// longer cancel, so the round is aborted rather than resumed.
#[derive(Error, Debug)]
pub enum DcNetError {
    /// A connection could not be established, was reset, or returned a short read.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A peer server announced an id that does not fit the mesh.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A configuration value cannot be used; raised before any network I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The configuration source could not be read or deserialized.
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DcNetError>;
