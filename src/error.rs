//! Error types
//!
//! Every fallible operation in the crate returns [`crate::Result`], whose
//! error side is the [`Error`] enum defined here.

use std::net::SocketAddrV4;

use thiserror::Error;

use crate::erasure::CodingScheme;

/// Errors raised by the stripe placement, coding and remapping layers
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration values that can never describe a working cluster
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A coding scheme cannot be built for the requested parameters
    #[error("unsupported {scheme} parameters: {reason}")]
    UnsupportedCoding {
        scheme: CodingScheme,
        reason: String,
    },

    /// A chunk buffer has the wrong length or the chunk count is off
    #[error("invalid chunk layout: {0}")]
    InvalidChunk(String),

    /// Parity indices are 1-based and bounded by the parity chunk count
    #[error("parity index {index} out of range 1..={parity_chunks}")]
    InvalidParityIndex { index: usize, parity_chunks: usize },

    /// More chunks are lost than the scheme can rebuild
    #[error("stripe unrecoverable: {failed} chunk(s) lost, tolerance is {tolerance}")]
    Unrecoverable { failed: usize, tolerance: usize },

    /// A stripe list needs at least `n` distinct nodes
    #[error("not enough nodes: {available} available, {required} required")]
    NotEnoughNodes { available: usize, required: usize },

    /// A pending table was addressed with a value type it does not hold
    #[error("pending table {0} does not hold this value type")]
    PendingType(String),

    /// A state message could not be encoded or decoded
    #[error("malformed state message: {0}")]
    Message(String),

    /// The group-communication bus rejected an operation
    #[error("group bus: {0}")]
    Bus(String),

    /// A server address is not known to the handler
    #[error("unknown server {0}")]
    UnknownServer(SocketAddrV4),

    #[error("server {0} is unavailable")]
    Unavailable(SocketAddrV4),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand used by coding constructors
    pub(crate) fn unsupported(scheme: CodingScheme, reason: impl Into<String>) -> Self {
        Error::UnsupportedCoding {
            scheme,
            reason: reason.into(),
        }
    }
}
