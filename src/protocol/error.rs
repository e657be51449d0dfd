use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable reason codes carried in ERROR acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    VersionMismatch,
    BadMagic,
    Malformed,
    Truncated,
    HashMismatch,
    PathRejected,
    TooLarge,
    IoError,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 8] = [
        Self::VersionMismatch,
        Self::BadMagic,
        Self::Malformed,
        Self::Truncated,
        Self::HashMismatch,
        Self::PathRejected,
        Self::TooLarge,
        Self::IoError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VersionMismatch => "version_mismatch",
            Self::BadMagic => "bad_magic",
            Self::Malformed => "malformed",
            Self::Truncated => "truncated",
            Self::HashMismatch => "hash_mismatch",
            Self::PathRejected => "path_rejected",
            Self::TooLarge => "too_large",
            Self::IoError => "io_error",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can go wrong while speaking the sync protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Protocol version mismatch: expected {expected}, peer speaks {found}")]
    VersionMismatch { expected: u16, found: u16 },

    #[error("Peer did not send the LSYN handshake")]
    BadMagic,

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Stream ended in the middle of a frame")]
    Truncated,

    #[error("Content hash mismatch for {path}")]
    HashMismatch { path: String },

    #[error("Refusing to write outside the target root: {path}")]
    PathRejected { path: String },

    #[error("{what} of {size} exceeds the limit of {limit}")]
    TooLarge {
        what: &'static str,
        size: u64,
        limit: u64,
    },

    #[error("Peer rejected the directive: {0}")]
    Rejected(ReasonCode),

    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl ProtocolError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::Malformed(detail.into())
    }

    /// Reason code reported to the peer (or received from it).
    pub fn reason(&self) -> ReasonCode {
        match self {
            Self::VersionMismatch { .. } => ReasonCode::VersionMismatch,
            Self::BadMagic => ReasonCode::BadMagic,
            Self::Malformed(_) => ReasonCode::Malformed,
            Self::Truncated => ReasonCode::Truncated,
            Self::HashMismatch { .. } => ReasonCode::HashMismatch,
            Self::PathRejected { .. } => ReasonCode::PathRejected,
            Self::TooLarge { .. } => ReasonCode::TooLarge,
            Self::Rejected(code) => *code,
            Self::Io(_) => ReasonCode::IoError,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(error)
        }
    }
}
