//! Error types for the convey upload system.
//!
//! Local failures are represented by [`UploadError`]; failures that travel
//! over the wire are `(code, msg)` pairs whose known values are listed in
//! [`ErrorCode`].

use std::io;
use thiserror::Error;

/// Well-known wire error codes.
///
/// The `error` message carries an arbitrary `u32`; these are the values
/// both endpoints produce. Unknown codes are passed through to the user
/// verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Protocol violation; fatal to the session.
    MalformedFrame = 400,
    /// The transport rejected the peer.
    Unauthorized = 401,
    /// The metadata validator said no; fatal to the upload.
    MetadataRejected = 403,
    /// Peer unresponsive.
    Timeout = 408,
    /// Duplicate active upload or conflicting filename.
    Conflict = 409,
    /// Chunk exceeds the negotiated chunk size.
    ChunkTooLarge = 413,
    /// Final SHA-256 did not match.
    ChecksumMismatch = 422,
    /// Peer cancelled.
    Cancelled = 499,
    /// Storage or resource failure on the server.
    Internal = 500,
    /// Advisory; the message carries a retry hint.
    NoCapacity = 503,
}

impl ErrorCode {
    /// The numeric value sent on the wire.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Maps a wire value back to a known code, if any.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            400 => Some(Self::MalformedFrame),
            401 => Some(Self::Unauthorized),
            403 => Some(Self::MetadataRejected),
            408 => Some(Self::Timeout),
            409 => Some(Self::Conflict),
            413 => Some(Self::ChunkTooLarge),
            422 => Some(Self::ChecksumMismatch),
            499 => Some(Self::Cancelled),
            500 => Some(Self::Internal),
            503 => Some(Self::NoCapacity),
            _ => None,
        }
    }
}

/// Errors that can occur while uploading or serving uploads.
#[derive(Debug, Error)]
pub enum UploadError {
    /// An I/O error during file or network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize JSON data.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to serialize data to TOML format.
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// Failed to deserialize data from TOML format.
    #[error("TOML deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    /// A malformed or unexpected wire message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote peer reported an error.
    #[error("Remote error {code}: {msg}")]
    Remote { code: u32, msg: String },

    /// The server requested a retransmit from before the retention window.
    #[error("Retention exhausted: server asked for seek {wanted}, ring starts at {low_water}")]
    RetentionExhausted { wanted: u64, low_water: u64 },

    /// The peer did not respond within the retry budget.
    #[error("Timed out waiting for the server")]
    Timeout,

    /// The transport rejected our credentials during the handshake.
    #[error("Unauthorized: server rejected the client key")]
    Unauthorized,

    /// The upload was cancelled.
    #[error("Upload cancelled")]
    Cancelled,

    /// A filename that violates the server's naming rules.
    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    /// A cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl UploadError {
    /// Process exit code for the client front end.
    ///
    /// 0 success, 1 local I/O, 2 usage, 3 validation rejected,
    /// 4 checksum mismatch, 5 timeout/transport, 6 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            UploadError::Io(_) => 1,
            UploadError::Config(_) => 2,
            UploadError::InvalidFilename(_) => 2,
            UploadError::Remote { code: 403, .. } => 3,
            UploadError::Remote { code: 422, .. } => 4,
            UploadError::Cancelled | UploadError::Remote { code: 499, .. } => 6,
            _ => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in [
            ErrorCode::MalformedFrame,
            ErrorCode::Unauthorized,
            ErrorCode::MetadataRejected,
            ErrorCode::Timeout,
            ErrorCode::Conflict,
            ErrorCode::ChunkTooLarge,
            ErrorCode::ChecksumMismatch,
            ErrorCode::Cancelled,
            ErrorCode::Internal,
            ErrorCode::NoCapacity,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(999), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: UploadError = io_error.into();
        assert!(matches!(err, UploadError::Io(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_exit_codes() {
        let rejected = UploadError::Remote {
            code: 403,
            msg: "missing field".into(),
        };
        assert_eq!(rejected.exit_code(), 3);

        let mismatch = UploadError::Remote {
            code: 422,
            msg: "checksum-mismatch".into(),
        };
        assert_eq!(mismatch.exit_code(), 4);

        assert_eq!(UploadError::Timeout.exit_code(), 5);
        assert_eq!(UploadError::Cancelled.exit_code(), 6);
        assert_eq!(
            UploadError::RetentionExhausted {
                wanted: 0,
                low_water: 4
            }
            .exit_code(),
            5
        );
    }

    #[test]
    fn test_remote_error_display() {
        let err = UploadError::Remote {
            code: 503,
            msg: "no capacity, retry in 60s".into(),
        };
        let text = err.to_string();
        assert!(text.contains("503"));
        assert!(text.contains("retry in 60s"));
    }
}
