//! Error types for the cell codec and circuit state machine
//!
//! Errors are classified by how far the damage reaches:
//! - connection-fatal: the link to the relay cannot be trusted any more
//! - circuit-fatal: the circuit must be torn down, the link may survive
//! - retryable: a higher layer may try again (new circuit, new stream)

use thiserror::Error;

use crate::protocol::DestroyReason;

pub type Result<T> = std::result::Result<T, TorError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Framing errors (1xx)
    MalformedCell = 100,
    UnknownCommand = 101,

    // Circuit integrity errors (2xx)
    DigestMismatch = 200,
    UnknownStream = 201,
    HandshakeFailed = 202,

    // Circuit lifecycle errors (3xx)
    CircuitDestroyed = 300,
    InvalidState = 301,
    Timeout = 302,

    // Transport errors (4xx)
    SendFailed = 400,

    // Stream errors (5xx)
    StreamFailed = 500,

    // Cryptographic errors (6xx)
    CryptoError = 600,

    // Internal errors (9xx)
    InternalError = 900,
}

/// Main error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TorError {
    // ===== Framing Errors =====
    #[error("Malformed cell: {0}")]
    Malformed(String),

    #[error("Unknown cell command: {0}")]
    UnknownCommand(u8),

    // ===== Circuit Integrity Errors =====
    #[error("Digest mismatch in relay cell")]
    DigestMismatch,

    #[error("Relay data for unknown stream {0}")]
    UnknownStream(u16),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    // ===== Circuit Lifecycle Errors =====
    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    // ===== Transport Errors =====
    #[error("Guard failed to send cell")]
    SendFailed,

    // ===== Stream Errors =====
    #[error("Stream error: {0}")]
    Stream(String),

    // ===== Cryptographic Errors =====
    #[error("Crypto: {0}")]
    Crypto(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TorError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            TorError::Malformed(_) => ErrorCode::MalformedCell,
            TorError::UnknownCommand(_) => ErrorCode::UnknownCommand,

            TorError::DigestMismatch => ErrorCode::DigestMismatch,
            TorError::UnknownStream(_) => ErrorCode::UnknownStream,
            TorError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,

            TorError::CircuitDestroyed { .. } => ErrorCode::CircuitDestroyed,
            TorError::InvalidState(_) => ErrorCode::InvalidState,
            TorError::Timeout(_) => ErrorCode::Timeout,

            TorError::SendFailed => ErrorCode::SendFailed,

            TorError::Stream(_) => ErrorCode::StreamFailed,

            TorError::Crypto(_) => ErrorCode::CryptoError,

            TorError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the link to the relay must be closed.
    ///
    /// Framing faults mean we no longer know where the next cell starts, so
    /// nothing else on the connection can be trusted.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, TorError::Malformed(_) | TorError::UnknownCommand(_))
    }

    /// Whether the circuit the error was raised on must be torn down.
    pub fn is_circuit_fatal(&self) -> bool {
        self.is_connection_fatal()
            || matches!(
                self,
                TorError::DigestMismatch
                    | TorError::UnknownStream(_)
                    | TorError::HandshakeFailed(_)
                    | TorError::CircuitDestroyed { .. }
            )
    }

    /// Whether a higher layer can retry on a fresh circuit or stream
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::SendFailed
                | TorError::Timeout(_)
                | TorError::HandshakeFailed(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::Stream(_)
        )
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: DestroyReason) -> Self {
        TorError::CircuitDestroyed {
            reason: reason.code(),
            reason_name: reason.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_fatal_errors() {
        assert!(TorError::Malformed("short".into()).is_connection_fatal());
        assert!(TorError::UnknownCommand(200).is_connection_fatal());

        assert!(!TorError::DigestMismatch.is_connection_fatal());
        assert!(!TorError::SendFailed.is_connection_fatal());
    }

    #[test]
    fn test_circuit_fatal_errors() {
        assert!(TorError::DigestMismatch.is_circuit_fatal());
        assert!(TorError::UnknownStream(5).is_circuit_fatal());
        assert!(TorError::Malformed("x".into()).is_circuit_fatal());

        assert!(!TorError::SendFailed.is_circuit_fatal());
        assert!(!TorError::Timeout("CREATED_FAST".into()).is_circuit_fatal());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TorError::SendFailed.is_retryable());
        assert!(TorError::HandshakeFailed("kh".into()).is_retryable());

        assert!(!TorError::DigestMismatch.is_retryable());
        assert!(!TorError::UnknownCommand(1).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TorError::DigestMismatch.code(), ErrorCode::DigestMismatch);
        assert_eq!(TorError::UnknownStream(3).code(), ErrorCode::UnknownStream);
        assert_eq!(TorError::SendFailed.code(), ErrorCode::SendFailed);
    }

    #[test]
    fn test_circuit_destroyed() {
        let err = TorError::circuit_destroyed(DestroyReason::PROTOCOL);
        if let TorError::CircuitDestroyed {
            reason,
            reason_name,
        } = err
        {
            assert_eq!(reason, 1);
            assert_eq!(reason_name, "PROTOCOL");
        } else {
            panic!("Expected CircuitDestroyed");
        }
    }
}
