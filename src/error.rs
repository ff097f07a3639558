//! Error types for the onion-routing engine
//!
//! One crate-wide error enum with classification helpers:
//! - fatal errors abort the affected circuit/connection and are never retried
//! - retryable errors feed the circuit builder's rebuild loop

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Main error type for the circuit engine
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Protocol violations (fatal to the circuit/connection) =====
    #[error("cell truncated")]
    CellTruncated,

    #[error("unknown cell command: {0}")]
    UnknownCommand(u8),

    #[error("unknown relay command: {0}")]
    UnknownRelayCommand(u8),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("relay cell decryption failed: no hop recognized the cell")]
    RelayDecryptionFailed,

    #[error("unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    // ===== Handshake =====
    #[error("key derivation mismatch: KH confirmation failed")]
    KeyDerivationMismatch,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // ===== Timeouts =====
    #[error("timed out waiting for {0}")]
    Timeout(String),

    // ===== Queue =====
    #[error("queue closed")]
    QueueClosed,

    // ===== Circuit =====
    #[error("circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed {
        reason: u8,
        reason_name: &'static str,
    },

    #[error("circuit closed: {0}")]
    CircuitClosed(String),

    #[error("circuit not yet closeable: {0} streams still active")]
    NotCloseable(usize),

    // ===== Stream =====
    #[error("stream error: {0}")]
    Stream(String),

    #[error("stream ended: reason={0}")]
    StreamEnded(u8),

    // ===== Resources =====
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("no route available: {0}")]
    NoRoute(String),

    // ===== Transport =====
    #[error("transport error: {0}")]
    Transport(String),
}

impl TorError {
    /// Whether this error must abort the affected circuit outright.
    ///
    /// Cryptographic and framing failures are never downgraded: a digest
    /// mismatch means the forward/backward digest chains have diverged and
    /// the circuit cannot be recovered without a full rebuild.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorError::CellTruncated
                | TorError::UnknownCommand(_)
                | TorError::UnknownRelayCommand(_)
                | TorError::ProtocolViolation(_)
                | TorError::RelayDecryptionFailed
                | TorError::KeyDerivationMismatch
        )
    }

    /// Whether the circuit builder may retry after this error with a
    /// rebuilt route.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::Timeout(_)
                | TorError::HandshakeFailed(_)
                | TorError::CircuitBuildFailed(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::Transport(_)
                | TorError::UnexpectedCell { .. }
        )
    }

    /// Create a CircuitDestroyed error carrying the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        let reason_name = match reason {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        };

        TorError::CircuitDestroyed {
            reason,
            reason_name,
        }
    }
}
