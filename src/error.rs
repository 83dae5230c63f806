//! Error types for the tunnel and the emulated TCP layer.

use std::io;

use thiserror::Error;

use crate::tcp::TcpState;

/// Failures while reading, writing or routing ESP traffic.
///
/// None of these are ever reported back to the remote peer: an inbound
/// datagram that fails any check is logged and dropped.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("ESP packet truncated: {0} bytes")]
    Truncated(usize),

    #[error("SPI mismatch: expected {expected:08x}, got {actual:08x}")]
    SpiMismatch { expected: u32, actual: u32 },

    #[error("stale ESP sequence: expected at least {expected}, got {actual}")]
    StaleSequence { expected: u64, actual: u32 },

    #[error("ESP integrity check failed")]
    ChecksumFailure,

    #[error("ESP encryption failed: {0}")]
    Encrypt(&'static str),

    #[error("ESP decryption failed: {0}")]
    Decrypt(&'static str),

    #[error("ESP delivered unsupported payload type {0}")]
    UnsupportedPayload(u8),

    #[error("malformed {0}")]
    Malformed(&'static str),

    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl TunnelError {
    /// Integrity failures: the datagram did not come from our peer, or
    /// arrived out of order.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            TunnelError::SpiMismatch { .. }
                | TunnelError::StaleSequence { .. }
                | TunnelError::ChecksumFailure
        )
    }
}

/// Failures inside one emulated TCP flow.
#[derive(Debug, Error)]
pub enum TcpError {
    /// The remote sent a flag combination that the current state does not
    /// accept.
    #[error("invalid flags {flags:#04x} in state {state:?}")]
    UnexpectedFlags { state: TcpState, flags: u8 },

    /// Traffic reached a connection that is already closed. The session
    /// table should never route packets here.
    #[error("tried to communicate with a closed connection")]
    ClosedConnection,

    #[error("invalid state: expected {expected:?}, got {actual:?}")]
    InvalidState { expected: TcpState, actual: TcpState },

    #[error("TCP payload did not parse")]
    Malformed,

    #[error("local connection error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to send reply: {0}")]
    Tunnel(#[from] TunnelError),
}

impl TcpError {
    /// Whether this error should abort the connection when raised before
    /// the handshake completes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TcpError::UnexpectedFlags { .. } | TcpError::Malformed | TcpError::ClosedConnection
        )
    }

    /// Session-table bookkeeping bug rather than a remote-input condition.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            TcpError::ClosedConnection | TcpError::InvalidState { .. }
        )
    }
}

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;
