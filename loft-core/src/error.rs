//! Error taxonomy for transfers and the collaborator-facing transport error.

use std::fmt;

/// What a collaborator transport reports. Mapped into [`TransferError`] by the channel
/// that issued the call, since the same error means different things at different stages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no response within the allotted time")]
    Timeout,
    #[error("peer is not connected")]
    Disconnected,
    #[error("peer rejected the request: {0}")]
    Rejected(String),
    #[error("message exceeds the transport size limit")]
    TooLarge,
    #[error("transport i/o error: {0}")]
    Io(String),
}

/// Failure of one transfer session. Cloneable so one failure can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("negotiation failed: {0}")]
    NegotiationFailure(String),
    #[error("peer timed out during {0}")]
    PeerTimeout(&'static str),
    #[error("peer aborted the transfer: {0}")]
    PeerAbort(String),
    #[error("local i/o failure: {0}")]
    LocalIo(String),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("peer disconnected")]
    Disconnected,
    #[error("payload digest mismatch after reassembly")]
    IntegrityMismatch,
    #[error("unknown transfer")]
    UnknownTransfer,
    #[error("a session with this id is already active for the peer")]
    DuplicateSession,
    #[error("invalid fragment: {0}")]
    InvalidFragment(String),
}

/// Coarse classification of a [`TransferError`], for callers and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    NegotiationFailure,
    PeerTimeout,
    PeerAbort,
    LocalIo,
    Cancelled,
    Disconnected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::NegotiationFailure => "negotiation-failure",
            FailureKind::PeerTimeout => "peer-timeout",
            FailureKind::PeerAbort => "peer-abort",
            FailureKind::LocalIo => "local-io",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

impl TransferError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::NegotiationFailure(_) => FailureKind::NegotiationFailure,
            TransferError::PeerTimeout(_) => FailureKind::PeerTimeout,
            TransferError::PeerAbort(_)
            | TransferError::UnknownTransfer
            | TransferError::InvalidFragment(_) => FailureKind::PeerAbort,
            TransferError::LocalIo(_)
            | TransferError::IntegrityMismatch
            | TransferError::DuplicateSession => FailureKind::LocalIo,
            TransferError::Cancelled => FailureKind::Cancelled,
            TransferError::Disconnected => FailureKind::Disconnected,
        }
    }

    /// Reason to show the requesting party when the session is torn down.
    /// `None` for cancellation, which unwinds without a message.
    pub fn disconnect_reason(&self) -> Option<String> {
        match self {
            TransferError::Cancelled => None,
            other => Some(format!("world transfer failed ({}): {}", other.kind(), other)),
        }
    }

    /// Map a transport error raised while negotiating (announce, offer, fetch request).
    pub fn from_handshake(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => TransferError::Disconnected,
            TransportError::Timeout => {
                TransferError::NegotiationFailure("no response to offer".into())
            }
            TransportError::Rejected(reason) => TransferError::NegotiationFailure(reason),
            TransportError::TooLarge => {
                TransferError::NegotiationFailure("offer exceeds message size".into())
            }
            TransportError::Io(msg) => TransferError::NegotiationFailure(msg),
        }
    }

    /// Map a transport error raised once the transfer is under way.
    pub fn from_transfer(err: TransportError, stage: &'static str) -> Self {
        match err {
            TransportError::Disconnected => TransferError::Disconnected,
            TransportError::Timeout => TransferError::PeerTimeout(stage),
            TransportError::Rejected(reason) => TransferError::PeerAbort(reason),
            TransportError::TooLarge => {
                TransferError::LocalIo(format!("message too large during {}", stage))
            }
            TransportError::Io(msg) => TransferError::LocalIo(msg),
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::LocalIo(err.to_string())
    }
}
