// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Recoverable error taxonomy surfaced to callers of Server/Client. Precondition
// violations (wrong-group handle, already-consumed SlotToken, use after
// shutdown, builder misuse) are not part of this enum — those abort via
// `panic!`/`assert!`, matching the teacher's own `expect()` calls for
// programmer-contract violations (e.g. `ShmHandle`'s platform layer).

use crate::handle::ReceiverId;
use std::io;

/// A receiver's connection state, reported alongside errors and to
/// `GetReceiverState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Connecting,
    Connected,
    Corrupted,
    Disconnected,
}

/// Errors recoverable at the Server/Client API boundary.
#[derive(Debug, thiserror::Error)]
pub enum MemConError {
    /// API called on a server/client already in `Disconnected`.
    #[error("operation invalid: server or client is already disconnected")]
    UnexpectedState,

    /// The receiver is not in the state required for this call.
    #[error("receiver {receiver:?} is in state {actual:?}, expected {expected:?}")]
    UnexpectedReceiverState {
        receiver: ReceiverId,
        expected: ReceiverState,
        actual: ReceiverState,
    },

    /// Peer closed the side channel without sending `Shutdown`.
    #[error("peer disconnected without sending shutdown")]
    PeerDisconnected,

    /// Peer exit signalled by the OS (broken-pipe class error).
    #[error("peer crashed")]
    PeerCrashed,

    /// Peer sent a frame that violates the state machine or is malformed.
    #[error("protocol violation: {detail}")]
    ProtocolError { detail: String },

    /// At least one receiver corrupted during the operation; other receivers
    /// proceeded normally.
    #[error("receiver {receiver:?} corrupted during this operation")]
    ReceiverError { receiver: ReceiverId },

    /// A genuine OS-level failure (allocation, handshake socket error).
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type MemConResult<T> = Result<T, MemConError>;

/// The error code carried alongside a receiver's transition into `Corrupted`,
/// reported once via `on_receiver_state_transition_callback`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    PeerDisconnected,
    PeerCrashed,
    ProtocolError(String),
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::PeerDisconnected => write!(f, "peer disconnected"),
            ErrorCode::PeerCrashed => write!(f, "peer crashed"),
            ErrorCode::ProtocolError(detail) => write!(f, "protocol error: {detail}"),
        }
    }
}
