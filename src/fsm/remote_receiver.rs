// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Server-side per-receiver connection FSM (§4.6). Drives the handshake,
// tracks the Start/Stop-Listening toggle (§4.7), and isolates a misbehaving
// receiver into `Corrupted` without affecting anyone else.

use std::sync::Arc;

use crate::error::{ErrorCode, ReceiverState};
use crate::handle::{ClassHandle, ContextId, ReceiverId};
use crate::log::{log_event, LogLevel, LogSink};

use super::TransitionRequest;

/// Handshake progress while `state` is `Connecting`. Distinct from
/// `ReceiverState` because "pre-Connect" and "post-Connect, awaiting ack"
/// both report `Connecting` to callers but react differently to events
/// (StartListening is illegal in both, but `AckConnection` only makes sense
/// once a `Connect` has actually been issued).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    NotConnected,
    ExpectAckConnection,
}

/// Per-receiver connection state machine, owned by the server façade.
pub struct RemoteReceiverFsm {
    pub id: ReceiverId,
    pub class: ClassHandle,
    pub context: ContextId,
    state: ReceiverState,
    handshake: Handshake,
    listening: bool,
    error: Option<ErrorCode>,
    async_in_flight: bool,
    log_sink: Arc<dyn LogSink>,
}

impl RemoteReceiverFsm {
    pub fn new(id: ReceiverId, class: ClassHandle, log_sink: Arc<dyn LogSink>) -> Self {
        Self {
            id,
            class,
            context: ContextId::new(),
            state: ReceiverState::Connecting,
            handshake: Handshake::NotConnected,
            listening: false,
            error: None,
            async_in_flight: false,
            log_sink,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn error(&self) -> Option<&ErrorCode> {
        self.error.as_ref()
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    /// `IsInUse` (§4.6): true while not yet `Disconnected`, or while a
    /// side-channel operation (the handshake) is still outstanding. Once
    /// false it never becomes true again, since `Disconnected` is terminal.
    pub fn is_in_use(&self) -> bool {
        self.state != ReceiverState::Disconnected || self.async_in_flight
    }

    /// API event: `Connect`. Sends the outbound `ConnectionRequest` frame
    /// (the caller owns the side channel and does the actual send) and
    /// starts expecting `AckConnection`.
    pub fn on_connect(&mut self) -> TransitionRequest<ReceiverState> {
        if self.state == ReceiverState::Connecting && self.handshake == Handshake::NotConnected {
            self.handshake = Handshake::ExpectAckConnection;
            self.async_in_flight = true;
        }
        TransitionRequest::None
    }

    /// Side-channel event: `AckConnection` received.
    pub fn on_ack_connection(&mut self) -> TransitionRequest<ReceiverState> {
        match (self.state, self.handshake) {
            (ReceiverState::Connecting, Handshake::ExpectAckConnection) => {
                TransitionRequest::To(ReceiverState::Connected, None)
            }
            (ReceiverState::Connecting, Handshake::NotConnected) => TransitionRequest::To(
                ReceiverState::Corrupted,
                Some(ErrorCode::ProtocolError("AckConnection received before Connect".into())),
            ),
            (ReceiverState::Connected, _) => TransitionRequest::To(
                ReceiverState::Corrupted,
                Some(ErrorCode::ProtocolError("unexpected AckConnection outside handshake".into())),
            ),
            _ => TransitionRequest::None,
        }
    }

    /// Side-channel event: peer sent `Shutdown`.
    pub fn on_shutdown(&mut self) -> TransitionRequest<ReceiverState> {
        match self.state {
            ReceiverState::Connecting if self.handshake == Handshake::NotConnected => TransitionRequest::None,
            ReceiverState::Connecting | ReceiverState::Connected => TransitionRequest::To(ReceiverState::Disconnected, None),
            _ => TransitionRequest::None,
        }
    }

    /// Side-channel event: transport-level error (broken pipe, malformed
    /// frame, etc).
    pub fn on_error(&mut self, code: ErrorCode) -> TransitionRequest<ReceiverState> {
        match self.state {
            ReceiverState::Corrupted | ReceiverState::Disconnected => TransitionRequest::None,
            _ => TransitionRequest::To(ReceiverState::Corrupted, Some(code)),
        }
    }

    /// Side-channel event: `StartListening`. Illegal during the whole of
    /// `Connecting`; in `Connected` it's the alternating toggle of §4.7.
    pub fn on_start_listening(&mut self) -> TransitionRequest<ReceiverState> {
        match self.state {
            ReceiverState::Connecting => TransitionRequest::To(
                ReceiverState::Corrupted,
                Some(ErrorCode::ProtocolError("StartListening received before Connected".into())),
            ),
            ReceiverState::Connected => {
                if self.listening {
                    TransitionRequest::To(
                        ReceiverState::Corrupted,
                        Some(ErrorCode::ProtocolError("StartListening while already listening".into())),
                    )
                } else {
                    self.listening = true;
                    TransitionRequest::None
                }
            }
            _ => TransitionRequest::None,
        }
    }

    /// Side-channel event: `StopListening`. Symmetric to `on_start_listening`.
    pub fn on_stop_listening(&mut self) -> TransitionRequest<ReceiverState> {
        match self.state {
            ReceiverState::Connecting => TransitionRequest::To(
                ReceiverState::Corrupted,
                Some(ErrorCode::ProtocolError("StopListening received before Connected".into())),
            ),
            ReceiverState::Connected => {
                if !self.listening {
                    TransitionRequest::To(
                        ReceiverState::Corrupted,
                        Some(ErrorCode::ProtocolError("StopListening while not listening".into())),
                    )
                } else {
                    self.listening = false;
                    TransitionRequest::None
                }
            }
            _ => TransitionRequest::None,
        }
    }

    /// API event: a protocol violation was observed at the Logic Server
    /// layer (bad echoed guard, out-of-range slot index during reclaim).
    pub fn on_logic_corruption(&mut self) -> TransitionRequest<ReceiverState> {
        match self.state {
            ReceiverState::Corrupted | ReceiverState::Disconnected => TransitionRequest::None,
            _ => TransitionRequest::To(
                ReceiverState::Corrupted,
                Some(ErrorCode::ProtocolError("logic-layer protocol violation during reclaim".into())),
            ),
        }
    }

    /// API event: `Terminate` / `HandleServerShutdown`. An admin transition
    /// that forces `Disconnected` even from `Corrupted`.
    pub fn on_terminate(&mut self) -> TransitionRequest<ReceiverState> {
        match self.state {
            ReceiverState::Disconnected => TransitionRequest::None,
            _ => TransitionRequest::To(ReceiverState::Disconnected, None),
        }
    }

    /// Applies a transition requested by an event handler. Called once the
    /// handler has returned, never from inside one.
    pub fn apply(&mut self, request: TransitionRequest<ReceiverState>) {
        if let TransitionRequest::To(new_state, error) = request {
            self.state = new_state;
            if let Some(err) = error {
                if new_state == ReceiverState::Corrupted {
                    log_event!(self.log_sink, LogLevel::Warn, self.context, "receiver {:?} corrupted: {:?}", self.id, err);
                }
                self.error = Some(err);
            }
            if matches!(new_state, ReceiverState::Disconnected | ReceiverState::Corrupted) {
                self.async_in_flight = false;
            }
        }
    }
}
