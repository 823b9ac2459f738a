// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Receiver-side connection FSM (§4.8), the mirror of
// `RemoteReceiverFsm` with the handshake role reversed: the client expects
// the server's `ConnectionRequest`, maps the slot and server-queue memory,
// allocates its own queue, and replies with `AckConnection`.

use crate::error::ErrorCode;
use crate::handle::ContextId;

use super::TransitionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    /// The server shut down cleanly but this client still has logic state
    /// (unreceived, reclaimable slots) to drain. Unlike `Disconnected`,
    /// local reads from already-delivered slots are still permitted.
    DisconnectedRemote,
    Corrupted,
    Disconnected,
}

pub struct ClientFsm {
    pub context: ContextId,
    state: ClientState,
    listening: bool,
    error: Option<ErrorCode>,
}

impl ClientFsm {
    pub fn new() -> Self {
        Self {
            context: ContextId::new(),
            state: ClientState::Connecting,
            listening: false,
            error: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn error(&self) -> Option<&ErrorCode> {
        self.error.as_ref()
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    /// Local reads are valid from `Connected` and from `DisconnectedRemote`
    /// (draining what's left), but not before the handshake completes nor
    /// after full teardown.
    pub fn can_read_locally(&self) -> bool {
        matches!(self.state, ClientState::Connected | ClientState::DisconnectedRemote)
    }

    pub fn is_in_use(&self) -> bool {
        self.state != ClientState::Disconnected
    }

    /// Side-channel event: the server's `ConnectionRequest` arrived. Maps
    /// the slot/server-queue memory, allocates the reverse queue, and
    /// replies with `AckConnection` (caller's responsibility) before calling
    /// this.
    pub fn on_connection_request(&mut self) -> TransitionRequest<ClientState> {
        match self.state {
            ClientState::Connecting => TransitionRequest::To(ClientState::Connected, None),
            _ => TransitionRequest::None,
        }
    }

    /// Side-channel event: peer sent `Shutdown`.
    pub fn on_shutdown(&mut self) -> TransitionRequest<ClientState> {
        match self.state {
            ClientState::Connected => TransitionRequest::To(ClientState::DisconnectedRemote, None),
            ClientState::Connecting => TransitionRequest::To(ClientState::Disconnected, None),
            _ => TransitionRequest::None,
        }
    }

    pub fn on_error(&mut self, code: ErrorCode) -> TransitionRequest<ClientState> {
        match self.state {
            ClientState::Corrupted | ClientState::Disconnected => TransitionRequest::None,
            _ => TransitionRequest::To(ClientState::Corrupted, Some(code)),
        }
    }

    /// API event: the application has drained every outstanding slot while
    /// in `DisconnectedRemote` and is ready for full teardown.
    pub fn on_drained(&mut self) -> TransitionRequest<ClientState> {
        match self.state {
            ClientState::DisconnectedRemote => TransitionRequest::To(ClientState::Disconnected, None),
            _ => TransitionRequest::None,
        }
    }

    pub fn on_terminate(&mut self) -> TransitionRequest<ClientState> {
        match self.state {
            ClientState::Disconnected => TransitionRequest::None,
            _ => TransitionRequest::To(ClientState::Disconnected, None),
        }
    }

    /// API event: `StartListening` requested locally (sent to the server).
    pub fn request_start_listening(&mut self) -> TransitionRequest<ClientState> {
        match self.state {
            ClientState::Connected => {
                if self.listening {
                    TransitionRequest::To(
                        ClientState::Corrupted,
                        Some(ErrorCode::ProtocolError("StartListening requested while already listening".into())),
                    )
                } else {
                    self.listening = true;
                    TransitionRequest::None
                }
            }
            _ => TransitionRequest::None,
        }
    }

    pub fn request_stop_listening(&mut self) -> TransitionRequest<ClientState> {
        match self.state {
            ClientState::Connected => {
                if !self.listening {
                    TransitionRequest::To(
                        ClientState::Corrupted,
                        Some(ErrorCode::ProtocolError("StopListening requested while not listening".into())),
                    )
                } else {
                    self.listening = false;
                    TransitionRequest::None
                }
            }
            _ => TransitionRequest::None,
        }
    }

    pub fn apply(&mut self, request: TransitionRequest<ClientState>) {
        if let TransitionRequest::To(new_state, error) = request {
            self.state = new_state;
            if let Some(err) = error {
                self.error = Some(err);
            }
        }
    }
}

impl Default for ClientFsm {
    fn default() -> Self {
        Self::new()
    }
}
