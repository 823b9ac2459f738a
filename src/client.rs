// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client façade (§4.9): the receiver side of one connection. Mirrors the
// Server façade's single-mutex discipline (every public call locks for its
// duration, the state-transition callback fires only after releasing it) but
// over one connection instead of a table of receivers.

use std::io;
use std::sync::{Arc, Mutex};

use crate::error::ErrorCode;
use crate::fsm::{ClientFsm, ClientState, TransitionRequest};
use crate::handle::SlotIndex;
use crate::log::{default_sink, log_event, LogLevel, LogSink};
use crate::memory::{MemoryExchangeHandle, MemoryManager, MemoryTechnology, ReadWritableMemory, ReadableMemory};
use crate::queue::{QueueEntry, QueueMemoryConfig, SpscQueue};
use crate::side_channel::SideChannel;
use crate::slot::SlotLayout;
use crate::wire::{Frame, SlotMemoryConfig};

pub type ClientStateTransitionCallback = dyn Fn(ClientState, Option<ErrorCode>) + Send + Sync;

/// Single-use builder, same discipline as `ServerBuilder`: every option
/// settable at most once.
pub struct ClientBuilder {
    slot_content_size: Option<usize>,
    slot_content_alignment: Option<usize>,
    memory_technology: Option<MemoryTechnology>,
    max_outstanding_slots: Option<usize>,
    side_channel: Option<Box<dyn SideChannel>>,
    callback: Option<Arc<ClientStateTransitionCallback>>,
    log_sink: Option<Arc<dyn LogSink>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            slot_content_size: None,
            slot_content_alignment: None,
            memory_technology: None,
            max_outstanding_slots: None,
            side_channel: None,
            callback: None,
            log_sink: None,
        }
    }

    /// Must match the server's configuration; a mismatch reported in
    /// `ConnectionRequest` corrupts the connection rather than silently
    /// proceeding with the server's numbers.
    pub fn slot_content_size(mut self, n: usize) -> Self {
        assert!(n > 0, "slot_content_size must be > 0");
        assert!(self.slot_content_size.is_none(), "slot_content_size already set");
        self.slot_content_size = Some(n);
        self
    }

    pub fn slot_content_alignment(mut self, n: usize) -> Self {
        assert!(n > 0 && n.is_power_of_two(), "slot_content_alignment must be a power of two > 0");
        assert!(self.slot_content_alignment.is_none(), "slot_content_alignment already set");
        self.slot_content_alignment = Some(n);
        self
    }

    pub fn memory_technology(mut self, tech: MemoryTechnology) -> Self {
        assert!(self.memory_technology.is_none(), "memory_technology already set");
        self.memory_technology = Some(tech);
        self
    }

    /// Capacity of the reverse (release) queue this client allocates once
    /// the handshake reaches `ConnectionRequest`. Should be at least the
    /// number of slots this client expects to hold concurrently — a full
    /// reverse queue silently stalls `ReclaimSlots` on the server.
    pub fn max_outstanding_slots(mut self, n: usize) -> Self {
        assert!(n > 0, "max_outstanding_slots must be > 0");
        assert!(self.max_outstanding_slots.is_none(), "max_outstanding_slots already set");
        self.max_outstanding_slots = Some(n);
        self
    }

    pub fn side_channel(mut self, side_channel: Box<dyn SideChannel>) -> Self {
        assert!(self.side_channel.is_none(), "side_channel already set");
        self.side_channel = Some(side_channel);
        self
    }

    pub fn on_state_transition_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(ClientState, Option<ErrorCode>) + Send + Sync + 'static,
    {
        assert!(self.callback.is_none(), "on_state_transition_callback already set");
        self.callback = Some(Arc::new(f));
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn build(self) -> Client {
        let slot_content_size = self.slot_content_size.expect("slot_content_size is required");
        let slot_content_alignment = self.slot_content_alignment.expect("slot_content_alignment is required");
        let memory_technology = self.memory_technology.expect("memory_technology is required");
        let max_outstanding_slots = self.max_outstanding_slots.expect("max_outstanding_slots is required");
        let side_channel = self.side_channel.expect("side_channel is required");
        let callback = self.callback.expect("on_state_transition_callback is required");

        Client {
            inner: Arc::new(ClientInner {
                slot_content_size,
                slot_content_alignment,
                max_outstanding_slots,
                memory: MemoryManager::new(memory_technology),
                side_channel,
                state: Mutex::new(ClientInnerState {
                    fsm: ClientFsm::new(),
                    slot_mem: None,
                    slot_layout: None,
                    to_receiver_queue: None,
                    from_receiver_queue: None,
                    _to_receiver_mem: None,
                    _from_receiver_mem: None,
                }),
                callback,
                log_sink: self.log_sink.unwrap_or_else(default_sink),
            }),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientInnerState {
    fsm: ClientFsm,
    slot_mem: Option<ReadableMemory>,
    slot_layout: Option<SlotLayout>,
    to_receiver_queue: Option<SpscQueue>,
    from_receiver_queue: Option<SpscQueue>,
    /// Keeps the mapped/allocated queue memory alive for the connection's
    /// lifetime; never read directly once the `SpscQueue`s are built over it.
    #[allow(dead_code)]
    _to_receiver_mem: Option<ReadWritableMemory>,
    #[allow(dead_code)]
    _from_receiver_mem: Option<ReadWritableMemory>,
}

struct ClientInner {
    slot_content_size: usize,
    slot_content_alignment: usize,
    max_outstanding_slots: usize,
    memory: MemoryManager,
    side_channel: Box<dyn SideChannel>,
    state: Mutex<ClientInnerState>,
    callback: Arc<ClientStateTransitionCallback>,
    log_sink: Arc<dyn LogSink>,
}

/// Cheaply cloneable handle to one client connection.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl Client {
    pub fn state(&self) -> (ClientState, Option<ErrorCode>) {
        let state = self.inner.state.lock().unwrap();
        (state.fsm.state(), state.fsm.error().cloned())
    }

    /// Drains the side channel once and advances the connection FSM. Caller
    /// decides the polling cadence, exactly as `Server::poll_reactor`. Slot
    /// delivery itself never goes through this — it's carried entirely by
    /// the shared-memory queue, polled separately via `try_receive_slot`.
    pub fn poll_reactor(&self) {
        let reported = {
            let mut state = self.inner.state.lock().unwrap();
            Self::poll_once(&mut state, &self.inner)
        };
        if let Some((new_state, error)) = reported {
            (self.inner.callback)(new_state, error);
        }
    }

    fn poll_once(state: &mut ClientInnerState, inner: &ClientInner) -> Option<(ClientState, Option<ErrorCode>)> {
        let frame = match inner.side_channel.try_recv() {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(e) => {
                let code = if e.kind() == io::ErrorKind::BrokenPipe { ErrorCode::PeerDisconnected } else { ErrorCode::PeerCrashed };
                let req = state.fsm.on_error(code);
                return apply(state, req, &inner.log_sink);
            }
        };

        match frame {
            Frame::ConnectionRequest { slot_config, to_receiver_queue_config, slot_mem_handle, queue_mem_handle } => {
                Self::handle_connection_request(state, inner, slot_config, to_receiver_queue_config, slot_mem_handle, queue_mem_handle)
            }
            Frame::Shutdown => {
                let req = state.fsm.on_shutdown();
                apply(state, req, &inner.log_sink)
            }
            Frame::Termination => {
                let req = state.fsm.on_terminate();
                apply(state, req, &inner.log_sink)
            }
            Frame::AckConnection { .. } | Frame::StartListening | Frame::StopListening => {
                let req = state.fsm.on_error(ErrorCode::ProtocolError("received a server-only frame on the client side".into()));
                apply(state, req, &inner.log_sink)
            }
            Frame::AckQueueInitialization | Frame::Notification => None,
        }
    }

    fn handle_connection_request(
        state: &mut ClientInnerState,
        inner: &ClientInner,
        slot_config: SlotMemoryConfig,
        to_receiver_queue_config: QueueMemoryConfig,
        slot_mem_handle: MemoryExchangeHandle,
        queue_mem_handle: MemoryExchangeHandle,
    ) -> Option<(ClientState, Option<ErrorCode>)> {
        if slot_config.slot_content_size as usize != inner.slot_content_size || slot_config.slot_content_alignment as usize != inner.slot_content_alignment {
            let req = state.fsm.on_error(ErrorCode::ProtocolError("server's slot configuration does not match this client's".into()));
            return apply(state, req, &inner.log_sink);
        }

        let slot_mem = match inner.memory.map_readable(&slot_mem_handle) {
            Ok(mem) => mem,
            Err(_) => {
                let req = state.fsm.on_error(ErrorCode::ProtocolError("failed to map slot memory".into()));
                return apply(state, req, &inner.log_sink);
            }
        };
        let to_receiver_mem = match inner.memory.map_writable(&queue_mem_handle) {
            Ok(mem) => mem,
            Err(_) => {
                let req = state.fsm.on_error(ErrorCode::ProtocolError("failed to map server-to-client queue memory".into()));
                return apply(state, req, &inner.log_sink);
            }
        };
        let to_capacity = (to_receiver_queue_config.buffer.size as usize) / std::mem::size_of::<QueueEntry>();
        let to_receiver = unsafe { SpscQueue::attach_raw(to_receiver_mem.as_mut_ptr(), to_capacity) };

        let from_capacity = inner.max_outstanding_slots;
        let (from_receiver_mem, from_receiver_handle) = match inner.memory.allocate_writable(SpscQueue::layout_size(from_capacity), 8) {
            Ok(pair) => pair,
            Err(_) => {
                let req = state.fsm.on_error(ErrorCode::ProtocolError("failed to allocate client-to-server queue memory".into()));
                return apply(state, req, &inner.log_sink);
            }
        };
        let from_receiver = unsafe { SpscQueue::init_at_raw(from_receiver_mem.as_mut_ptr(), from_capacity) };

        let layout = SlotLayout::new(slot_config.num_slots as usize, slot_config.slot_content_size as usize, slot_config.slot_content_alignment as usize);

        state.slot_mem = Some(slot_mem);
        state.slot_layout = Some(layout);
        state.to_receiver_queue = Some(to_receiver);
        state.from_receiver_queue = Some(from_receiver);
        state._to_receiver_mem = Some(to_receiver_mem);
        state._from_receiver_mem = Some(from_receiver_mem);

        let req = state.fsm.on_connection_request();
        let reported = apply(state, req, &inner.log_sink);

        let ack = Frame::AckConnection {
            from_receiver_queue_config: QueueMemoryConfig::for_capacity(from_capacity),
            queue_mem_handle: from_receiver_handle,
        };
        // Best-effort: a dropped AckConnection surfaces as PeerDisconnected
        // on the server's next poll, same as any other lost frame.
        let _ = inner.side_channel.send(ack);

        reported
    }

    /// `ReceiveSlot`. Bypasses the side channel entirely — slot delivery is
    /// carried by the shared-memory queue the handshake wired up; this just
    /// pops it. `None` both when nothing is pending and when the handshake
    /// hasn't completed yet.
    pub fn try_receive_slot(&self) -> Option<SlotIndex> {
        let state = self.inner.state.lock().unwrap();
        if !state.fsm.can_read_locally() {
            return None;
        }
        state.to_receiver_queue.as_ref()?.try_pop().map(|e| e.slot_index())
    }

    /// The guard value this client currently observes for `index`, read
    /// directly out of the shared slot region. `ReleaseSlot` echoes this
    /// back so the server can detect a slot reused out from under a slow
    /// reader.
    pub fn slot_guard(&self, index: SlotIndex) -> u32 {
        let state = self.inner.state.lock().unwrap();
        let layout = state.slot_layout.expect("slot_guard called before the handshake completed");
        let mem = state.slot_mem.as_ref().expect("slot memory not mapped yet");
        unsafe { layout.guard_value(mem.as_ptr(), index) }
    }

    /// `AccessSlotContent`, scoped to a closure so the mapped memory's
    /// lifetime never has to leak into the caller's borrow. Read-only: slot
    /// content is mapped read-only on the receiver side.
    pub fn access_slot_content<F, R>(&self, index: SlotIndex, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let state = self.inner.state.lock().unwrap();
        let layout = state.slot_layout.expect("access_slot_content called before the handshake completed");
        let mem = state.slot_mem.as_ref().expect("slot memory not mapped yet");
        f(unsafe { layout.content(mem.as_ptr(), index) })
    }

    /// `ReleaseSlot`. Echoes the slot's current guard value through the
    /// reverse queue. Returns `false` iff that queue is full — the caller
    /// must retry; a full reverse queue is back-pressure, not an error.
    pub fn release_slot(&self, index: SlotIndex) -> bool {
        let state = self.inner.state.lock().unwrap();
        let layout = state.slot_layout.expect("release_slot called before the handshake completed");
        let mem = state.slot_mem.as_ref().expect("slot memory not mapped yet");
        let guard = unsafe { layout.guard_value(mem.as_ptr(), index) };
        let queue = state.from_receiver_queue.as_ref().expect("from_receiver queue not allocated yet");
        queue.try_push(QueueEntry::with_aux(index, guard))
    }

    /// API event: the application has drained every slot it held while the
    /// connection was in `DisconnectedRemote` and is ready for teardown.
    pub fn mark_drained(&self) {
        let reported = {
            let mut state = self.inner.state.lock().unwrap();
            let req = state.fsm.on_drained();
            apply(&mut state, req, &self.inner.log_sink)
        };
        if let Some((new_state, error)) = reported {
            (self.inner.callback)(new_state, error);
        }
    }

    /// `StartListening`: requests `Notification` frames from the server.
    /// Caught locally first (a double call corrupts without ever reaching
    /// the wire) — see §4.7.
    pub fn request_start_listening(&self) -> io::Result<()> {
        let (corrupted, reported) = {
            let mut state = self.inner.state.lock().unwrap();
            let req = state.fsm.request_start_listening();
            let corrupted = matches!(req, TransitionRequest::To(ClientState::Corrupted, _));
            (corrupted, apply(&mut state, req, &self.inner.log_sink))
        };
        if let Some((new_state, error)) = reported {
            (self.inner.callback)(new_state, error);
        }
        if corrupted {
            return Ok(());
        }
        self.inner.side_channel.send(Frame::StartListening)
    }

    pub fn request_stop_listening(&self) -> io::Result<()> {
        let (corrupted, reported) = {
            let mut state = self.inner.state.lock().unwrap();
            let req = state.fsm.request_stop_listening();
            let corrupted = matches!(req, TransitionRequest::To(ClientState::Corrupted, _));
            (corrupted, apply(&mut state, req, &self.inner.log_sink))
        };
        if let Some((new_state, error)) = reported {
            (self.inner.callback)(new_state, error);
        }
        if corrupted {
            return Ok(());
        }
        self.inner.side_channel.send(Frame::StopListening)
    }

    /// `Shutdown`. Sends `Shutdown` to the server and tears the connection
    /// down locally right away — unlike the server side, there's no
    /// receiver table whose other entries must keep running.
    pub fn shutdown(&self) -> io::Result<()> {
        let result = self.inner.side_channel.send(Frame::Shutdown);
        let reported = {
            let mut state = self.inner.state.lock().unwrap();
            let req = state.fsm.on_terminate();
            apply(&mut state, req, &self.inner.log_sink)
        };
        if let Some((new_state, error)) = reported {
            (self.inner.callback)(new_state, error);
        }
        result
    }
}

fn apply(state: &mut ClientInnerState, req: TransitionRequest<ClientState>, log_sink: &Arc<dyn LogSink>) -> Option<(ClientState, Option<ErrorCode>)> {
    let reported = match &req {
        TransitionRequest::To(new_state, error) => {
            if *new_state == ClientState::Corrupted {
                if let Some(err) = error {
                    log_event!(log_sink, LogLevel::Warn, state.fsm.context, "client connection corrupted: {:?}", err);
                }
            }
            Some((*new_state, error.clone()))
        }
        TransitionRequest::None => None,
    };
    state.fsm.apply(req);
    reported
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReceiverState;
    use crate::server::{Server, ServerBuilder};
    use crate::side_channel::InProcessSideChannel;

    fn build_pair(limit: u32) -> (Server, Client) {
        let server = ServerBuilder::new()
            .number_slots(4)
            .slot_content_size(64)
            .slot_content_alignment(8)
            .memory_technology(MemoryTechnology::InProcess)
            .max_number_receivers(2)
            .number_classes(1)
            .class(limit)
            .on_receiver_state_transition_callback(|_, _, _| {})
            .build()
            .unwrap();

        let class = server.class_handle(0);
        let id = server.add_receiver(class).unwrap();
        let (server_channel, client_channel) = InProcessSideChannel::pair();
        server.connect_receiver(id, Box::new(server_channel)).unwrap();

        let client = ClientBuilder::new()
            .slot_content_size(64)
            .slot_content_alignment(8)
            .memory_technology(MemoryTechnology::InProcess)
            .max_outstanding_slots(4)
            .side_channel(Box::new(client_channel))
            .on_state_transition_callback(|_, _| {})
            .build();

        client.poll_reactor(); // processes ConnectionRequest, sends AckConnection
        server.poll_reactor(); // processes AckConnection, reaches Connected

        (server, client)
    }

    #[test]
    fn handshake_reaches_connected_on_both_ends() {
        let (server, client) = build_pair(4);
        assert_eq!(client.state().0, ClientState::Connected);
        assert!(matches!(server.get_receiver_state(server.add_receiver(server.class_handle(0)).unwrap()).0, ReceiverState::Connecting));
    }

    #[test]
    fn send_receive_and_reclaim_round_trip_through_shared_memory() {
        let (server, client) = build_pair(4);

        let token = server.acquire_slot().unwrap();
        server.access_slot_content(&token, |bytes| bytes[0] = 0x42);
        let dropped = server.send_slot(token);
        assert!(dropped.classes.is_empty());

        let index = client.try_receive_slot().expect("slot must be delivered through the shared queue");
        client.access_slot_content(index, |bytes| assert_eq!(bytes[0], 0x42));

        assert!(client.release_slot(index));
        server.reclaim_slots().unwrap();
        assert!(server.acquire_slot().is_some(), "slot must be reclaimed back to Free");
    }

    #[test]
    fn bad_echoed_guard_corrupts_receiver_without_affecting_client_locally() {
        let (server, client) = build_pair(4);
        let token = server.acquire_slot().unwrap();
        let index = token.index();
        server.send_slot(token);
        let received = client.try_receive_slot().unwrap();
        assert_eq!(received, index);

        // A guard read after the server has already reclaimed a slot with
        // this index under it would diverge; here we simulate a corrupted
        // echo directly, as a misbehaving or buggy client might send.
        {
            let state = client.inner.state.lock().unwrap();
            let queue = state.from_receiver_queue.as_ref().unwrap();
            assert!(queue.try_push(QueueEntry::with_aux(index, 0xDEAD_BEEF)));
        }
        let outcome = server.reclaim_slots();
        assert!(matches!(outcome, Err(crate::error::MemConError::ReceiverError { .. })));
    }

    #[test]
    fn clean_server_shutdown_allows_draining_then_disconnects() {
        let (server, client) = build_pair(4);
        server.shutdown();
        client.poll_reactor();
        assert_eq!(client.state().0, ClientState::DisconnectedRemote);
        client.mark_drained();
        assert_eq!(client.state().0, ClientState::Disconnected);
    }

    #[test]
    fn double_start_listening_corrupts_locally_without_reaching_the_wire() {
        let (_server, client) = build_pair(4);
        client.request_start_listening().unwrap();
        client.request_start_listening().unwrap();
        assert_eq!(client.state().0, ClientState::Corrupted);
    }
}
