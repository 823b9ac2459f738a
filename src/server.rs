// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Server façade (§4.9/§5): a single-use builder plus a handle type that
// serializes every public call under one mutex and tail-calls the
// state-transition callback only after releasing it, so user code can never
// re-enter the façade from inside its own callback.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use crate::error::{ErrorCode, MemConError, MemConResult, ReceiverState};
use crate::fsm::{RemoteReceiverFsm, TransitionRequest};
use crate::handle::{ClassHandle, GroupId, ReceiverId, ReceiverIndex};
use crate::log::{default_sink, LogSink};
use crate::logic::{DroppedInfo, LogicServer};
use crate::memory::{MemoryExchangeHandle, MemoryManager, MemoryTechnology, ReadWritableMemory};
use crate::queue::{QueueEntry, QueueMemoryConfig, SpscQueue};
use crate::side_channel::SideChannel;
use crate::slot::{SlotManager, SlotToken};
use crate::wire::{Frame, SlotMemoryConfig};

pub type StateTransitionCallback = dyn Fn(ReceiverId, ReceiverState, Option<ErrorCode>) + Send + Sync;

/// Single-use builder (§4.9): every option is settable at most once, and
/// `class()` must be called exactly `number_classes` times before `build()`.
pub struct ServerBuilder {
    number_slots: Option<usize>,
    slot_content_size: Option<usize>,
    slot_content_alignment: Option<usize>,
    memory_technology: Option<MemoryTechnology>,
    max_number_receivers: Option<usize>,
    number_classes: Option<usize>,
    class_limits: Vec<u32>,
    callback: Option<Arc<StateTransitionCallback>>,
    log_sink: Option<Arc<dyn LogSink>>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            number_slots: None,
            slot_content_size: None,
            slot_content_alignment: None,
            memory_technology: None,
            max_number_receivers: None,
            number_classes: None,
            class_limits: Vec::new(),
            callback: None,
            log_sink: None,
        }
    }

    pub fn number_slots(mut self, n: usize) -> Self {
        assert!(n > 0, "number_slots must be > 0");
        assert!(self.number_slots.is_none(), "number_slots already set");
        self.number_slots = Some(n);
        self
    }

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

    pub fn max_number_receivers(mut self, n: usize) -> Self {
        assert!(n > 0, "max_number_receivers must be > 0");
        assert!(self.max_number_receivers.is_none(), "max_number_receivers already set");
        self.max_number_receivers = Some(n);
        self
    }

    pub fn number_classes(mut self, n: usize) -> Self {
        assert!(self.number_classes.is_none(), "number_classes already set");
        self.number_classes = Some(n);
        self
    }

    /// Adds one receiver class with the given concurrency limit. Must be
    /// called exactly `number_classes` times.
    pub fn class(mut self, limit: u32) -> Self {
        let expected = self.number_classes.expect("number_classes must be set before calling class()");
        assert!(self.class_limits.len() < expected, "class() called more than number_classes times");
        self.class_limits.push(limit);
        self
    }

    pub fn on_receiver_state_transition_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(ReceiverId, ReceiverState, Option<ErrorCode>) + Send + Sync + 'static,
    {
        assert!(self.callback.is_none(), "on_receiver_state_transition_callback already set");
        self.callback = Some(Arc::new(f));
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn build(self) -> io::Result<Server> {
        let number_slots = self.number_slots.expect("number_slots is required");
        let slot_content_size = self.slot_content_size.expect("slot_content_size is required");
        let slot_content_alignment = self.slot_content_alignment.expect("slot_content_alignment is required");
        let memory_technology = self.memory_technology.expect("memory_technology is required");
        let max_number_receivers = self.max_number_receivers.expect("max_number_receivers is required");
        let number_classes = self.number_classes.expect("number_classes is required");
        assert_eq!(self.class_limits.len(), number_classes, "class() must be called exactly number_classes times");
        let callback = self.callback.expect("on_receiver_state_transition_callback is required");

        let group = GroupId::new();
        let memory = MemoryManager::new(memory_technology);
        let log_sink = self.log_sink.unwrap_or_else(default_sink);

        let region_size = SlotManager::region_size(number_slots, slot_content_size, slot_content_alignment);
        // The guard table sits at offset zero as a packed u32 array, so the
        // region itself needs at least 4-byte alignment regardless of what
        // the caller asked for the slot content.
        let (slot_mem, slot_mem_handle) = memory.allocate_writable(region_size, slot_content_alignment.max(4))?;
        let slots = unsafe { SlotManager::new_at_raw(slot_mem.as_mut_ptr(), number_slots, slot_content_size, slot_content_alignment) };
        let logic = LogicServer::with_slot_manager(group, slots, number_slots, &self.class_limits, max_number_receivers, log_sink.clone());

        Ok(Server {
            inner: Arc::new(ServerInner {
                group,
                slot_content_size,
                slot_content_alignment,
                num_slots: number_slots,
                queue_capacity: number_slots,
                slot_mem_handle,
                _slot_mem: slot_mem,
                memory,
                state: Mutex::new(ServerState {
                    logic,
                    receivers: HashMap::new(),
                    by_index: HashMap::new(),
                    shutdown: false,
                }),
                callback,
                log_sink,
            }),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ReceiverEntry {
    fsm: RemoteReceiverFsm,
    index: ReceiverIndex,
    side_channel: Option<Box<dyn SideChannel>>,
    to_receiver_queue: Option<SpscQueue>,
    to_receiver_mem: Option<ReadWritableMemory>,
    from_receiver_mem: Option<ReadWritableMemory>,
}

struct ServerState {
    logic: LogicServer,
    receivers: HashMap<ReceiverId, ReceiverEntry>,
    by_index: HashMap<ReceiverIndex, ReceiverId>,
    #[allow(dead_code)]
    shutdown: bool,
}

struct ServerInner {
    group: GroupId,
    slot_content_size: usize,
    slot_content_alignment: usize,
    num_slots: usize,
    queue_capacity: usize,
    slot_mem_handle: MemoryExchangeHandle,
    /// Keeps the slot content region's allocation alive for the server's
    /// lifetime; never read directly once `state.logic` is built over it.
    #[allow(dead_code)]
    _slot_mem: ReadWritableMemory,
    memory: MemoryManager,
    state: Mutex<ServerState>,
    callback: Arc<StateTransitionCallback>,
    log_sink: Arc<dyn LogSink>,
}

/// Cheaply cloneable handle to a running server; every method locks the
/// shared mutex for the call's duration except the callback invocation.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Clone for Server {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

type PendingCallback = (ReceiverId, ReceiverState, Option<ErrorCode>);

impl Server {
    pub fn group(&self) -> GroupId {
        self.inner.group
    }

    pub fn class_handle(&self, index: u32) -> ClassHandle {
        self.inner.state.lock().unwrap().logic.class_handle(index)
    }

    /// `AddReceiver`: reserves a receiver slot. Returns `None` once
    /// `max_number_receivers` concurrently-added receivers already exist.
    pub fn add_receiver(&self, class: ClassHandle) -> Option<ReceiverId> {
        let mut state = self.inner.state.lock().unwrap();
        let (id, index) = state.logic.add_receiver(class)?;
        state.receivers.insert(
            id,
            ReceiverEntry {
                fsm: RemoteReceiverFsm::new(id, class, self.inner.log_sink.clone()),
                index,
                side_channel: None,
                to_receiver_queue: None,
                to_receiver_mem: None,
                from_receiver_mem: None,
            },
        );
        state.by_index.insert(index, id);
        Some(id)
    }

    /// `ConnectReceiver`: sends the `ConnectionRequest` frame that starts the
    /// handshake (§4.6 step 1). `AckConnection` is processed later, by
    /// `poll_reactor`.
    pub fn connect_receiver(&self, id: ReceiverId, side_channel: Box<dyn SideChannel>) -> io::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        let entry = state
            .receivers
            .get_mut(&id)
            .unwrap_or_else(|| panic!("ConnectReceiver called with unknown ReceiverId {id:?}"));
        assert_eq!(entry.fsm.id.group, self.inner.group, "ReceiverId used against the wrong group");

        let queue_cap = self.inner.queue_capacity;
        let queue_bytes = SpscQueue::layout_size(queue_cap);
        let (mem, handle) = self.inner.memory.allocate_writable(queue_bytes, 8)?;
        let queue = unsafe { SpscQueue::init_at_raw(mem.as_mut_ptr(), queue_cap) };
        entry.to_receiver_mem = Some(mem);
        entry.to_receiver_queue = Some(queue);

        let frame = Frame::ConnectionRequest {
            slot_config: SlotMemoryConfig {
                num_slots: self.inner.num_slots as u64,
                slot_content_size: self.inner.slot_content_size as u64,
                slot_content_alignment: self.inner.slot_content_alignment as u64,
            },
            to_receiver_queue_config: QueueMemoryConfig::for_capacity(queue_cap),
            slot_mem_handle: self.inner.slot_mem_handle.clone(),
            queue_mem_handle: handle,
        };

        let req = entry.fsm.on_connect();
        entry.fsm.apply(req);
        let result = side_channel.send(frame);
        entry.side_channel = Some(side_channel);
        result
    }

    /// Drains every receiver's side channel once and advances its FSM.
    /// Caller decides the polling cadence (a dedicated reactor thread, or an
    /// existing event loop) — the side channel trait is already
    /// non-blocking, so this never stalls.
    pub fn poll_reactor(&self) {
        let mut callbacks: Vec<PendingCallback> = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            let ids: Vec<ReceiverId> = state.receivers.keys().copied().collect();
            for id in ids {
                Self::poll_one(&mut state, &self.inner, id, &mut callbacks);
            }
        }
        self.fire(callbacks);
    }

    fn poll_one(state: &mut ServerState, inner: &ServerInner, id: ReceiverId, callbacks: &mut Vec<PendingCallback>) {
        let ServerState { logic, receivers, .. } = state;
        let Some(entry) = receivers.get_mut(&id) else { return };
        let Some(side_channel) = entry.side_channel.as_ref() else { return };

        let frame = match side_channel.try_recv() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                let code = if e.kind() == io::ErrorKind::BrokenPipe { ErrorCode::PeerDisconnected } else { ErrorCode::PeerCrashed };
                let req = entry.fsm.on_error(code);
                apply_and_record(entry, logic, req, callbacks);
                return;
            }
        };

        match frame {
            Frame::AckConnection { from_receiver_queue_config, queue_mem_handle } => {
                let capacity = (from_receiver_queue_config.buffer.size as usize) / std::mem::size_of::<QueueEntry>();
                match inner.memory.map_writable(&queue_mem_handle) {
                    Ok(mem) => {
                        let from_receiver = unsafe { SpscQueue::attach_raw(mem.as_mut_ptr(), capacity) };
                        entry.from_receiver_mem = Some(mem);
                        let index = entry.index;
                        let req = entry.fsm.on_ack_connection();
                        apply_and_record(entry, logic, req, callbacks);
                        if entry.fsm.state() == ReceiverState::Connected {
                            let to_receiver = entry.to_receiver_queue.clone().expect("to_receiver queue must exist once Connect has run");
                            logic.connect(index, to_receiver, from_receiver);
                        }
                    }
                    Err(_) => {
                        let req = entry.fsm.on_error(ErrorCode::ProtocolError("failed to map receiver's queue memory".into()));
                        apply_and_record(entry, logic, req, callbacks);
                    }
                }
            }
            Frame::StartListening => {
                let index = entry.index;
                let req = entry.fsm.on_start_listening();
                apply_and_record(entry, logic, req, callbacks);
                if entry.fsm.state() != ReceiverState::Corrupted {
                    logic.set_wants_notification(index, true);
                }
            }
            Frame::StopListening => {
                let index = entry.index;
                let req = entry.fsm.on_stop_listening();
                apply_and_record(entry, logic, req, callbacks);
                if entry.fsm.state() != ReceiverState::Corrupted {
                    logic.set_wants_notification(index, false);
                }
            }
            Frame::Shutdown => {
                let index = entry.index;
                let req = entry.fsm.on_shutdown();
                apply_and_record(entry, logic, req, callbacks);
                logic.set_participating(index, false);
            }
            Frame::ConnectionRequest { .. } | Frame::Termination => {
                let req = entry.fsm.on_error(ErrorCode::ProtocolError("received a client-only frame on the server side".into()));
                apply_and_record(entry, logic, req, callbacks);
            }
            Frame::AckQueueInitialization | Frame::Notification => {}
        }
    }

    /// `AcquireSlot`.
    pub fn acquire_slot(&self) -> Option<SlotToken> {
        self.inner.state.lock().unwrap().logic.slots_mut().acquire()
    }

    /// `UnacquireSlot`.
    pub fn unacquire_slot(&self, token: SlotToken) {
        self.inner.state.lock().unwrap().logic.slots_mut().release(token)
    }

    /// `AccessSlotContent`, scoped to a closure so the façade mutex's
    /// lifetime never has to leak into the caller's borrow.
    pub fn access_slot_content<F, R>(&self, token: &SlotToken, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut state = self.inner.state.lock().unwrap();
        f(state.logic.slots_mut().access(token))
    }

    /// `SendSlot`. Always succeeds (dropping for saturated classes is not an
    /// error); fires one `Notification` frame per receiver that both
    /// accepted the slot and is currently listening.
    pub fn send_slot(&self, token: SlotToken) -> DroppedInfo {
        let mut state = self.inner.state.lock().unwrap();
        let outcome = state.logic.send(token);
        for index in &outcome.notify {
            if let Some(id) = state.by_index.get(index).copied() {
                if let Some(entry) = state.receivers.get(&id) {
                    if let Some(side_channel) = entry.side_channel.as_ref() {
                        let _ = side_channel.send(Frame::Notification);
                    }
                }
            }
        }
        outcome.dropped
    }

    /// `ReclaimSlots`. Returns `Err(ReceiverError)` if any receiver was
    /// newly corrupted this pass; other receivers still had their releases
    /// applied.
    pub fn reclaim_slots(&self) -> MemConResult<()> {
        let mut callbacks: Vec<PendingCallback> = Vec::new();
        let first_corrupted = {
            let mut state = self.inner.state.lock().unwrap();
            let outcome = state.logic.reclaim();
            let ServerState { logic, receivers, .. } = &mut *state;
            for id in &outcome.corrupted {
                if let Some(entry) = receivers.get_mut(id) {
                    let req = entry.fsm.on_logic_corruption();
                    apply_and_record(entry, logic, req, &mut callbacks);
                }
            }
            outcome.corrupted.first().copied()
        };
        self.fire(callbacks);
        match first_corrupted {
            Some(receiver) => Err(MemConError::ReceiverError { receiver }),
            None => Ok(()),
        }
    }

    pub fn get_receiver_state(&self, id: ReceiverId) -> (ReceiverState, Option<ErrorCode>) {
        let state = self.inner.state.lock().unwrap();
        let entry = state.receivers.get(&id).unwrap_or_else(|| panic!("GetReceiverState called with unknown ReceiverId {id:?}"));
        (entry.fsm.state(), entry.fsm.error().cloned())
    }

    /// `RemoveReceiver`: only legal once `Disconnected` and `!IsInUse` —
    /// calling it earlier is a precondition violation, not a recoverable
    /// error.
    pub fn remove_receiver(&self, id: ReceiverId) {
        let mut state = self.inner.state.lock().unwrap();
        let entry = state.receivers.get(&id).unwrap_or_else(|| panic!("RemoveReceiver called with unknown ReceiverId {id:?}"));
        assert_eq!(entry.fsm.state(), ReceiverState::Disconnected, "RemoveReceiver requires the receiver to be Disconnected");
        assert!(!entry.fsm.is_in_use(), "RemoveReceiver requires IsInUse() == false");
        let index = entry.index;
        state.receivers.remove(&id);
        state.by_index.remove(&index);
        state.logic.remove_receiver(index);
    }

    /// `Shutdown`. Aborts if any `SlotToken` is still outstanding — tokens
    /// must be returned (sent or unacquired) before tearing the server down.
    pub fn shutdown(&self) {
        let mut callbacks: Vec<PendingCallback> = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            assert_eq!(state.logic.slots().outstanding_tokens(), 0, "Shutdown called with outstanding SlotTokens still held");
            let ServerState { logic, receivers, shutdown, .. } = &mut *state;
            *shutdown = true;
            for entry in receivers.values_mut() {
                if entry.fsm.state() == ReceiverState::Disconnected {
                    continue;
                }
                if let Some(side_channel) = entry.side_channel.as_ref() {
                    let _ = side_channel.send(Frame::Shutdown);
                }
                let index = entry.index;
                let req = entry.fsm.on_terminate();
                apply_and_record(entry, logic, req, &mut callbacks);
                logic.set_participating(index, false);
            }
        }
        self.fire(callbacks);
    }

    fn fire(&self, callbacks: Vec<PendingCallback>) {
        for (id, new_state, error) in callbacks {
            (self.inner.callback)(id, new_state, error);
        }
    }
}

fn apply_and_record(entry: &mut ReceiverEntry, logic: &mut LogicServer, req: TransitionRequest<ReceiverState>, callbacks: &mut Vec<PendingCallback>) {
    if let TransitionRequest::To(new_state, ref error) = req {
        if new_state == ReceiverState::Corrupted {
            logic.mark_corrupted(entry.index);
        }
        callbacks.push((entry.fsm.id, new_state, error.clone()));
    }
    entry.fsm.apply(req);
}
