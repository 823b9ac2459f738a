// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The send/receive/reclaim engine. Composes the Slot Manager, the Receiver
// Class table and the Borrowed Manager into the transfer protocol. Pure
// in-memory: no side channel, no sockets, no shared-memory mapping — those
// are the Remote Receiver state machine's and Memory Manager's job. This is
// what the `on_receiver_state_transition_callback`-driven FSM calls into once
// a receiver is actually `Connected`.

use std::sync::Arc;

use crate::borrow::BorrowedManager;
use crate::class::ClassTable;
use crate::handle::{ClassHandle, ContextId, GroupId, ReceiverId, ReceiverIndex};
use crate::log::{log_event, LogLevel, LogSink};
use crate::queue::{QueueEntry, SpscQueue};
use crate::slot::{SlotManager, SlotToken};

struct LogicReceiver {
    id: ReceiverId,
    class: ClassHandle,
    participating: bool,
    corrupted: bool,
    wants_notification: bool,
    to_receiver: Option<SpscQueue>,
    from_receiver: Option<SpscQueue>,
}

/// Classes a `send` dropped slots for, in receiver-index visitation order,
/// each class reported at most once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DroppedInfo {
    pub classes: Vec<ClassHandle>,
}

pub struct SendOutcome {
    pub dropped: DroppedInfo,
    /// Receivers whose queue transitioned and who requested a wake-up for
    /// this push; the caller (Remote Receiver FSM) is responsible for
    /// turning this into side-channel `Notification` frames.
    pub notify: Vec<ReceiverIndex>,
}

pub struct ReclaimOutcome {
    /// Receivers that were corrupted by a protocol violation observed during
    /// this reclaim pass.
    pub corrupted: Vec<ReceiverId>,
}

pub struct LogicServer {
    group: GroupId,
    context: ContextId,
    log_sink: Arc<dyn LogSink>,
    slots: SlotManager,
    classes: ClassTable,
    borrowed: BorrowedManager,
    receivers: Vec<Option<LogicReceiver>>,
    free_receiver_slots: Vec<ReceiverIndex>,
    max_number_receivers: usize,
}

impl LogicServer {
    pub fn new(
        group: GroupId,
        num_slots: usize,
        content_size: usize,
        content_alignment: usize,
        class_limits: &[u32],
        max_number_receivers: usize,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        Self::with_slot_manager(group, SlotManager::new(num_slots, content_size, content_alignment), num_slots, class_limits, max_number_receivers, log_sink)
    }

    /// Builds a Logic Server over a `SlotManager` whose content buffer is
    /// already wired to externally-allocated memory (`SlotManager::new_at_raw`),
    /// for Server façade use where slot bytes must be reachable through a
    /// `MemoryExchangeHandle`.
    pub fn with_slot_manager(
        group: GroupId,
        slots: SlotManager,
        num_slots: usize,
        class_limits: &[u32],
        max_number_receivers: usize,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        assert!(max_number_receivers > 0, "max_number_receivers must be > 0");
        Self {
            group,
            context: ContextId::new(),
            log_sink,
            slots,
            classes: ClassTable::new(group, class_limits),
            borrowed: BorrowedManager::new(num_slots),
            receivers: Vec::new(),
            free_receiver_slots: Vec::new(),
            max_number_receivers,
        }
    }

    pub fn class_handle(&self, index: u32) -> ClassHandle {
        self.classes.handle(index)
    }

    pub fn slots_mut(&mut self) -> &mut SlotManager {
        &mut self.slots
    }

    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    /// Reserves a `ReceiverIndex` for a newly added receiver (`AddReceiver`).
    /// The receiver does not participate in sends until `connect` is called.
    pub fn add_receiver(&mut self, class: ClassHandle) -> Option<(ReceiverId, ReceiverIndex)> {
        let index = if let Some(index) = self.free_receiver_slots.pop() {
            index
        } else {
            if self.receivers.len() >= self.max_number_receivers {
                return None;
            }
            let index = ReceiverIndex(self.receivers.len() as u32);
            self.receivers.push(None);
            index
        };
        let id = ReceiverId::new(self.group, index);
        self.receivers[index.0 as usize] = Some(LogicReceiver {
            id,
            class,
            participating: false,
            corrupted: false,
            wants_notification: false,
            to_receiver: None,
            from_receiver: None,
        });
        Some((id, index))
    }

    /// Called once the handshake completes: attaches the real queues and
    /// starts participation in sends.
    pub fn connect(&mut self, index: ReceiverIndex, to_receiver: SpscQueue, from_receiver: SpscQueue) {
        let receiver = self.receivers[index.0 as usize].as_mut().expect("receiver must exist");
        receiver.to_receiver = Some(to_receiver);
        receiver.from_receiver = Some(from_receiver);
        receiver.participating = true;
    }

    pub fn set_participating(&mut self, index: ReceiverIndex, participating: bool) {
        if let Some(receiver) = self.receivers[index.0 as usize].as_mut() {
            receiver.participating = participating;
        }
    }

    pub fn mark_corrupted(&mut self, index: ReceiverIndex) {
        if let Some(receiver) = self.receivers[index.0 as usize].as_mut() {
            receiver.corrupted = true;
            receiver.participating = false;
        }
    }

    pub fn set_wants_notification(&mut self, index: ReceiverIndex, wants: bool) {
        if let Some(receiver) = self.receivers[index.0 as usize].as_mut() {
            receiver.wants_notification = wants;
        }
    }

    /// Frees the receiver slot for reuse. Only legal once the receiver is
    /// fully torn down (`Disconnected` and `!IsInUse`) — enforced by the
    /// caller, not here.
    pub fn remove_receiver(&mut self, index: ReceiverIndex) {
        self.receivers[index.0 as usize] = None;
        self.free_receiver_slots.push(index);
    }

    /// §4.3 send algorithm: visits receivers in index order, applies
    /// class-admission, pushes to each connected receiver's queue, and
    /// transfers the slot to the in-flight pool (or releases it immediately
    /// if nobody accepted it).
    pub fn send(&mut self, token: SlotToken) -> SendOutcome {
        let slot_index = self.slots.take_for_send(token);
        let mut dropped_classes = Vec::new();
        let mut notify = Vec::new();
        let mut sent_to_any = false;

        for i in 0..self.receivers.len() {
            let Some(receiver) = self.receivers[i].as_mut() else { continue };
            if !receiver.participating || receiver.corrupted {
                continue;
            }
            if self.classes.is_saturated(receiver.class) {
                if !dropped_classes.contains(&receiver.class) {
                    log_event!(self.log_sink, LogLevel::Warn, self.context, "dropping slot for saturated class {:?}", receiver.class);
                    dropped_classes.push(receiver.class);
                }
                continue;
            }
            let queue = receiver.to_receiver.as_ref().expect("connected receiver must have a queue");
            let entry = QueueEntry::new(slot_index, receiver.wants_notification);
            if queue.try_push(entry) {
                self.borrowed.increment(slot_index);
                self.classes.admit(receiver.class);
                sent_to_any = true;
                if receiver.wants_notification {
                    notify.push(ReceiverIndex(i as u32));
                }
            }
            // A full queue is a silent per-receiver drop: not corrupting,
            // not part of DroppedInfo (that only reports class saturation).
        }

        if !sent_to_any {
            self.slots.reclaim_to_free(slot_index);
        }

        SendOutcome {
            dropped: DroppedInfo { classes: dropped_classes },
            notify,
        }
    }

    /// §4.3 reclaim algorithm: drains every reverse queue (receiver -> server)
    /// of released slot indices, decrementing the originating class's
    /// in-flight count and the slot's borrow count, returning the slot to
    /// Free once the borrow count reaches zero. Idempotent: a reclaim with no
    /// new releases is a no-op.
    pub fn reclaim(&mut self) -> ReclaimOutcome {
        let mut corrupted = Vec::new();

        for i in 0..self.receivers.len() {
            let snapshot = match &self.receivers[i] {
                Some(r) if r.participating && !r.corrupted => Some((r.id, r.class, r.from_receiver.clone())),
                _ => None,
            };
            let Some((id, class, Some(from_receiver))) = snapshot else { continue };

            loop {
                let Some(entry) = from_receiver.try_pop() else { break };
                let slot_index = entry.slot_index();

                if slot_index.0 as usize >= self.slots.total_slots() {
                    log_event!(self.log_sink, LogLevel::Error, self.context, "receiver {:?} echoed out-of-range slot index {:?} during reclaim", id, slot_index);
                    self.mark_corrupted(ReceiverIndex(i as u32));
                    corrupted.push(id);
                    break;
                }
                let echoed_guard = entry.aux();
                if echoed_guard != self.slots.guard_value(slot_index) {
                    log_event!(self.log_sink, LogLevel::Error, self.context, "receiver {:?} echoed a stale guard for slot {:?} during reclaim", id, slot_index);
                    self.mark_corrupted(ReceiverIndex(i as u32));
                    corrupted.push(id);
                    break;
                }

                self.classes.release(class);
                if self.borrowed.decrement(slot_index) {
                    self.slots.reclaim_to_free(slot_index);
                }
            }
        }

        ReclaimOutcome { corrupted }
    }

    pub fn borrow_count(&self, index: crate::handle::SlotIndex) -> u32 {
        self.borrowed.count(index)
    }
}
