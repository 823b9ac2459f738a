// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Identifiers shared across the transport. Every handle carries a process-wide
// group tag so a handle minted by one Server/Client instance can't be used
// against another by accident — a debug-assist invariant (see DESIGN.md),
// not a security boundary.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);
static NEXT_RECEIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Tags the handles minted by one Server or Client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

impl GroupId {
    pub fn new() -> Self {
        Self(NEXT_GROUP.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

/// Dense 0-based index into the slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(pub u32);

/// A `SlotIndex` tagged with the group of the Server that owns the slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    pub group: GroupId,
    pub index: SlotIndex,
}

impl SlotHandle {
    pub fn new(group: GroupId, index: SlotIndex) -> Self {
        Self { group, index }
    }

    /// Panics (precondition violation, not a recoverable error) if this
    /// handle was not minted by `group`.
    pub fn check_group(&self, group: GroupId) {
        assert_eq!(self.group, group, "SlotHandle used against the wrong group");
    }
}

/// Dense 0-based index into the receiver array (the logic-level identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverIndex(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverHandle {
    pub group: GroupId,
    pub index: ReceiverIndex,
}

/// Product of (group, monotonically-increasing id, receiver index). Two
/// `ReceiverId`s compare equal only when all three match, so id reuse after
/// `RemoveReceiver` can never be confused with the receiver that previously
/// occupied the same index.
#[derive(Debug, Clone, Copy, Eq, Hash)]
pub struct ReceiverId {
    pub group: GroupId,
    pub id: u64,
    pub index: ReceiverIndex,
}

impl ReceiverId {
    pub(crate) fn new(group: GroupId, index: ReceiverIndex) -> Self {
        Self {
            group,
            id: NEXT_RECEIVER_ID.fetch_add(1, Ordering::Relaxed),
            index,
        }
    }
}

impl PartialEq for ReceiverId {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group && self.id == other.id && self.index == other.index
    }
}

/// Index of a receiver class, configured at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassHandle {
    pub group: GroupId,
    pub index: u32,
}

/// Small per-receiver/per-client integer used only for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ContextId {
    pub fn new() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiver_id_distinguishes_reused_index() {
        let group = GroupId::new();
        let first = ReceiverId::new(group, ReceiverIndex(0));
        let second = ReceiverId::new(group, ReceiverIndex(0));
        assert_ne!(first, second, "reused index must not compare equal after reuse");
    }

    #[test]
    fn receiver_id_equality_is_reflexive() {
        let group = GroupId::new();
        let id = ReceiverId::new(group, ReceiverIndex(3));
        assert_eq!(id, id);
    }

    #[test]
    #[should_panic(expected = "wrong group")]
    fn slot_handle_rejects_foreign_group() {
        let group_a = GroupId::new();
        let group_b = GroupId::new();
        let handle = SlotHandle::new(group_a, SlotIndex(0));
        handle.check_group(group_b);
    }
}
