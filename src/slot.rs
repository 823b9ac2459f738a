// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Owns the slot content region and the free-list of unused slots. A slot
// moves Free -> HeldByServer (as a SlotToken) -> InFlight (borrow_count > 0,
// tracked by BorrowedManager) -> Free. The free-list is a plain stack of
// indices, same shape as the id-pool free-lists elsewhere in this codebase.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::handle::SlotIndex;

/// Move-only capability proving exclusive write access to one slot. Rust's
/// ownership rules already give us the "at most one token per slot" and
/// "consumed exactly once" invariants for free — this type exists to carry
/// the index, not to reimplement linearity.
///
/// Dropping a token without routing it through `SlotManager::release` or the
/// Logic Server's send path is a precondition violation: it would silently
/// leak a slot out of the free-list forever, so it aborts instead.
pub struct SlotToken {
    index: SlotIndex,
}

impl SlotToken {
    fn new(index: SlotIndex) -> Self {
        Self { index }
    }

    pub fn index(&self) -> SlotIndex {
        self.index
    }

    /// Consume the token, returning its index. Used internally by
    /// `SlotManager::release` and `LogicServer::send`; skips `Drop` so the
    /// leak check below does not fire on the intended, tracked consumption.
    pub(crate) fn take(self) -> SlotIndex {
        let index = self.index;
        std::mem::forget(self);
        index
    }
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        panic!(
            "SlotToken for slot {:?} dropped without being sent or released — outstanding tokens must be returned before Shutdown",
            self.index
        );
    }
}

impl std::fmt::Debug for SlotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotToken").field("index", &self.index).finish()
    }
}

/// The slot content buffer: either owned directly (pure in-memory use, e.g.
/// the Logic Server's own unit tests) or pointing into memory allocated
/// elsewhere (the Memory Manager, whose exchange handle the Server hands to
/// receivers so they can map the same bytes read-only). The Logic Server
/// itself stays technology-agnostic either way — it only ever deals in
/// offsets into whichever buffer it was given.
///
/// Layout: a packed `u32` guard table (`num_slots` entries) first, then the
/// content array, the guard table's end rounded up to `content_alignment` so
/// the first slot's content starts aligned. The guard field has to live in
/// this same buffer, not in a private side table — receivers only ever see
/// this buffer (via a read-only mapping of the same bytes), and the whole
/// point of the guard field is that a receiver can observe it was bumped
/// out from under them.
enum SlotContent {
    Owned(Box<[u8]>),
    Raw(*mut u8),
}

unsafe impl Send for SlotContent {}

/// The same offset arithmetic `SlotManager` uses, exposed standalone so a
/// receiver can locate a slot's guard field and content inside its own
/// read-only mapping of the region without needing a `SlotManager` of its
/// own (it has no free-list or token bookkeeping to do).
#[derive(Debug, Clone, Copy)]
pub struct SlotLayout {
    content_offset: usize,
    slot_stride: usize,
    content_size: usize,
}

impl SlotLayout {
    pub fn new(num_slots: usize, content_size: usize, content_alignment: usize) -> Self {
        let slot_stride = SlotManager::validate_and_stride(num_slots, content_size, content_alignment);
        let content_offset = SlotManager::guard_table_len(num_slots, content_alignment);
        Self { content_offset, slot_stride, content_size }
    }

    /// # Safety
    /// `base` must point at a region laid out by this layout, live for the
    /// duration of the returned reference's use.
    pub unsafe fn guard_value(&self, base: *const u8, index: SlotIndex) -> u32 {
        let ptr = base.add(index.0 as usize * 4) as *const AtomicU32;
        (*ptr).load(Ordering::Acquire)
    }

    /// # Safety
    /// Same as `guard_value`; the returned slice borrows the caller's
    /// mapping, not a `SlotLayout`-owned buffer.
    pub unsafe fn content<'a>(&self, base: *const u8, index: SlotIndex) -> &'a [u8] {
        let start = self.content_offset + index.0 as usize * self.slot_stride;
        std::slice::from_raw_parts(base.add(start), self.content_size)
    }
}

/// Tracks slot ownership and hands out `SlotToken`s. `total_slots` always
/// equals `free_list.len() + outstanding + in_flight` (the last term is
/// tracked by `BorrowedManager`, not here).
pub struct SlotManager {
    content: SlotContent,
    slot_stride: usize,
    content_size: usize,
    content_offset: usize,
    free_list: Vec<SlotIndex>,
    outstanding: usize,
    num_slots: usize,
}

impl SlotManager {
    pub fn new(num_slots: usize, content_size: usize, content_alignment: usize) -> Self {
        let slot_stride = Self::validate_and_stride(num_slots, content_size, content_alignment);
        let content_offset = Self::guard_table_len(num_slots, content_alignment);
        let content = SlotContent::Owned(vec![0u8; content_offset + slot_stride * num_slots].into_boxed_slice());
        Self::from_content(content, num_slots, content_size, slot_stride, content_offset)
    }

    /// Wraps a buffer allocated elsewhere (typically via `MemoryManager`) so
    /// its bytes can be shared with receivers through an exchange handle.
    ///
    /// # Safety
    /// `base` must point to at least `region_size(content_size,
    /// content_alignment) * num_slots` writable bytes, 4-byte aligned,
    /// exclusively owned by this `SlotManager` for as long as it's alive.
    /// The caller must keep the underlying allocation (e.g. the
    /// `ReadWritableMemory` it came from) alive for at least as long.
    pub unsafe fn new_at_raw(base: *mut u8, num_slots: usize, content_size: usize, content_alignment: usize) -> Self {
        let slot_stride = Self::validate_and_stride(num_slots, content_size, content_alignment);
        let content_offset = Self::guard_table_len(num_slots, content_alignment);
        std::ptr::write_bytes(base, 0, content_offset + slot_stride * num_slots);
        Self::from_content(SlotContent::Raw(base), num_slots, content_size, slot_stride, content_offset)
    }

    pub(crate) fn validate_and_stride(num_slots: usize, content_size: usize, content_alignment: usize) -> usize {
        assert!(num_slots > 0, "number_slots must be > 0");
        assert!(content_size > 0, "slot_content_size must be > 0");
        assert!(content_alignment > 0 && content_alignment.is_power_of_two(), "slot_content_alignment must be a power of two > 0");
        content_size.div_ceil(content_alignment) * content_alignment
    }

    /// Byte length of the guard table, rounded up so the content array that
    /// follows it starts aligned. `content_alignment` is always a power of
    /// two, so this only ever pads up to `content_alignment - 1` bytes.
    pub(crate) fn guard_table_len(num_slots: usize, content_alignment: usize) -> usize {
        let alignment = content_alignment.max(4);
        (num_slots * 4).div_ceil(alignment) * alignment
    }

    fn from_content(content: SlotContent, num_slots: usize, content_size: usize, slot_stride: usize, content_offset: usize) -> Self {
        let free_list = (0..num_slots as u32).rev().map(SlotIndex).collect();

        Self {
            content,
            slot_stride,
            content_size,
            content_offset,
            free_list,
            outstanding: 0,
            num_slots,
        }
    }

    /// Total byte size of the region for `num_slots` slots of the given
    /// size/alignment, guard table included — what the Server asks the
    /// Memory Manager to allocate before calling `new_at_raw`. The
    /// allocation's own alignment must be at least 4, since the guard table
    /// sits at offset zero.
    pub fn region_size(num_slots: usize, content_size: usize, content_alignment: usize) -> usize {
        let slot_stride = Self::validate_and_stride(num_slots, content_size, content_alignment);
        Self::guard_table_len(num_slots, content_alignment) + slot_stride * num_slots
    }

    fn base_ptr(&self) -> *mut u8 {
        match &self.content {
            SlotContent::Owned(bytes) => bytes.as_ptr() as *mut u8,
            SlotContent::Raw(ptr) => *ptr,
        }
    }

    fn guard_ptr(&self, index: SlotIndex) -> *const AtomicU32 {
        unsafe { self.base_ptr().add(index.0 as usize * 4) as *const AtomicU32 }
    }

    pub fn total_slots(&self) -> usize {
        self.num_slots
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn outstanding_tokens(&self) -> usize {
        self.outstanding
    }

    /// Pops from the free list. `None` if exhausted.
    pub fn acquire(&mut self) -> Option<SlotToken> {
        let index = self.free_list.pop()?;
        self.outstanding += 1;
        Some(SlotToken::new(index))
    }

    /// Returns a held token to the free list without ever sending it
    /// (`UnacquireSlot`). No-op on class counters and borrow counts, since
    /// the slot was never handed to the Logic Server.
    pub fn release(&mut self, token: SlotToken) {
        let index = token.take();
        self.outstanding -= 1;
        self.bump_guard(index);
        self.free_list.push(index);
    }

    /// Called by the Logic Server when a send consumes the token (whether it
    /// goes in-flight or bounces straight back to Free because no receiver
    /// took it).
    pub(crate) fn take_for_send(&mut self, token: SlotToken) -> SlotIndex {
        let index = token.take();
        self.outstanding -= 1;
        index
    }

    /// Returns a slot to the free list once its borrow count has reached
    /// zero. Bumps the guard field so any receiver still holding a stale
    /// reference observes a mismatch on next access.
    pub(crate) fn reclaim_to_free(&mut self, index: SlotIndex) {
        self.bump_guard(index);
        self.free_list.push(index);
    }

    fn bump_guard(&self, index: SlotIndex) {
        unsafe { &*self.guard_ptr(index) }.fetch_add(1, Ordering::Release);
    }

    pub fn guard_value(&self, index: SlotIndex) -> u32 {
        unsafe { &*self.guard_ptr(index) }.load(Ordering::Acquire)
    }

    fn offset_of(&self, index: SlotIndex) -> usize {
        self.content_offset + index.0 as usize * self.slot_stride
    }

    /// Read-write view into the slot's content region, for the token holder.
    pub fn access(&mut self, token: &SlotToken) -> &mut [u8] {
        let start = self.offset_of(token.index());
        unsafe { std::slice::from_raw_parts_mut(self.base_ptr().add(start), self.content_size) }
    }

    /// Read-only view into a slot's content region, for a receiver that has
    /// not reclaimed it yet and whose guard value still matches.
    pub fn access_ro(&self, index: SlotIndex) -> &[u8] {
        let start = self.offset_of(index);
        unsafe { std::slice::from_raw_parts(self.base_ptr().add(start), self.content_size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_is_noop_on_counts() {
        let mut mgr = SlotManager::new(4, 64, 8);
        assert_eq!(mgr.free_count(), 4);
        let token = mgr.acquire().unwrap();
        assert_eq!(mgr.free_count(), 3);
        assert_eq!(mgr.outstanding_tokens(), 1);
        mgr.release(token);
        assert_eq!(mgr.free_count(), 4);
        assert_eq!(mgr.outstanding_tokens(), 0);
    }

    #[test]
    fn acquire_exhausts_then_refills_after_reclaim() {
        let mut mgr = SlotManager::new(2, 16, 8);
        let t0 = mgr.acquire().unwrap();
        let t1 = mgr.acquire().unwrap();
        assert!(mgr.acquire().is_none());
        let idx0 = mgr.take_for_send(t0);
        mgr.release(t1);
        assert_eq!(mgr.free_count(), 1);
        mgr.reclaim_to_free(idx0);
        assert_eq!(mgr.free_count(), 2);
        assert!(mgr.acquire().is_some());
        assert!(mgr.acquire().is_some());
    }

    #[test]
    fn invariant_total_equals_free_plus_outstanding_plus_in_flight() {
        let mut mgr = SlotManager::new(5, 16, 8);
        let mut tokens = Vec::new();
        for _ in 0..3 {
            tokens.push(mgr.acquire().unwrap());
        }
        let in_flight = 0; // nothing sent yet in this unit test
        assert_eq!(mgr.total_slots(), mgr.free_count() + mgr.outstanding_tokens() + in_flight);
        for t in tokens {
            mgr.release(t);
        }
    }

    #[test]
    #[should_panic(expected = "outstanding tokens must be returned")]
    fn dropping_an_unconsumed_token_aborts() {
        let mut mgr = SlotManager::new(1, 16, 8);
        let _token = mgr.acquire().unwrap();
        // _token intentionally dropped without release()/take_for_send().
    }

    #[test]
    fn guard_value_changes_on_reclaim() {
        let mut mgr = SlotManager::new(1, 16, 8);
        let token = mgr.acquire().unwrap();
        let index = token.index();
        let before = mgr.guard_value(index);
        let idx = mgr.take_for_send(token);
        mgr.reclaim_to_free(idx);
        assert_ne!(before, mgr.guard_value(index));
    }
}
