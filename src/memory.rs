// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Allocates/maps the memory backing slots and queues, and produces the
// exchange handles the side channel hands to the peer. Technology-agnostic
// above this layer: everything upstream works in terms of (Memory, View)
// pairs, never raw OS primitives directly.

use std::alloc::Layout;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::shm::{ShmHandle, ShmOpenMode};
use crate::shm_name::make_shm_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTechnology {
    /// Peer lives in the same process; the exchange handle carries the
    /// allocation directly. Used by tests and same-process wiring.
    InProcess,
    /// Peer lives in a different process; the exchange handle carries a
    /// named shared-memory segment the peer opens by name.
    SharedMemory,
}

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(1);

fn generate_segment_name() -> String {
    let id = NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed);
    make_shm_name(&format!("memcon_{}_{id}", std::process::id()))
}

struct InProcessRegion {
    ptr: *mut u8,
    layout: Layout,
}

impl Drop for InProcessRegion {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

unsafe impl Send for InProcessRegion {}
unsafe impl Sync for InProcessRegion {}

/// Serializable reference to a region that the peer can map to obtain its
/// own view of the same physical memory.
#[derive(Clone)]
pub enum MemoryExchangeHandle {
    InProcess { region: Arc<InProcessRegion>, size: usize },
    SharedMemory { name: String, size: usize },
}

impl MemoryExchangeHandle {
    pub fn size(&self) -> usize {
        match self {
            MemoryExchangeHandle::InProcess { size, .. } => *size,
            MemoryExchangeHandle::SharedMemory { size, .. } => *size,
        }
    }
}

enum Keepalive {
    InProcess(Arc<InProcessRegion>),
    SharedMemory(Arc<ShmHandle>),
}

pub struct ReadWritableMemory {
    base: *mut u8,
    len: usize,
    _keepalive: Keepalive,
}

impl ReadWritableMemory {
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, self.len) }
    }
}

unsafe impl Send for ReadWritableMemory {}
unsafe impl Sync for ReadWritableMemory {}

pub struct ReadableMemory {
    base: *const u8,
    len: usize,
    _keepalive: Keepalive,
}

impl ReadableMemory {
    pub fn as_ptr(&self) -> *const u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }
}

unsafe impl Send for ReadableMemory {}
unsafe impl Sync for ReadableMemory {}

pub struct MemoryManager {
    technology: MemoryTechnology,
}

impl MemoryManager {
    pub fn new(technology: MemoryTechnology) -> Self {
        Self { technology }
    }

    pub fn technology(&self) -> MemoryTechnology {
        self.technology
    }

    pub fn allocate_writable(&self, size: usize, alignment: usize) -> io::Result<(ReadWritableMemory, MemoryExchangeHandle)> {
        assert!(size > 0, "allocation size must be > 0");
        assert!(alignment > 0 && alignment.is_power_of_two(), "alignment must be a power of two > 0");

        match self.technology {
            MemoryTechnology::InProcess => {
                let layout = Layout::from_size_align(size, alignment).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
                if ptr.is_null() {
                    return Err(io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"));
                }
                let region = Arc::new(InProcessRegion { ptr, layout });
                let memory = ReadWritableMemory { base: ptr, len: size, _keepalive: Keepalive::InProcess(region.clone()) };
                let handle = MemoryExchangeHandle::InProcess { region, size };
                Ok((memory, handle))
            }
            MemoryTechnology::SharedMemory => {
                let name = generate_segment_name();
                let shm = ShmHandle::acquire(&name, size, ShmOpenMode::Create)?;
                let shm = Arc::new(shm);
                let memory = ReadWritableMemory { base: shm.as_mut_ptr(), len: size, _keepalive: Keepalive::SharedMemory(shm.clone()) };
                let handle = MemoryExchangeHandle::SharedMemory { name, size };
                Ok((memory, handle))
            }
        }
    }

    pub fn map_readable(&self, handle: &MemoryExchangeHandle) -> io::Result<ReadableMemory> {
        match handle {
            MemoryExchangeHandle::InProcess { region, size } => {
                Ok(ReadableMemory { base: region.ptr, len: *size, _keepalive: Keepalive::InProcess(region.clone()) })
            }
            MemoryExchangeHandle::SharedMemory { name, size } => {
                let shm = ShmHandle::acquire(name, *size, ShmOpenMode::Open)?;
                let shm = Arc::new(shm);
                Ok(ReadableMemory { base: shm.as_ptr(), len: *size, _keepalive: Keepalive::SharedMemory(shm) })
            }
        }
    }

    /// Maps a peer-allocated region read-write. The slot content region is
    /// genuinely read-only on the receiver side (`map_readable`), but SPSC
    /// queue memory needs a writable view on both ends regardless of who
    /// allocated it — the consumer writes `head` into the same bytes the
    /// producer writes `tail` into. The underlying OS mapping is already
    /// read-write either way; this only changes which Rust-level API the
    /// caller gets.
    pub fn map_writable(&self, handle: &MemoryExchangeHandle) -> io::Result<ReadWritableMemory> {
        match handle {
            MemoryExchangeHandle::InProcess { region, size } => {
                Ok(ReadWritableMemory { base: region.ptr, len: *size, _keepalive: Keepalive::InProcess(region.clone()) })
            }
            MemoryExchangeHandle::SharedMemory { name, size } => {
                let shm = ShmHandle::acquire(name, *size, ShmOpenMode::Open)?;
                let shm = Arc::new(shm);
                Ok(ReadWritableMemory { base: shm.as_mut_ptr(), len: *size, _keepalive: Keepalive::SharedMemory(shm) })
            }
        }
    }
}
