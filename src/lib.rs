// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Zero-copy shared-memory message transport. A Server hands fixed-size slots
// to any number of Receivers over shared (or, for same-process use,
// in-process) memory; a small side-channel protocol carries only the
// handshake and control frames, never payload. Receiver-class admission
// limits and a connection state machine per receiver keep one misbehaving
// or saturated peer from affecting anyone else.

pub mod shm_name;

mod platform;

pub mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

pub mod error;
pub use error::{ErrorCode, MemConError, MemConResult, ReceiverState};

pub mod handle;
pub use handle::{ClassHandle, ContextId, GroupId, ReceiverHandle, ReceiverId, ReceiverIndex, SlotHandle, SlotIndex};

pub mod log;
pub use log::{LogLevel, LogSink, NullSink, TracingSink};

pub mod memory;
pub use memory::{MemoryExchangeHandle, MemoryManager, MemoryTechnology, ReadWritableMemory, ReadableMemory};

pub mod queue;
pub use queue::{QueueEntry, QueueMemoryConfig, RegionSpec, SpscQueue};

pub mod wire;
pub use wire::{Frame, SlotMemoryConfig};

pub mod side_channel;
pub use side_channel::{InProcessSideChannel, SideChannel};
#[cfg(unix)]
pub use side_channel::UnixSideChannel;

pub mod slot;
pub use slot::{SlotLayout, SlotManager, SlotToken};

mod class;
mod borrow;

pub mod logic;
pub use logic::{DroppedInfo, LogicServer};

pub mod fsm;
pub use fsm::{ClientFsm, ClientState, RemoteReceiverFsm, TransitionRequest};

pub mod server;
pub use server::{Server, ServerBuilder, StateTransitionCallback};

pub mod client;
pub use client::{Client, ClientBuilder, ClientStateTransitionCallback};
