// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Side-channel wire protocol (§6): a framed stream of small control
// messages, each `{type: u8, payload_length: u16, payload, optional memory
// exchange handle}`. All integers little-endian; sizes are `u64`.

use std::io::{self, Read, Write};

use crate::memory::MemoryExchangeHandle;
use crate::queue::QueueMemoryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMemoryConfig {
    pub num_slots: u64,
    pub slot_content_size: u64,
    pub slot_content_alignment: u64,
}

/// A control frame exchanged over the side channel. Payload shapes follow
/// §6 exactly; frames that carry an exchange handle embed it directly
/// rather than as a separate out-of-band step (this crate's
/// `MemoryExchangeHandle` is itself just a name+size for the shared-memory
/// technology, so no `SCM_RIGHTS`-style fd passing is needed).
#[derive(Debug, Clone)]
pub enum Frame {
    ConnectionRequest {
        slot_config: SlotMemoryConfig,
        to_receiver_queue_config: QueueMemoryConfig,
        slot_mem_handle: MemoryExchangeHandle,
        queue_mem_handle: MemoryExchangeHandle,
    },
    AckConnection {
        from_receiver_queue_config: QueueMemoryConfig,
        queue_mem_handle: MemoryExchangeHandle,
    },
    AckQueueInitialization,
    Notification,
    StartListening,
    StopListening,
    Shutdown,
    Termination,
}

impl Frame {
    pub fn type_tag(&self) -> u8 {
        match self {
            Frame::ConnectionRequest { .. } => 1,
            Frame::AckConnection { .. } => 2,
            Frame::AckQueueInitialization => 3,
            Frame::Notification => 4,
            Frame::StartListening => 5,
            Frame::StopListening => 6,
            Frame::Shutdown => 7,
            Frame::Termination => 8,
        }
    }
}

fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_region(out: &mut Vec<u8>, r: crate::queue::RegionSpec) {
    write_u64(out, r.offset);
    write_u64(out, r.size);
}

fn write_slot_config(out: &mut Vec<u8>, c: SlotMemoryConfig) {
    write_u64(out, c.num_slots);
    write_u64(out, c.slot_content_size);
    write_u64(out, c.slot_content_alignment);
}

fn write_queue_config(out: &mut Vec<u8>, c: QueueMemoryConfig) {
    write_region(out, c.head);
    write_region(out, c.tail);
    write_region(out, c.buffer);
}

/// Only the `SharedMemory` exchange handle variant is wire-encodable — an
/// `InProcess` handle only makes sense when both ends live in the same
/// address space, which by definition never needs a byte-stream transport.
fn write_exchange_handle(out: &mut Vec<u8>, handle: &MemoryExchangeHandle) -> io::Result<()> {
    match handle {
        MemoryExchangeHandle::SharedMemory { name, size } => {
            let name_bytes = name.as_bytes();
            out.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
            out.extend_from_slice(name_bytes);
            write_u64(out, *size as u64);
            Ok(())
        }
        MemoryExchangeHandle::InProcess { .. } => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "an in-process exchange handle cannot be serialized over a byte-stream side channel",
        )),
    }
}

/// Serializes a frame as `{type, payload_length, payload}`.
pub fn encode_frame(frame: &Frame) -> io::Result<Vec<u8>> {
    let mut payload = Vec::new();
    match frame {
        Frame::ConnectionRequest { slot_config, to_receiver_queue_config, slot_mem_handle, queue_mem_handle } => {
            write_slot_config(&mut payload, *slot_config);
            write_queue_config(&mut payload, *to_receiver_queue_config);
            write_exchange_handle(&mut payload, slot_mem_handle)?;
            write_exchange_handle(&mut payload, queue_mem_handle)?;
        }
        Frame::AckConnection { from_receiver_queue_config, queue_mem_handle } => {
            write_queue_config(&mut payload, *from_receiver_queue_config);
            write_exchange_handle(&mut payload, queue_mem_handle)?;
        }
        Frame::AckQueueInitialization | Frame::Notification | Frame::StartListening | Frame::StopListening | Frame::Shutdown | Frame::Termination => {}
    }

    if payload.len() > u16::MAX as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame payload too large"));
    }

    let mut out = Vec::with_capacity(3 + payload.len());
    out.push(frame.type_tag());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn read_u64(buf: &[u8], cursor: &mut usize) -> io::Result<u64> {
    let bytes = buf.get(*cursor..*cursor + 8).ok_or_else(too_short)?;
    *cursor += 8;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_region(buf: &[u8], cursor: &mut usize) -> io::Result<crate::queue::RegionSpec> {
    let offset = read_u64(buf, cursor)?;
    let size = read_u64(buf, cursor)?;
    Ok(crate::queue::RegionSpec { offset, size })
}

fn read_slot_config(buf: &[u8], cursor: &mut usize) -> io::Result<SlotMemoryConfig> {
    Ok(SlotMemoryConfig {
        num_slots: read_u64(buf, cursor)?,
        slot_content_size: read_u64(buf, cursor)?,
        slot_content_alignment: read_u64(buf, cursor)?,
    })
}

fn read_queue_config(buf: &[u8], cursor: &mut usize) -> io::Result<QueueMemoryConfig> {
    Ok(QueueMemoryConfig {
        head: read_region(buf, cursor)?,
        tail: read_region(buf, cursor)?,
        buffer: read_region(buf, cursor)?,
    })
}

fn read_exchange_handle(buf: &[u8], cursor: &mut usize) -> io::Result<MemoryExchangeHandle> {
    let len_bytes = buf.get(*cursor..*cursor + 2).ok_or_else(too_short)?;
    *cursor += 2;
    let len = u16::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
    let name_bytes = buf.get(*cursor..*cursor + len).ok_or_else(too_short)?;
    *cursor += len;
    let name = String::from_utf8(name_bytes.to_vec()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let size = read_u64(buf, cursor)? as usize;
    Ok(MemoryExchangeHandle::SharedMemory { name, size })
}

fn too_short() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "frame payload truncated")
}

/// Decodes a frame's payload given its type tag, for transports that already
/// split the 3-byte header from the payload themselves (see
/// `UnixSideChannel`).
pub fn decode_payload(type_tag: u8, payload: &[u8]) -> io::Result<Frame> {
    let mut cursor = 0usize;
    let frame = match type_tag {
        1 => {
            let slot_config = read_slot_config(payload, &mut cursor)?;
            let to_receiver_queue_config = read_queue_config(payload, &mut cursor)?;
            let slot_mem_handle = read_exchange_handle(payload, &mut cursor)?;
            let queue_mem_handle = read_exchange_handle(payload, &mut cursor)?;
            Frame::ConnectionRequest { slot_config, to_receiver_queue_config, slot_mem_handle, queue_mem_handle }
        }
        2 => {
            let from_receiver_queue_config = read_queue_config(payload, &mut cursor)?;
            let queue_mem_handle = read_exchange_handle(payload, &mut cursor)?;
            Frame::AckConnection { from_receiver_queue_config, queue_mem_handle }
        }
        3 => Frame::AckQueueInitialization,
        4 => Frame::Notification,
        5 => Frame::StartListening,
        6 => Frame::StopListening,
        7 => Frame::Shutdown,
        8 => Frame::Termination,
        other => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown frame type {other}"))),
    };
    Ok(frame)
}

/// Writes a length-prefixed frame to any `Write` (e.g. a `UnixStream`).
pub fn write_frame<W: Write>(mut w: W, frame: &Frame) -> io::Result<()> {
    let encoded = encode_frame(frame)?;
    w.write_all(&encoded)
}

/// Reads one length-prefixed frame from any `Read`. Blocks until a full
/// frame is available (or the stream is non-blocking and returns
/// `WouldBlock`).
pub fn read_frame<R: Read>(mut r: R) -> io::Result<Frame> {
    let mut header = [0u8; 3];
    r.read_exact(&mut header)?;
    let type_tag = header[0];
    let len = u16::from_le_bytes([header[1], header[2]]) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    decode_payload(type_tag, &payload)
}
