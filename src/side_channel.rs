// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Abstract duplex control link used only for handshake and notifications,
// never for payload. Two implementations ship here: an in-process one for
// same-process wiring and tests, and a Unix-domain-socket one for real
// cross-process use.

use std::io;
use std::sync::mpsc;
use std::sync::Mutex;

use crate::wire::Frame;

/// A non-blocking duplex side channel. `try_recv` is polled by the reactor;
/// it must never block for long, matching §5's "hot path never blocks"
/// guarantee (the side channel may briefly block at the OS level only for
/// small control frames, never for slot transport).
pub trait SideChannel: Send {
    fn send(&self, frame: Frame) -> io::Result<()>;
    fn try_recv(&self) -> io::Result<Option<Frame>>;
}

/// An `std::sync::mpsc`-backed duplex pair. Used by integration tests and
/// any same-process wiring, where no real byte-stream transport is needed.
pub struct InProcessSideChannel {
    tx: mpsc::Sender<Frame>,
    rx: Mutex<mpsc::Receiver<Frame>>,
}

impl InProcessSideChannel {
    /// Creates a connected pair: `(server_end, client_end)`.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        (
            Self { tx: tx_a, rx: Mutex::new(rx_b) },
            Self { tx: tx_b, rx: Mutex::new(rx_a) },
        )
    }
}

impl SideChannel for InProcessSideChannel {
    fn send(&self, frame: Frame) -> io::Result<()> {
        self.tx.send(frame).map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped its side channel end"))
    }

    fn try_recv(&self) -> io::Result<Option<Frame>> {
        let rx = self.rx.lock().unwrap();
        match rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped its side channel end")),
        }
    }
}

/// A `UnixStream`-backed side channel using the length-prefixed frame codec
/// of §6, for genuine cross-process use.
#[cfg(unix)]
pub struct UnixSideChannel {
    stream: std::os::unix::net::UnixStream,
}

#[cfg(unix)]
impl UnixSideChannel {
    pub fn new(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }

    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::new(a)?, Self::new(b)?))
    }
}

// Frames are small control messages (a handful of bytes to a few hundred),
// well under typical local socket buffering, so a `WouldBlock` is only ever
// expected between frames, not mid-frame; this does not reassemble a frame
// split across non-blocking reads.
#[cfg(unix)]
impl SideChannel for UnixSideChannel {
    fn send(&self, frame: Frame) -> io::Result<()> {
        let stream = &self.stream;
        stream.set_nonblocking(false)?;
        let result = crate::wire::write_frame(stream, &frame);
        let _ = stream.set_nonblocking(true);
        result
    }

    fn try_recv(&self) -> io::Result<Option<Frame>> {
        match crate::wire::read_frame(&self.stream) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed the side channel"))
            }
            Err(e) => Err(e),
        }
    }
}
