// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pluggable logging sink. The core never hard-wires a logging framework;
// Server/Client hold one `Arc<dyn LogSink>` and route every internal event
// through it so callers can redirect, capture, or silence it entirely.

use std::panic::Location;
use std::sync::Arc;

use crate::handle::ContextId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, context: ContextId, message: &str, location: &'static Location<'static>);
}

/// Forwards every event to `tracing`, tagging the receiver/client context id
/// as a structured field so multiplexed logs stay attributable.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, context: ContextId, message: &str, location: &'static Location<'static>) {
        let ctx = context.0;
        let file = location.file();
        let line = location.line();
        match level {
            LogLevel::Trace => tracing::trace!(ctx, file, line, "{message}"),
            LogLevel::Debug => tracing::debug!(ctx, file, line, "{message}"),
            LogLevel::Info => tracing::info!(ctx, file, line, "{message}"),
            LogLevel::Warn => tracing::warn!(ctx, file, line, "{message}"),
            LogLevel::Error => tracing::error!(ctx, file, line, "{message}"),
        }
    }
}

/// Discards every event. Used by benchmarks so logging never perturbs timing.
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _level: LogLevel, _context: ContextId, _message: &str, _location: &'static Location<'static>) {}
}

pub(crate) fn default_sink() -> Arc<dyn LogSink> {
    Arc::new(TracingSink)
}

/// Emits through a sink, capturing the caller's location like `tracing`'s own
/// macros do. Kept as a macro so `Location::caller()` resolves to the call
/// site rather than here.
macro_rules! log_event {
    ($sink:expr, $level:expr, $ctx:expr, $($arg:tt)*) => {
        $sink.log($level, $ctx, &format!($($arg)*), std::panic::Location::caller())
    };
}

pub(crate) use log_event;
