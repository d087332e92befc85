// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Logging collaborator for configuration delivery components.
//!
//! Components like [`ConfigWriter`](crate::writer::ConfigWriter) and
//! [`Publisher`](crate::proxy::Publisher) report progress through a
//! [`Logger`] handed to them by the caller. Leaving the logger out only
//! silences that output; control flow never depends on it.

use std::sync::Arc;

/// Sink for component progress messages.
pub trait Logger: Send + Sync {
    /// Report fine-grained progress.
    fn debug(&self, message: &str);

    /// Report a recoverable problem.
    fn warning(&self, message: &str);

    /// Report a failure that is about to be returned to the caller.
    fn error(&self, message: &str);
}

/// Logger that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn debug(&self, _: &str) {}

    fn warning(&self, _: &str) {}

    fn error(&self, _: &str) {}
}

/// Logger that forwards messages to the global [`tracing`] subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str) {
        tracing::debug!("{message}");
    }

    fn warning(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }
}

/// Shared logger handle.
pub type SharedLogger = Arc<dyn Logger>;

/// Handle to the no-op logger.
pub fn noop() -> SharedLogger {
    Arc::new(NoopLogger)
}
