// SPDX-License-Identifier: MIT
//! Debug-gated diagnostic sink.
//!
//! Internal failures are never surfaced to the host; this sink is the only
//! observable signal of them. When the client is constructed with
//! `debug: false`, everything except [`DebugSink::warn_always`] is dropped.
//! The host owns the `tracing` subscriber; this module only decides whether
//! a line is emitted at all.

/// Leveled sink over the `tracing` macros, gated on the `debug` config flag.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DebugSink {
    enabled: bool,
}

impl DebugSink {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn debug(&self, message: &str) {
        if self.enabled {
            tracing::debug!("{message}");
        }
    }

    pub fn info(&self, message: &str) {
        if self.enabled {
            tracing::info!("{message}");
        }
    }

    pub fn warn(&self, message: &str) {
        if self.enabled {
            tracing::warn!("{message}");
        }
    }

    pub fn error(&self, message: &str) {
        if self.enabled {
            tracing::error!("{message}");
        }
    }

    /// Emitted regardless of the debug flag. Reserved for conditions the
    /// host should see even with diagnostics off, e.g. the disk-to-memory
    /// spool fallback.
    pub fn warn_always(&self, message: &str) {
        tracing::warn!("{message}");
    }
}
