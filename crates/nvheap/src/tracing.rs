//! Heap tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for region management, superblock minting and
//! crash recovery.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::config::RegionIndex;
    use crate::error::Error;
    use crate::metrics::RecoveryMetrics;

    /// Recovery phases (mark/rebuild).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RecoveryPhase {
        /// Trace the reachable graph from the roots.
        Mark,
        /// Rebuild free lists, anchors and list heads.
        Rebuild,
    }

    /// Stable identifier for a recovery run.
    ///
    /// Correlates all events of one run. A process-wide counter starting
    /// at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecoveryId(pub u64);

    static NEXT_RECOVERY_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique recovery ID.
    pub fn next_recovery_id() -> RecoveryId {
        RecoveryId(NEXT_RECOVERY_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire recovery.
    pub fn trace_recovery(id: RecoveryId) -> span::EnteredSpan {
        span!(Level::INFO, "heap_recover", recovery_id = id.0).entered()
    }

    /// Create a span for a recovery phase.
    pub fn trace_phase(phase: RecoveryPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "recovery_phase", phase = ?phase).entered()
    }

    pub fn log_recovery_complete(id: RecoveryId, metrics: &RecoveryMetrics) {
        tracing::info!(
            recovery_id = id.0,
            roots = metrics.roots_traced,
            blocks_marked = metrics.blocks_marked,
            superblocks_kept = metrics.superblocks_kept(),
            slots_freed = metrics.slots_freed,
            duration_us = u64::try_from(metrics.duration.as_micros()).unwrap_or(u64::MAX),
            "recovery_complete"
        );
    }

    pub fn log_region_created(index: RegionIndex, len: usize) {
        tracing::debug!(region = ?index, len, "region_created");
    }

    pub fn log_region_remapped(index: RegionIndex, len: usize, used: usize) {
        tracing::debug!(region = ?index, len, used, "region_remapped");
    }

    pub fn log_out_of_space(index: RegionIndex, requested: usize) {
        tracing::warn!(region = ?index, requested, "region_out_of_space");
    }

    pub fn log_superblock_minted(head: u32, span: usize) {
        tracing::trace!(head, span, "superblock_minted");
    }

    pub fn log_heap_opened(id: &str, restart: bool, dirty: bool) {
        if dirty {
            tracing::warn!(heap = id, "dirty_restart");
        }
        tracing::info!(heap = id, restart, "heap_opened");
    }

    pub fn log_heap_closed(id: &str, dirty: bool) {
        tracing::info!(heap = id, dirty, "heap_closed");
    }

    pub fn log_writeback_failed(err: &Error) {
        tracing::error!(error = %err, "writeback_failed");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use crate::config::RegionIndex;
    use crate::error::Error;
    use crate::metrics::RecoveryMetrics;

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RecoveryPhase {
        Mark,
        Rebuild,
    }

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecoveryId(pub u64);

    pub fn next_recovery_id() -> RecoveryId {
        RecoveryId(0)
    }

    pub fn trace_recovery(_id: RecoveryId) {}

    pub fn trace_phase(_phase: RecoveryPhase) {}

    pub fn log_recovery_complete(_id: RecoveryId, _metrics: &RecoveryMetrics) {}

    pub fn log_region_created(_index: RegionIndex, _len: usize) {}

    pub fn log_region_remapped(_index: RegionIndex, _len: usize, _used: usize) {}

    pub fn log_out_of_space(_index: RegionIndex, _requested: usize) {}

    pub fn log_superblock_minted(_head: u32, _span: usize) {}

    pub fn log_heap_opened(_id: &str, _restart: bool, _dirty: bool) {}

    pub fn log_heap_closed(_id: &str, _dirty: bool) {}

    pub fn log_writeback_failed(_err: &Error) {}
}

pub use internal::RecoveryId;
