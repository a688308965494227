//! Recovery metrics and statistics.

use std::time::Duration;

/// Statistics from the recovery run by this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryMetrics {
    /// Duration of the whole recovery, write-back included.
    pub duration: Duration,
    /// Duration of the mark phase.
    pub mark_duration: Duration,
    /// Duration of the rebuild phase.
    pub rebuild_duration: Duration,
    /// Number of non-null roots traced.
    pub roots_traced: usize,
    /// Number of blocks found reachable.
    pub blocks_marked: usize,
    /// Superblocks kept with no free block.
    pub superblocks_full: usize,
    /// Superblocks kept with some free blocks.
    pub superblocks_partial: usize,
    /// Slots returned to the free lists.
    pub slots_freed: usize,
}

impl Default for RecoveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryMetrics {
    /// Create a new `RecoveryMetrics` with all fields set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::from_secs(0),
            mark_duration: Duration::from_secs(0),
            rebuild_duration: Duration::from_secs(0),
            roots_traced: 0,
            blocks_marked: 0,
            superblocks_full: 0,
            superblocks_partial: 0,
            slots_freed: 0,
        }
    }

    /// Superblocks that survived recovery.
    #[must_use]
    pub const fn superblocks_kept(&self) -> usize {
        self.superblocks_full + self.superblocks_partial
    }
}
