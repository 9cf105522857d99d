//! Device-wide counters, cheap enough to keep always-on.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MmStats {
    pub creations: AtomicU64,
    pub destructions: AtomicU64,
    pub validations: AtomicU64,
    pub moves_null: AtomicU64,
    pub moves_blit: AtomicU64,
    pub moves_staged: AtomicU64,
    pub moves_memcpy: AtomicU64,
    pub evictions: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MmStatsSnapshot {
    pub creations: u64,
    pub destructions: u64,
    pub validations: u64,
    pub moves_null: u64,
    pub moves_blit: u64,
    pub moves_staged: u64,
    pub moves_memcpy: u64,
    pub evictions: u64,
}

impl MmStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MmStatsSnapshot {
        MmStatsSnapshot {
            creations: self.creations.load(Ordering::Relaxed),
            destructions: self.destructions.load(Ordering::Relaxed),
            validations: self.validations.load(Ordering::Relaxed),
            moves_null: self.moves_null.load(Ordering::Relaxed),
            moves_blit: self.moves_blit.load(Ordering::Relaxed),
            moves_staged: self.moves_staged.load(Ordering::Relaxed),
            moves_memcpy: self.moves_memcpy.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
