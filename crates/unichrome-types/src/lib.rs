//! Shared types for the UniChrome memory-management and submission engine.
//!
//! This crate carries the pieces every layer agrees on: the error taxonomy
//! surfaced to callers, the placement/caching flag sets, engine identifiers
//! and fence-type masks, and the wrap-tolerant sequence-age helpers that all
//! fence and ring-tracker comparisons must go through.
#![forbid(unsafe_code)]

pub mod error;
pub mod placement;
pub mod seq;

pub use error::Error;
pub use placement::{MemDomain, PlacementFlags};
pub use seq::{seq_age, seq_passed, SEQ_HALF_RANGE};

use bitflags::bitflags;

/// Independent hardware execution contexts, each with its own sequence space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineId {
    /// The main command processor fed by the ring.
    Cmd,
    /// Scatter-gather DMA blit engines.
    Blit0,
    Blit1,
    Blit2,
    Blit3,
    /// Video ordering classes. These have no ring of their own; they exist as
    /// fence classes so barrier ordering can be expressed against them.
    Hqv0,
    Hqv1,
    Mpeg0,
    Mpeg1,
}

impl EngineId {
    pub const COUNT: usize = 9;

    pub const ALL: [EngineId; Self::COUNT] = [
        EngineId::Cmd,
        EngineId::Blit0,
        EngineId::Blit1,
        EngineId::Blit2,
        EngineId::Blit3,
        EngineId::Hqv0,
        EngineId::Hqv1,
        EngineId::Mpeg0,
        EngineId::Mpeg1,
    ];

    pub fn index(self) -> usize {
        match self {
            EngineId::Cmd => 0,
            EngineId::Blit0 => 1,
            EngineId::Blit1 => 2,
            EngineId::Blit2 => 3,
            EngineId::Blit3 => 4,
            EngineId::Hqv0 => 5,
            EngineId::Hqv1 => 6,
            EngineId::Mpeg0 => 7,
            EngineId::Mpeg1 => 8,
        }
    }

    pub fn blit(engine: usize) -> Option<EngineId> {
        match engine {
            0 => Some(EngineId::Blit0),
            1 => Some(EngineId::Blit1),
            2 => Some(EngineId::Blit2),
            3 => Some(EngineId::Blit3),
            _ => None,
        }
    }
}

bitflags! {
    /// Completion conditions a fence can track.
    ///
    /// `EXE` means the engine has executed past the fence's sequence point;
    /// the video bits track the corresponding decode/scaler unit instead.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FenceTypes: u32 {
        const EXE = 1 << 0;
        const HQV0 = 1 << 1;
        const HQV1 = 1 << 2;
        const MPEG0 = 1 << 3;
        const MPEG1 = 1 << 4;
    }
}

impl FenceTypes {
    /// Barrier ordering classes, in slot order.
    pub const BARRIER_CLASSES: [FenceTypes; 4] = [
        FenceTypes::HQV0,
        FenceTypes::HQV1,
        FenceTypes::MPEG0,
        FenceTypes::MPEG1,
    ];

    /// Barrier slot index for a single ordering-class bit, if this mask
    /// contains exactly one such class.
    pub fn barrier_slot(self) -> Option<usize> {
        Self::BARRIER_CLASSES
            .iter()
            .position(|class| self.contains(*class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_indices_are_dense_and_unique() {
        let mut seen = [false; EngineId::COUNT];
        for engine in EngineId::ALL {
            let idx = engine.index();
            assert!(!seen[idx]);
            seen[idx] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn blit_engine_lookup() {
        assert_eq!(EngineId::blit(0), Some(EngineId::Blit0));
        assert_eq!(EngineId::blit(3), Some(EngineId::Blit3));
        assert_eq!(EngineId::blit(4), None);
    }

    #[test]
    fn barrier_slot_maps_ordering_classes() {
        assert_eq!(FenceTypes::HQV0.barrier_slot(), Some(0));
        assert_eq!(FenceTypes::MPEG1.barrier_slot(), Some(3));
        assert_eq!(FenceTypes::EXE.barrier_slot(), None);
    }
}
