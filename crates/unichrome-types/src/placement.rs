//! Placement domains and caching attributes for buffer objects.

use bitflags::bitflags;

bitflags! {
    /// Where a buffer may live and how its pages are mapped.
    ///
    /// The low nibble selects memory domains, the next group caching
    /// attributes. A request may name several domains; validation picks the
    /// cheapest one that can be satisfied.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PlacementFlags: u32 {
        const VRAM = 1 << 0;
        /// AGP/GART translated aperture.
        const TT = 1 << 1;
        /// Private fixed AGP pool (region 0).
        const PRIV0 = 1 << 2;
        const SYSTEM = 1 << 3;

        const CACHED = 1 << 8;
        const WC = 1 << 9;
        const UNCACHED = 1 << 10;

        /// Never evict to satisfy someone else's validation.
        const NO_EVICT = 1 << 16;
    }
}

impl PlacementFlags {
    pub const DOMAIN_MASK: PlacementFlags = PlacementFlags::VRAM
        .union(PlacementFlags::TT)
        .union(PlacementFlags::PRIV0)
        .union(PlacementFlags::SYSTEM);

    pub const CACHING_MASK: PlacementFlags = PlacementFlags::CACHED
        .union(PlacementFlags::WC)
        .union(PlacementFlags::UNCACHED);

    pub fn domains(self) -> PlacementFlags {
        self & Self::DOMAIN_MASK
    }

    pub fn caching(self) -> PlacementFlags {
        self & Self::CACHING_MASK
    }
}

/// A concrete memory domain a buffer is resident in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemDomain {
    Vram,
    Tt,
    Priv0,
    System,
}

impl MemDomain {
    pub const COUNT: usize = 4;

    pub const ALL: [MemDomain; Self::COUNT] = [
        MemDomain::Vram,
        MemDomain::Tt,
        MemDomain::Priv0,
        MemDomain::System,
    ];

    pub fn index(self) -> usize {
        match self {
            MemDomain::Vram => 0,
            MemDomain::Tt => 1,
            MemDomain::Priv0 => 2,
            MemDomain::System => 3,
        }
    }

    pub fn flag(self) -> PlacementFlags {
        match self {
            MemDomain::Vram => PlacementFlags::VRAM,
            MemDomain::Tt => PlacementFlags::TT,
            MemDomain::Priv0 => PlacementFlags::PRIV0,
            MemDomain::System => PlacementFlags::SYSTEM,
        }
    }

    /// Domains matching a request mask, cheapest first (fixed pool, then
    /// VRAM, then the translated aperture, then plain system pages).
    pub fn candidates(flags: PlacementFlags) -> impl Iterator<Item = MemDomain> {
        [
            MemDomain::Priv0,
            MemDomain::Vram,
            MemDomain::Tt,
            MemDomain::System,
        ]
        .into_iter()
        .filter(move |d| flags.contains(d.flag()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_and_caching_masks_partition_requests() {
        let flags = PlacementFlags::VRAM | PlacementFlags::TT | PlacementFlags::WC;
        assert_eq!(flags.domains(), PlacementFlags::VRAM | PlacementFlags::TT);
        assert_eq!(flags.caching(), PlacementFlags::WC);
    }

    #[test]
    fn candidates_prefer_cheapest_domain() {
        let flags = PlacementFlags::VRAM | PlacementFlags::SYSTEM;
        let order: Vec<_> = MemDomain::candidates(flags).collect();
        assert_eq!(order, vec![MemDomain::Vram, MemDomain::System]);

        let all = PlacementFlags::DOMAIN_MASK;
        let order: Vec<_> = MemDomain::candidates(all).collect();
        assert_eq!(
            order,
            vec![
                MemDomain::Priv0,
                MemDomain::Vram,
                MemDomain::Tt,
                MemDomain::System
            ]
        );
    }
}
